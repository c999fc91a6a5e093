//! Lexical scope table for code generation.
//!
//! Binds source names to the Cranelift variables holding their values while
//! a function body is lowered. Scopes nest: the root scope is the module,
//! the next level is the function (holding parameter bindings), and each
//! conditional branch pushes its own scope. Lookup walks innermost-out, so
//! inner bindings shadow outer ones.
//!
//! The table is created per compilation and owned by the top-level build
//! call; the handles it stores are non-owning references into the function
//! builder's variable storage.

use cranelift_codegen::ir::types::Type;
use cranelift_frontend::Variable;
use rustc_hash::FxHashMap;

/// A name binding: the Cranelift variable plus its value type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScopeValue {
    /// Backend variable handle
    pub var: Variable,
    /// Native type of the value
    pub ty: Type,
}

/// One lexical scope: a label plus its bindings.
#[derive(Debug)]
struct Scope {
    label: String,
    vars: FxHashMap<String, ScopeValue>,
}

/// Stack of nested scopes.
#[derive(Debug, Default)]
pub struct ScopeTable {
    scopes: Vec<Scope>,
}

impl ScopeTable {
    /// Create an empty table with no scopes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a new scope and return the dot-joined qualified path down to it,
    /// e.g. `module.udf.abs.i32.r_i32`.
    pub fn enter(&mut self, label: &str) -> String {
        self.scopes.push(Scope { label: label.to_string(), vars: FxHashMap::default() });
        self.qualified_path()
    }

    /// Pop the innermost scope, dropping its bindings.
    pub fn exit(&mut self) {
        let popped = self.scopes.pop();
        debug_assert!(popped.is_some(), "scope exit without matching enter");
    }

    /// Bind `name` in the current scope. Returns `false` without mutating
    /// anything if the name is already bound in this scope; callers must
    /// treat that as a fatal compile error.
    pub fn add_var(&mut self, name: &str, value: ScopeValue) -> bool {
        let scope = self.scopes.last_mut().expect("add_var with no open scope");
        if scope.vars.contains_key(name) {
            return false;
        }
        scope.vars.insert(name.to_string(), value);
        true
    }

    /// Resolve `name`, innermost scope first.
    pub fn resolve(&self, name: &str) -> Option<ScopeValue> {
        self.scopes.iter().rev().find_map(|s| s.vars.get(name).copied())
    }

    /// Dot-joined labels of all open scopes.
    pub fn qualified_path(&self) -> String {
        let labels: Vec<&str> = self.scopes.iter().map(|s| s.label.as_str()).collect();
        labels.join(".")
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }
}
