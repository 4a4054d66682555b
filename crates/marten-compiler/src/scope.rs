//! Scope chain: mechanical name→slot resolution over pre-analyzed scopes.

use rustc_hash::FxHashMap;

use crate::ast::BindingKind;

/// A variable binding.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Local slot index within the owning function.
    pub index: u16,
    /// Declaration kind.
    pub kind: BindingKind,
    /// Captured by some inner closure (parser-supplied).
    pub captured: bool,
    /// For lexical bindings: initializer has been compiled, so reads
    /// dominated by the declaration skip the TDZ guard.
    pub initialized: bool,
}

/// A lexical scope.
#[derive(Debug)]
pub struct Scope {
    /// Parent scope index (None for the outermost).
    pub parent: Option<usize>,
    /// Bindings in this scope.
    pub bindings: FxHashMap<String, Binding>,
    /// Is this a function-body scope.
    pub is_function: bool,
    /// Next local index, allocated at function-scope granularity.
    next_local: u16,
    /// Function nesting depth (0 = entry function).
    pub function_depth: usize,
}

/// Scope chain for one compilation.
#[derive(Debug, Default)]
pub struct ScopeChain {
    scopes: Vec<Scope>,
    current: Option<usize>,
}

/// Result of resolving an identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedBinding {
    /// Local slot in the current function.
    Local {
        /// Slot index.
        index: u16,
        /// Lexical binding not yet proven initialized (needs a TDZ guard).
        needs_tdz_check: bool,
        /// `const` binding (assignment is a compile error).
        is_const: bool,
    },
    /// Captured binding in an enclosing function.
    Upvalue {
        /// Local slot in the declaring function.
        index: u16,
        /// How many function boundaries up the declaration lives.
        depth: usize,
        /// `const` binding.
        is_const: bool,
    },
    /// Not declared anywhere: a global reference.
    Global(String),
}

impl ScopeChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a new scope.
    pub fn enter(&mut self, is_function: bool) {
        let (depth, parent) = match self.current {
            Some(idx) => {
                let d = self.scopes[idx].function_depth + usize::from(is_function);
                (d, Some(idx))
            }
            None => (0, None),
        };
        self.scopes.push(Scope {
            parent,
            bindings: FxHashMap::default(),
            is_function,
            next_local: 0,
            function_depth: depth,
        });
        self.current = Some(self.scopes.len() - 1);
    }

    /// Exit the current scope.
    pub fn exit(&mut self) {
        if let Some(idx) = self.current {
            self.current = self.scopes[idx].parent;
        }
    }

    /// Declare a binding in the current scope. Returns its local index, or
    /// `None` on redeclaration within the same scope.
    pub fn declare(&mut self, name: &str, kind: BindingKind, captured: bool) -> Option<u16> {
        let current_idx = self.current?;
        if self.scopes[current_idx].bindings.contains_key(name) {
            return None;
        }
        // Locals are numbered at the function-scope level so indices stay
        // valid after block scopes close.
        let function_idx = self.enclosing_function_scope(current_idx)?;
        let index = self.scopes[function_idx].next_local;
        self.scopes[function_idx].next_local += 1;

        self.scopes[current_idx].bindings.insert(
            name.to_string(),
            Binding {
                index,
                kind,
                captured,
                initialized: !kind.is_lexical(),
            },
        );
        Some(index)
    }

    /// Mark a lexical binding initialized (its declaration has compiled).
    pub fn mark_initialized(&mut self, name: &str) {
        let mut scope_idx = self.current;
        while let Some(idx) = scope_idx {
            if let Some(binding) = self.scopes[idx].bindings.get_mut(name) {
                binding.initialized = true;
                return;
            }
            scope_idx = self.scopes[idx].parent;
        }
    }

    /// Resolve an identifier against the chain.
    pub fn resolve(&self, name: &str) -> ResolvedBinding {
        let Some(mut scope_idx) = self.current else {
            return ResolvedBinding::Global(name.to_string());
        };
        let current_depth = self.scopes[scope_idx].function_depth;
        loop {
            let scope = &self.scopes[scope_idx];
            if let Some(binding) = scope.bindings.get(name) {
                let is_const = binding.kind == BindingKind::Const;
                if scope.function_depth == current_depth {
                    return ResolvedBinding::Local {
                        index: binding.index,
                        needs_tdz_check: binding.kind.is_lexical() && !binding.initialized,
                        is_const,
                    };
                }
                return ResolvedBinding::Upvalue {
                    index: binding.index,
                    depth: current_depth - scope.function_depth,
                    is_const,
                };
            }
            match scope.parent {
                Some(parent) => scope_idx = parent,
                None => return ResolvedBinding::Global(name.to_string()),
            }
        }
    }

    /// Captured bindings declared directly in the current scope, for
    /// CloseUpvalue emission at block exit.
    pub fn captured_in_current_scope(&self) -> Vec<u16> {
        let Some(idx) = self.current else {
            return Vec::new();
        };
        let mut out: Vec<u16> = self.scopes[idx]
            .bindings
            .values()
            .filter(|b| b.captured)
            .map(|b| b.index)
            .collect();
        out.sort_unstable();
        out
    }

    /// Locals allocated so far in the enclosing function scope.
    pub fn local_count(&self) -> u16 {
        self.current
            .and_then(|idx| self.enclosing_function_scope(idx))
            .map(|idx| self.scopes[idx].next_local)
            .unwrap_or(0)
    }

    fn enclosing_function_scope(&self, from: usize) -> Option<usize> {
        let mut idx = from;
        loop {
            if self.scopes[idx].is_function {
                return Some(idx);
            }
            idx = self.scopes[idx].parent?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_and_resolve_local() {
        let mut chain = ScopeChain::new();
        chain.enter(true);
        chain.declare("x", BindingKind::Var, false);
        chain.declare("y", BindingKind::Const, false);

        assert!(matches!(
            chain.resolve("x"),
            ResolvedBinding::Local {
                index: 0,
                needs_tdz_check: false,
                is_const: false
            }
        ));
        // Const binding before initialization needs the guard.
        assert!(matches!(
            chain.resolve("y"),
            ResolvedBinding::Local {
                index: 1,
                needs_tdz_check: true,
                is_const: true
            }
        ));
        chain.mark_initialized("y");
        assert!(matches!(
            chain.resolve("y"),
            ResolvedBinding::Local {
                needs_tdz_check: false,
                ..
            }
        ));
    }

    #[test]
    fn block_scope_shares_function_local_numbering() {
        let mut chain = ScopeChain::new();
        chain.enter(true);
        chain.declare("a", BindingKind::Var, false);
        chain.enter(false);
        let idx = chain.declare("b", BindingKind::Let, false).unwrap();
        assert_eq!(idx, 1);
        chain.exit();
        // b is out of scope; a remains.
        assert!(matches!(chain.resolve("a"), ResolvedBinding::Local { .. }));
        assert!(matches!(chain.resolve("b"), ResolvedBinding::Global(_)));
    }

    #[test]
    fn inner_function_sees_upvalue() {
        let mut chain = ScopeChain::new();
        chain.enter(true);
        chain.declare("x", BindingKind::Var, true);
        chain.enter(true);
        match chain.resolve("x") {
            ResolvedBinding::Upvalue { index, depth, .. } => {
                assert_eq!(index, 0);
                assert_eq!(depth, 1);
            }
            other => panic!("expected upvalue, got {other:?}"),
        }
    }

    #[test]
    fn undeclared_is_global() {
        let mut chain = ScopeChain::new();
        chain.enter(true);
        assert_eq!(
            chain.resolve("console"),
            ResolvedBinding::Global("console".to_string())
        );
    }

    #[test]
    fn redeclaration_is_rejected() {
        let mut chain = ScopeChain::new();
        chain.enter(true);
        assert!(chain.declare("x", BindingKind::Let, false).is_some());
        assert!(chain.declare("x", BindingKind::Let, false).is_none());
    }
}
