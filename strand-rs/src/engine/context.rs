//! Execution contexts and the process-wide scripting domain.
//!
//! Name resolution walks a fixed order that embedders must not reorder:
//! local scope (chained through per-call contexts up to the main context),
//! then instance members, then registered lookups, then the global domain.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use super::builtins::NativeFunction;
use super::error::{ErrorCode, ScriptError};
use super::value::{mask, Executable, ScriptValue};

pub type DomainRef = Rc<RefCell<ScriptingDomain>>;
pub type ContextRef = Rc<RefCell<ExecutionContext>>;

// ── Set flags ─────────────────────────────────────────────────────────────

/// Flags for [`ExecutionContext::set_member_by_name`].
pub mod setflags {
    /// Define the variable if absent.
    pub const CREATE: u8 = 0x01;
    /// Define if absent, but never overwrite an existing value.
    pub const ONLY_CREATE: u8 = 0x02;
    /// Force storage in the global domain regardless of scope.
    pub const GLOBAL: u8 = 0x04;
}

// ── Variables ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Variable {
    value: ScriptValue,
    mutable: bool,
}

// ── Member lookups ────────────────────────────────────────────────────────

/// A host-registered capability set contributing read-only members and
/// functions to a context.
pub trait MemberLookup {
    /// Resolve `name` under the required type mask, or `None` to let the
    /// search continue.
    fn member_by_name(&self, name: &str, required: u16) -> Option<ScriptValue>;
}

/// Convenience lookup exposing a fixed set of native functions.
pub struct FunctionLookup {
    functions: Vec<Rc<NativeFunction>>,
}

impl FunctionLookup {
    pub fn new(functions: Vec<Rc<NativeFunction>>) -> Self {
        Self { functions }
    }
}

impl MemberLookup for FunctionLookup {
    fn member_by_name(&self, name: &str, required: u16) -> Option<ScriptValue> {
        if required & mask::EXECUTABLE == 0 {
            return None;
        }
        self.functions
            .iter()
            .find(|f| f.signature.name == name)
            .map(|f| ScriptValue::Executable(Executable::Native(f.clone())))
    }
}

// ── Scripting domain ──────────────────────────────────────────────────────

/// The process-wide global scope shared by all contexts: global variables
/// plus globally registered native functions.  Constructed once by the
/// embedding host and passed to every context.
pub struct ScriptingDomain {
    globals: IndexMap<String, Variable>,
    functions: IndexMap<&'static str, Rc<NativeFunction>>,
}

impl ScriptingDomain {
    /// An empty domain with no registered functions.
    pub fn new() -> DomainRef {
        Rc::new(RefCell::new(Self {
            globals: IndexMap::new(),
            functions: IndexMap::new(),
        }))
    }

    /// A domain preloaded with the standard function library.
    pub fn with_standard_functions() -> DomainRef {
        let domain = Self::new();
        for f in super::builtins::standard_functions() {
            domain.borrow_mut().register_function(f);
        }
        domain
    }

    /// Register (or replace) a globally visible native function.
    pub fn register_function(&mut self, f: NativeFunction) {
        self.functions.insert(f.signature.name, Rc::new(f));
    }

    /// Define a global variable; `mutable: false` makes later writes fail
    /// with an `Immutable` error.
    pub fn define(&mut self, name: impl Into<String>, value: ScriptValue, mutable: bool) {
        self.globals.insert(name.into(), Variable { value, mutable });
    }

    pub fn member(&self, name: &str, required: u16) -> Option<ScriptValue> {
        if let Some(var) = self.globals.get(name) {
            if var.value.matches_mask(required, false) {
                return Some(var.value.clone());
            }
        }
        if required & mask::EXECUTABLE != 0 {
            if let Some(f) = self.functions.get(name) {
                return Some(ScriptValue::Executable(Executable::Native(f.clone())));
            }
        }
        None
    }

    fn has(&self, name: &str) -> bool {
        self.globals.contains_key(name)
    }

    fn set(&mut self, name: &str, value: ScriptValue, only_create: bool) -> Result<(), ScriptError> {
        if let Some(var) = self.globals.get_mut(name) {
            if only_create {
                return Ok(());
            }
            if !var.mutable {
                return Err(ScriptError::new(
                    ErrorCode::Immutable,
                    format!("global '{name}' is not writable"),
                ));
            }
            var.value = value;
        } else {
            self.globals.insert(name.to_owned(), Variable { value, mutable: true });
        }
        Ok(())
    }
}

// ── Execution context ─────────────────────────────────────────────────────

/// One scope in the execution hierarchy: named variables, indexed argument
/// slots, optional instance members, pluggable lookups, and the domain.
///
/// Created per script invocation (or shared across chained parts when the
/// caller asks for it); per-call contexts for function invocations chain to
/// their main context through `parent`.
pub struct ExecutionContext {
    indexed: Vec<ScriptValue>,
    named: IndexMap<String, Variable>,
    parent: Option<Weak<RefCell<ExecutionContext>>>,
    instance: Option<Rc<dyn MemberLookup>>,
    lookups: Vec<Rc<dyn MemberLookup>>,
    domain: DomainRef,
}

impl ExecutionContext {
    /// A main context bound to `domain`.
    pub fn new(domain: DomainRef) -> ContextRef {
        Rc::new(RefCell::new(Self {
            indexed: Vec::new(),
            named: IndexMap::new(),
            parent: None,
            instance: None,
            lookups: Vec::new(),
            domain,
        }))
    }

    /// A per-call local context chained to `main`, carrying the call's
    /// positional argument slots.
    pub fn new_for_call(main: &ContextRef, args: Vec<ScriptValue>) -> ContextRef {
        let domain = main.borrow().domain.clone();
        Rc::new(RefCell::new(Self {
            indexed: args,
            named: IndexMap::new(),
            parent: Some(Rc::downgrade(main)),
            instance: None,
            lookups: Vec::new(),
            domain,
        }))
    }

    pub fn domain(&self) -> &DomainRef {
        &self.domain
    }

    /// Attach the instance member set consulted between locals and lookups.
    pub fn set_instance(&mut self, instance: Rc<dyn MemberLookup>) {
        self.instance = Some(instance);
    }

    /// Register a host capability set on this context.
    pub fn register_lookup(&mut self, lookup: Rc<dyn MemberLookup>) {
        self.lookups.push(lookup);
    }

    /// Drop all local variables and argument slots (between independent
    /// runs, unless the caller asked to keep variables).
    pub fn clear_vars(&mut self) {
        self.named.clear();
        self.indexed.clear();
    }

    // ── Indexed members (positional arguments) ────────────────────────────

    pub fn member_at_index(&self, index: usize) -> ScriptValue {
        self.indexed.get(index).cloned().unwrap_or(ScriptValue::Null)
    }

    pub fn indexed_len(&self) -> usize {
        self.indexed.len()
    }

    // ── Named members ─────────────────────────────────────────────────────

    /// Resolve a name in the fixed order local → instance → lookups →
    /// domain.  A member whose type does not intersect `required` is
    /// skipped and the search continues outward.
    pub fn member_by_name(&self, name: &str, required: u16) -> Option<ScriptValue> {
        if let Some(var) = self.named.get(name) {
            if var.value.matches_mask(required, false) {
                return Some(var.value.clone());
            }
        }
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            // The chained main context covers its locals, instance,
            // lookups, and the domain in the required order.
            return parent.borrow().member_by_name(name, required);
        }
        if let Some(instance) = &self.instance {
            if let Some(v) = instance.member_by_name(name, required) {
                return Some(v);
            }
        }
        for lookup in &self.lookups {
            if let Some(v) = lookup.member_by_name(name, required) {
                return Some(v);
            }
        }
        self.domain.borrow().member(name, required)
    }

    /// Write a named member, honoring the `setflags` policy.  Without a
    /// create flag the target must already exist somewhere in the chain
    /// (`NotCreated` otherwise); no implicit global is ever created unless
    /// GLOBAL is explicitly requested.
    pub fn set_member_by_name(
        &mut self,
        name: &str,
        value: ScriptValue,
        flags: u8,
    ) -> Result<(), ScriptError> {
        if flags & setflags::GLOBAL != 0 {
            return self
                .domain
                .borrow_mut()
                .set(name, value, flags & setflags::ONLY_CREATE != 0);
        }

        if let Some(var) = self.named.get_mut(name) {
            if flags & setflags::ONLY_CREATE != 0 {
                return Ok(());
            }
            if !var.mutable {
                return Err(ScriptError::new(
                    ErrorCode::Immutable,
                    format!("'{name}' is not writable"),
                ));
            }
            var.value = value;
            return Ok(());
        }

        if flags & (setflags::CREATE | setflags::ONLY_CREATE) != 0 {
            self.named.insert(name.to_owned(), Variable { value, mutable: true });
            return Ok(());
        }

        // Plain assignment: follow the chain outward.
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            return parent.borrow_mut().set_member_by_name(name, value, flags);
        }
        if self.domain.borrow().has(name) {
            return self.domain.borrow_mut().set(name, value, false);
        }
        Err(ScriptError::not_created(name))
    }

    /// Whether a local variable of this exact scope exists (used by tests
    /// and by hosts inspecting results).
    pub fn has_local(&self, name: &str) -> bool {
        self.named.contains_key(name)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ContextRef {
        ExecutionContext::new(ScriptingDomain::new())
    }

    #[test]
    fn create_then_read_local() {
        let c = ctx();
        c.borrow_mut()
            .set_member_by_name("x", ScriptValue::Number(5.0), setflags::CREATE)
            .unwrap();
        assert_eq!(
            c.borrow().member_by_name("x", mask::ANY),
            Some(ScriptValue::Number(5.0))
        );
    }

    #[test]
    fn plain_assignment_requires_existence() {
        let c = ctx();
        let e = c
            .borrow_mut()
            .set_member_by_name("nope", ScriptValue::Number(1.0), 0)
            .unwrap_err();
        assert_eq!(e.code, ErrorCode::NotCreated);
    }

    #[test]
    fn only_create_never_overwrites() {
        let c = ctx();
        c.borrow_mut()
            .set_member_by_name("x", ScriptValue::Number(1.0), setflags::ONLY_CREATE)
            .unwrap();
        c.borrow_mut()
            .set_member_by_name("x", ScriptValue::Number(2.0), setflags::ONLY_CREATE)
            .unwrap();
        assert_eq!(
            c.borrow().member_by_name("x", mask::ANY),
            Some(ScriptValue::Number(1.0))
        );
    }

    #[test]
    fn global_flag_forces_domain_storage() {
        let domain = ScriptingDomain::new();
        let c = ExecutionContext::new(domain.clone());
        c.borrow_mut()
            .set_member_by_name("g", ScriptValue::Number(7.0), setflags::GLOBAL)
            .unwrap();
        assert!(domain.borrow().has("g"));
        // Visible from a fresh context on the same domain.
        let c2 = ExecutionContext::new(domain);
        assert_eq!(
            c2.borrow().member_by_name("g", mask::ANY),
            Some(ScriptValue::Number(7.0))
        );
    }

    #[test]
    fn assignment_writes_existing_global() {
        let domain = ScriptingDomain::new();
        domain.borrow_mut().define("g", ScriptValue::Number(1.0), true);
        let c = ExecutionContext::new(domain.clone());
        c.borrow_mut()
            .set_member_by_name("g", ScriptValue::Number(2.0), 0)
            .unwrap();
        assert_eq!(
            domain.borrow().member("g", mask::ANY),
            Some(ScriptValue::Number(2.0))
        );
    }

    #[test]
    fn immutable_global_rejects_writes() {
        let domain = ScriptingDomain::new();
        domain
            .borrow_mut()
            .define("pi", ScriptValue::Number(3.14), false);
        let c = ExecutionContext::new(domain);
        let e = c
            .borrow_mut()
            .set_member_by_name("pi", ScriptValue::Number(3.0), 0)
            .unwrap_err();
        assert_eq!(e.code, ErrorCode::Immutable);
    }

    #[test]
    fn local_shadows_global() {
        let domain = ScriptingDomain::new();
        domain.borrow_mut().define("x", ScriptValue::Number(1.0), true);
        let c = ExecutionContext::new(domain);
        c.borrow_mut()
            .set_member_by_name("x", ScriptValue::Number(2.0), setflags::CREATE)
            .unwrap();
        assert_eq!(
            c.borrow().member_by_name("x", mask::ANY),
            Some(ScriptValue::Number(2.0))
        );
    }

    #[test]
    fn call_context_chains_to_main() {
        let main = ctx();
        main.borrow_mut()
            .set_member_by_name("shared", ScriptValue::Number(9.0), setflags::CREATE)
            .unwrap();
        let call = ExecutionContext::new_for_call(&main, vec![ScriptValue::Number(42.0)]);
        assert_eq!(call.borrow().member_at_index(0), ScriptValue::Number(42.0));
        assert_eq!(call.borrow().member_at_index(5), ScriptValue::Null);
        assert_eq!(
            call.borrow().member_by_name("shared", mask::ANY),
            Some(ScriptValue::Number(9.0))
        );
        // Writing through assigns in the main scope, not the call scope.
        call.borrow_mut()
            .set_member_by_name("shared", ScriptValue::Number(10.0), 0)
            .unwrap();
        assert!(!call.borrow().has_local("shared"));
        assert_eq!(
            main.borrow().member_by_name("shared", mask::ANY),
            Some(ScriptValue::Number(10.0))
        );
    }

    #[test]
    fn mask_mismatch_continues_search() {
        let domain = ScriptingDomain::new();
        domain
            .borrow_mut()
            .define("f", ScriptValue::text("global text"), true);
        let c = ExecutionContext::new(domain);
        // Local 'f' is a number; asking for TEXT skips it and finds the
        // global.
        c.borrow_mut()
            .set_member_by_name("f", ScriptValue::Number(1.0), setflags::CREATE)
            .unwrap();
        assert_eq!(
            c.borrow().member_by_name("f", mask::TEXT),
            Some(ScriptValue::text("global text"))
        );
    }

    #[test]
    fn lookups_resolve_after_locals_and_instance() {
        struct Fixed(&'static str, f64);
        impl MemberLookup for Fixed {
            fn member_by_name(&self, name: &str, _required: u16) -> Option<ScriptValue> {
                (name == self.0).then(|| ScriptValue::Number(self.1))
            }
        }
        let c = ctx();
        c.borrow_mut().set_instance(Rc::new(Fixed("reading", 1.0)));
        c.borrow_mut().register_lookup(Rc::new(Fixed("reading", 2.0)));
        c.borrow_mut().register_lookup(Rc::new(Fixed("limit", 3.0)));
        // Instance members win over lookups.
        assert_eq!(
            c.borrow().member_by_name("reading", mask::ANY),
            Some(ScriptValue::Number(1.0))
        );
        assert_eq!(
            c.borrow().member_by_name("limit", mask::ANY),
            Some(ScriptValue::Number(3.0))
        );
        // A local shadows them all.
        c.borrow_mut()
            .set_member_by_name("reading", ScriptValue::Number(9.0), setflags::CREATE)
            .unwrap();
        assert_eq!(
            c.borrow().member_by_name("reading", mask::ANY),
            Some(ScriptValue::Number(9.0))
        );
    }

    #[test]
    fn function_lookup_serves_executables_only() {
        use crate::engine::builtins::{BuiltinOutcome, Signature};

        let f = Rc::new(NativeFunction::new(
            Signature { name: "probe", returns: mask::NUMERIC, args: &[] },
            |_| Ok(BuiltinOutcome::Value(ScriptValue::Number(5.0))),
        ));
        let lookup = FunctionLookup::new(vec![f]);
        assert!(lookup.member_by_name("probe", mask::EXECUTABLE).is_some());
        assert!(lookup.member_by_name("probe", mask::NUMERIC).is_none());
        assert!(lookup.member_by_name("other", mask::EXECUTABLE).is_none());
    }

    #[test]
    fn clear_vars_resets_scope() {
        let c = ctx();
        c.borrow_mut()
            .set_member_by_name("x", ScriptValue::Number(5.0), setflags::CREATE)
            .unwrap();
        c.borrow_mut().clear_vars();
        assert_eq!(c.borrow().member_by_name("x", mask::ANY), None);
    }
}
