//! Shorthands for defining small type hierarchies in tests.
//!
//! Every method these helpers declare is public and `void ()`. Tests that need other signatures
//! or flags use [`TypeDef`] directly.

use crate::loader::{DispatchTable, MethodDef, MethodHandle, TypeDef, TypeHandle};
use crate::vm::VMBinding;
use crate::Runtime;

/// An interface of abstract methods.
pub fn interface<VM: VMBinding>(rt: &Runtime<VM>, name: &str, methods: &[&str]) -> TypeHandle {
    interface_extending(rt, name, &[], methods, &[])
}

/// An interface extending `extends`, with abstract `methods` and default-bodied `defaults`.
pub fn interface_extending<VM: VMBinding>(
    rt: &Runtime<VM>,
    name: &str,
    extends: &[&TypeHandle],
    methods: &[&str],
    defaults: &[&str],
) -> TypeHandle {
    let mut def = TypeDef::interface("", name);
    for i in extends {
        def = def.implements(i);
    }
    for m in methods {
        def = def.method(MethodDef::abstract_method(m));
    }
    for m in defaults {
        def = def.method(MethodDef::virtual_method(m));
    }
    rt.define_type(def)
}

/// A concrete class with virtual `methods`.
pub fn class<VM: VMBinding>(
    rt: &Runtime<VM>,
    name: &str,
    parent: Option<&TypeHandle>,
    interfaces: &[&TypeHandle],
    methods: &[&str],
) -> TypeHandle {
    let mut def = TypeDef::class("", name);
    if let Some(p) = parent {
        def = def.extends(p);
    }
    for i in interfaces {
        def = def.implements(i);
    }
    for m in methods {
        def = def.method(MethodDef::virtual_method(m));
    }
    rt.define_type(def)
}

/// The method of `ty` called `name`.
pub fn method(ty: &TypeHandle, name: &str) -> MethodHandle {
    ty.find_method(name)
        .cloned()
        .unwrap_or_else(|| panic!("{} has no method {}", ty.full_name(), name))
}

/// Every slot of `table`, rendered as the full name of its method.
pub fn slot_names(table: &DispatchTable) -> Vec<String> {
    table.slots().iter().map(|s| format!("{:?}", s)).collect()
}
