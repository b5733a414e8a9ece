//! A binding and a few type-building shorthands shared by the integration tests.

#![allow(dead_code)]

use rtcore::loader::{DispatchTable, MethodDef, MethodHandle, TypeDef};
use rtcore::stw::CooperativeSuspend;
use rtcore::vm::{DefaultTypeSystem, VMBinding};
use rtcore::{Runtime, RuntimeBuilder, TypeHandle};

pub struct TestVM;

impl VMBinding for TestVM {
    type VMTypeSystem = DefaultTypeSystem;
    type VMSuspend = CooperativeSuspend;
}

pub fn runtime() -> Runtime<TestVM> {
    RuntimeBuilder::defaults_only().build::<TestVM>(DefaultTypeSystem, CooperativeSuspend)
}

pub fn interface<VM: VMBinding>(
    rt: &Runtime<VM>,
    name: &str,
    methods: &[&str],
    defaults: &[&str],
) -> TypeHandle {
    let mut def = TypeDef::interface("", name);
    for m in methods {
        def = def.method(MethodDef::abstract_method(m));
    }
    for m in defaults {
        def = def.method(MethodDef::virtual_method(m));
    }
    rt.define_type(def)
}

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

pub fn method(ty: &TypeHandle, name: &str) -> MethodHandle {
    ty.find_method(name)
        .cloned()
        .unwrap_or_else(|| panic!("{} has no method {}", ty.full_name(), name))
}

pub fn slot_names(table: &DispatchTable) -> Vec<String> {
    table.slots().iter().map(|s| format!("{:?}", s)).collect()
}
