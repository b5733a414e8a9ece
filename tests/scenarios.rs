mod common;

use std::sync::Arc;

use common::*;
use parking_lot::Mutex;
use rtcore::error::UnresolvedType;
use rtcore::loader::{
    MethodDef, MethodSignature, SigType, SignatureRelation, Slot, TypeDef, TypeFlags,
};
use rtcore::stw::CooperativeSuspend;
use rtcore::util::ConcurrentMap;
use rtcore::vm::{DefaultTypeSystem, TypeSystem, VMBinding};
use rtcore::{DispatchError, RuntimeBuilder, TypeHandle, TypeLoadError};

#[test]
fn new_virtual_method_extends_the_parent_vtable() {
    let rt = runtime();
    let base = class(&rt, "Base", None, &[], &["A", "B", "C"]);
    let derived = class(&rt, "Derived", Some(&base), &[], &["D"]);

    let base_table = rt.build_vtable(&base).unwrap();
    let table = rt.build_vtable(&derived).unwrap();
    assert_eq!(base_table.len(), 3);
    assert_eq!(table.len(), 4);
    assert_eq!(&table.slots()[..3], base_table.slots());
    assert_eq!(table.slot(3), Some(&Slot::Method(method(&derived, "D"))));
    assert!(!table.is_shared_with_parent());
    assert!(!table.shares_slots_with(base_table));
}

#[test]
fn interface_slot_is_inherited_verbatim() {
    let rt = runtime();
    let i = interface(&rt, "I", &["M"], &[]);
    let a = class(&rt, "A", None, &[&i], &["M"]);
    let b = class(&rt, "B", Some(&a), &[], &[]);

    let a_layout = rt.resolve_interface_offsets(&a).unwrap();
    assert_eq!(a_layout.offset_of(&i), Some(0));
    assert!(a_layout.entry_for(&i).unwrap().introduced);

    let a_table = rt.build_vtable(&a).unwrap();
    assert_eq!(slot_names(a_table), vec!["A.M"]);
    let m = rt.dispatch_interface(&a, &method(&i, "M")).unwrap();
    assert!(Arc::ptr_eq(&m, &method(&a, "M")));

    let b_layout = rt.resolve_interface_offsets(&b).unwrap();
    assert_eq!(b_layout.offset_of(&i), Some(0));
    assert!(!b_layout.entry_for(&i).unwrap().introduced);
    let b_table = rt.build_vtable(&b).unwrap();
    assert_eq!(b_table.slot(0), a_table.slot(0));
}

#[test]
fn map_doubles_past_three_quarters() {
    let map: ConcurrentMap<String, usize> = ConcurrentMap::with_capacity(32);
    for i in 0..24 {
        map.insert(format!("key{}", i), i);
    }
    assert_eq!(map.table_size(), 32);
    map.insert("key24".to_string(), 24);
    assert_eq!(map.table_size(), 64);
    assert_eq!(map.len(), 25);
    for i in 0..25 {
        assert_eq!(map.lookup(&format!("key{}", i)), Some(i));
    }
}

#[test]
fn conflicting_defaults_fail_only_when_called() {
    let rt = runtime();
    let i1 = interface(&rt, "I1", &[], &["F", "G"]);
    let i2 = interface(&rt, "I2", &[], &["F"]);
    let c = class(&rt, "C", None, &[&i1, &i2], &["H"]);

    let table = rt.build_vtable(&c).unwrap();
    assert_eq!(table.ambiguities().len(), 1);
    assert_eq!(table.ambiguities()[0].candidate_names(), vec!["I1.F", "I2.F"]);

    match rt.dispatch_by_name(&c, "F") {
        Err(DispatchError::Ambiguous {
            type_name,
            method,
            candidates,
        }) => {
            assert_eq!(type_name, "C");
            assert_eq!(method, "F");
            assert_eq!(candidates, vec!["I1.F", "I2.F"]);
        }
        other => panic!("unexpected {:?}", other),
    }
    let g = rt.dispatch_by_name(&c, "G").unwrap();
    assert!(Arc::ptr_eq(&g, &method(&i1, "G")));
    let h = rt.dispatch_by_name(&c, "H").unwrap();
    assert!(Arc::ptr_eq(&h, &method(&c, "H")));
    // The type stays usable after the fault.
    assert!(rt.dispatch_by_name(&c, "F").is_err());
    assert!(rt.build_vtable(&c).is_ok());
}

/// Substitutes one interface for another when instantiating generics.
#[derive(Default)]
struct SwappingTypeSystem {
    swap: Mutex<Option<(TypeHandle, TypeHandle)>>,
}

impl TypeSystem for SwappingTypeSystem {
    fn compare_signatures(
        &self,
        candidate: &MethodSignature,
        target: &MethodSignature,
    ) -> Result<SignatureRelation, UnresolvedType> {
        DefaultTypeSystem.compare_signatures(candidate, target)
    }

    fn is_assignable_to(&self, from: &SigType, to: &SigType) -> Result<bool, UnresolvedType> {
        DefaultTypeSystem.is_assignable_to(from, to)
    }

    fn inflate(&self, ty: &TypeHandle, _args: &[TypeHandle]) -> TypeHandle {
        match &*self.swap.lock() {
            Some((from, to)) if Arc::ptr_eq(ty, from) => to.clone(),
            _ => ty.clone(),
        }
    }
}

struct SwappingVM;

impl VMBinding for SwappingVM {
    type VMTypeSystem = SwappingTypeSystem;
    type VMSuspend = CooperativeSuspend;
}

#[test]
fn instantiation_with_a_different_interface_shape_fails() {
    let rt = RuntimeBuilder::defaults_only()
        .build::<SwappingVM>(SwappingTypeSystem::default(), CooperativeSuspend);
    let narrow = interface(&rt, "INarrow", &["Get"], &[]);
    let wide = interface(&rt, "IWide", &["Get", "Set"], &[]);
    let holder = rt.define_type(
        TypeDef::class("", "Holder")
            .with_flags(TypeFlags::GENERIC_DEFINITION)
            .implements(&narrow)
            .method(MethodDef::virtual_method("Get")),
    );
    let arg = class(&rt, "Arg", None, &[], &[]);
    rt.build_vtable(&holder).unwrap();

    *rt.type_system().swap.lock() = Some((narrow.clone(), wide.clone()));
    let inst = rt.instantiate(&holder, &[arg]);
    let expected = TypeLoadError::GenericShapeMismatch {
        type_name: "Holder<Arg>".into(),
        definition: "Holder".into(),
    };
    assert_eq!(rt.build_vtable(&inst).unwrap_err(), expected);
    assert_eq!(rt.resolve_interface_offsets(&inst).unwrap_err(), expected);
}
