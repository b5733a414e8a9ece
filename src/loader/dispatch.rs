//! Resolving calls against published dispatch tables.
//!
//! Every function here expects the receiver's type to be built already.

use std::sync::Arc;

use super::vtable::{DispatchTable, Slot};
use super::{MethodHandle, TypeDesc};
use crate::error::DispatchError;

fn table(ty: &TypeDesc) -> &DispatchTable {
    ty.dispatch_table()
        .unwrap_or_else(|| panic!("{} is dispatched on before its vtable is built", ty.full_name()))
}

fn not_implemented(ty: &TypeDesc, method: &str) -> DispatchError {
    DispatchError::NotImplemented {
        type_name: ty.full_name(),
        method: method.to_string(),
    }
}

fn call_target(ty: &TypeDesc, slot: &Slot, method: &str) -> Result<MethodHandle, DispatchError> {
    match slot {
        Slot::Method(m) if !m.is_abstract() => Ok(m.clone()),
        Slot::Method(m) | Slot::Reabstracted(m) => Err(DispatchError::AbstractMethod {
            type_name: ty.full_name(),
            method: m.full_name(),
        }),
        Slot::Ambiguous(candidates) => Err(DispatchError::Ambiguous {
            type_name: ty.full_name(),
            method: method.to_string(),
            candidates: candidates.iter().map(|m| m.full_name()).collect(),
        }),
    }
}

/// The body a virtual call of `method` on an instance of `ty` runs.
pub fn dispatch_virtual(ty: &TypeDesc, method: &MethodHandle) -> Result<MethodHandle, DispatchError> {
    if method.is_interface_method() {
        return dispatch_interface(ty, method);
    }
    let owner = method
        .owner()
        .ok_or_else(|| not_implemented(ty, &method.full_name()))?;
    if !std::ptr::eq(ty, Arc::as_ptr(&owner)) && !ty.is_subclass_of(&owner) {
        return Err(not_implemented(ty, &method.full_name()));
    }
    if !method.needs_slot() {
        return Ok(method.clone());
    }
    let slot = method
        .slot()
        .and_then(|s| table(ty).slot(s))
        .ok_or_else(|| not_implemented(ty, &method.full_name()))?;
    call_target(ty, slot, method.name())
}

/// The body a call through interface method `declaration` on an instance of `ty` runs.
pub fn dispatch_interface(
    ty: &TypeDesc,
    declaration: &MethodHandle,
) -> Result<MethodHandle, DispatchError> {
    let missing = || not_implemented(ty, &declaration.full_name());
    let interface = declaration.owner().ok_or_else(missing)?;
    let offset = ty
        .interface_layout()
        .and_then(|l| l.offset_of(&interface))
        .ok_or_else(missing)?;
    let slot = declaration
        .slot()
        .and_then(|s| table(ty).slot(offset + s))
        .ok_or_else(missing)?;
    call_target(ty, slot, declaration.name())
}

/// The body a call of `name` on an instance of `ty` runs. Class methods, most derived first, win
/// over interface methods; a name that several unrelated interfaces supply is ambiguous.
pub fn dispatch_by_name(ty: &TypeDesc, name: &str) -> Result<MethodHandle, DispatchError> {
    let classes = std::iter::once(ty)
        .chain(ty.ancestors().map(|a| &**a))
        .filter(|t| !t.is_interface());
    for class in classes {
        if let Some(m) = class
            .methods()
            .iter()
            .find(|m| m.name() == name && !m.is_static())
        {
            return dispatch_virtual(ty, m);
        }
    }

    let table = table(ty);
    if let Some(ambiguity) = table.ambiguities().iter().find(|a| a.method == name) {
        return Err(DispatchError::Ambiguous {
            type_name: ty.full_name(),
            method: name.to_string(),
            candidates: ambiguity.candidate_names(),
        });
    }

    let mut first_error = None;
    let layout = ty.interface_layout().into_iter().flat_map(|l| l.entries());
    for entry in layout {
        for (i, decl) in entry.interface.virtual_methods().enumerate() {
            if decl.name() != name {
                continue;
            }
            let Some(slot) = table.slot(entry.offset + i) else {
                continue;
            };
            match call_target(ty, slot, name) {
                Ok(m) => return Ok(m),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
    }
    Err(first_error.unwrap_or_else(|| not_implemented(ty, name)))
}
