//! Type descriptors, name lookup, interface layout and vtable construction.
//!
//! Types are defined with a fixed shape ([`TypeDef`]) and laid out lazily. Layout runs under the
//! runtime's loader lock through a [`Loader`], which builds prerequisites (parent, generic
//! definition, interfaces) first and records any failure on the type that failed.

pub mod dispatch;
pub mod interface_offsets;
mod method_desc;
pub mod module;
pub mod name_index;
mod signature;
mod type_def;
mod type_desc;
pub mod vtable;

use std::collections::HashSet;
use std::sync::Arc;

pub use self::interface_offsets::{InterfaceEntry, InterfaceLayout, InterfaceOffsetResolver};
pub use self::method_desc::{MethodDesc, MethodFlags, MethodHandle};
pub use self::module::Module;
pub use self::name_index::{Datum, EntryId};
pub use self::signature::{MethodSignature, SigType, SignatureRelation};
pub use self::type_def::{MethodDef, MethodImplDef, TypeDef};
pub use self::type_desc::{GenericInstance, LoadState, MethodImpl, TypeDesc, TypeFlags, TypeHandle};
pub use self::vtable::{Ambiguity, DispatchTable, Slot, VTableBuilder};

use crate::error::TypeLoadError;
use crate::util::options::Options;
use crate::vm::TypeSystem;

/// The state of one layout request: the collaborators, and the types whose vtables are being
/// built further up the call chain.
///
/// A type found in `building` is skipped rather than built again. Whoever needed it then sees no
/// published table and reports the cycle.
pub(crate) struct Loader<'a, TS: TypeSystem> {
    ts: &'a TS,
    options: &'a Options,
    building: HashSet<usize>,
}

impl<'a, TS: TypeSystem> Loader<'a, TS> {
    pub(crate) fn new(ts: &'a TS, options: &'a Options) -> Self {
        Loader {
            ts,
            options,
            building: HashSet::new(),
        }
    }

    pub(crate) fn type_system(&self) -> &'a TS {
        self.ts
    }

    pub(crate) fn options(&self) -> &'a Options {
        self.options
    }

    pub(crate) fn resolve_interface_offsets<'t>(
        &mut self,
        ty: &'t TypeHandle,
        starting_slot: Option<usize>,
    ) -> Result<&'t InterfaceLayout, TypeLoadError> {
        InterfaceOffsetResolver::new(self).resolve(ty, starting_slot)
    }

    /// Build and publish the vtable of `ty` unless it is built, failed, or already being built.
    pub(crate) fn ensure_built(&mut self, ty: &TypeHandle) -> Result<(), TypeLoadError> {
        match ty.load_state() {
            LoadState::Built => return Ok(()),
            LoadState::Failed => {
                return Err(ty
                    .failure()
                    .cloned()
                    .unwrap_or_else(|| panic!("{} failed without a recorded error", ty.full_name())))
            }
            LoadState::Unbuilt | LoadState::Building => {}
        }
        let key = Arc::as_ptr(ty) as usize;
        if !self.building.insert(key) {
            trace!("{} is already being built", ty.full_name());
            return Ok(());
        }
        if !ty.begin_building() {
            // A loader further out on this thread is building it, through the reentrant lock.
            self.building.remove(&key);
            trace!("{} is being built by an outer request", ty.full_name());
            return Ok(());
        }
        let result = VTableBuilder::new(self, ty).build();
        self.building.remove(&key);
        match result {
            Ok(table) => {
                let table = ty.publish_dispatch(table);
                debug!(
                    "Built vtable of {}: {} slots{}",
                    ty.full_name(),
                    table.len(),
                    if table.is_shared_with_parent() {
                        ", shared with parent"
                    } else {
                        ""
                    }
                );
                Ok(())
            }
            Err(e) => Err(ty.fail(e)),
        }
    }

    /// The published vtable of `ty`, building it if needed.
    pub(crate) fn build_vtable<'t>(
        &mut self,
        ty: &'t TypeHandle,
    ) -> Result<&'t DispatchTable, TypeLoadError> {
        self.ensure_built(ty)?;
        ty.dispatch_table()
            .ok_or_else(|| TypeLoadError::CircularInheritance {
                type_name: ty.full_name(),
            })
    }
}
