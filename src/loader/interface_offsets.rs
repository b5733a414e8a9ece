//! Interface slot geometry.
//!
//! Every interface a type implements gets a contiguous range of vtable slots, one per virtual
//! method of the interface. Ranges inherited from ancestors keep their offsets, so a call through
//! an interface lands on the same slot whichever class in the chain the receiver is viewed as.
//! Interfaces the type introduces get ranges starting at the end of the parent's vtable.

use std::collections::HashSet;
use std::sync::Arc;

use super::type_desc::{TypeDesc, TypeHandle};
use super::Loader;
use crate::error::TypeLoadError;
use crate::util::bitmap::InterfaceBitmap;
use crate::vm::TypeSystem;

/// One implemented interface and where its range starts.
#[derive(Clone, Debug)]
pub struct InterfaceEntry {
    pub interface: TypeHandle,
    pub offset: usize,
    /// The range was laid out by this type rather than copied from an ancestor.
    pub introduced: bool,
}

impl InterfaceEntry {
    pub fn iid(&self) -> u32 {
        iid_of(&self.interface)
    }
}

fn iid_of(ty: &TypeDesc) -> u32 {
    ty.interface_id()
        .unwrap_or_else(|| panic!("{} has no interface id", ty.full_name()))
}

/// The packed interface table of a type, sorted by interface id.
#[derive(Debug)]
pub struct InterfaceLayout {
    entries: Vec<InterfaceEntry>,
    bitmap: InterfaceBitmap,
    max_iid: u32,
    start_slot: usize,
    next_slot: usize,
}

impl InterfaceLayout {
    fn new(mut entries: Vec<InterfaceEntry>, start_slot: usize, next_slot: usize) -> Self {
        entries.sort_by_key(InterfaceEntry::iid);
        let max_iid = entries.iter().map(InterfaceEntry::iid).max().unwrap_or(0);
        let mut bitmap = InterfaceBitmap::with_max_id(max_iid);
        for e in entries.iter() {
            bitmap.set(e.iid());
        }
        InterfaceLayout {
            entries,
            bitmap,
            max_iid,
            start_slot,
            next_slot,
        }
    }

    pub fn entries(&self) -> &[InterfaceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// O(1) membership test.
    pub fn implements(&self, iid: u32) -> bool {
        self.bitmap.contains(iid)
    }

    pub fn entry_for(&self, interface: &TypeDesc) -> Option<&InterfaceEntry> {
        let iid = interface.interface_id()?;
        if !self.implements(iid) {
            return None;
        }
        self.entries
            .binary_search_by_key(&iid, InterfaceEntry::iid)
            .ok()
            .map(|i| &self.entries[i])
    }

    /// The first slot of `interface`'s range.
    pub fn offset_of(&self, interface: &TypeDesc) -> Option<usize> {
        self.entry_for(interface).map(|e| e.offset)
    }

    pub fn max_interface_id(&self) -> u32 {
        self.max_iid
    }

    /// The slot the first introduced range starts at: the parent's vtable size.
    pub fn start_slot(&self) -> usize {
        self.start_slot
    }

    /// One past the last introduced range. The type's own new virtual methods go from here.
    pub fn next_slot(&self) -> usize {
        self.next_slot
    }
}

/// `ty` first if it is an interface, then everything it declares, transitively, depth first in
/// declaration order.
fn own_interfaces(ty: &TypeHandle) -> Vec<TypeHandle> {
    fn visit(ty: &TypeHandle, out: &mut Vec<TypeHandle>) {
        for iface in ty.declared_interfaces() {
            out.push(iface.clone());
            visit(iface, out);
        }
    }
    let mut out = vec![];
    if ty.is_interface() {
        out.push(ty.clone());
    }
    visit(ty, &mut out);
    out
}

pub struct InterfaceOffsetResolver<'l, 'a, TS: TypeSystem> {
    loader: &'l mut Loader<'a, TS>,
}

impl<'l, 'a, TS: TypeSystem> InterfaceOffsetResolver<'l, 'a, TS> {
    pub(crate) fn new(loader: &'l mut Loader<'a, TS>) -> Self {
        InterfaceOffsetResolver { loader }
    }

    /// Compute and publish the layout of `ty`, or return the one already published. A failure is
    /// recorded on `ty` and returned to every later caller.
    ///
    /// `starting_slot` defaults to the parent's vtable size, which requires the parent's vtable.
    pub fn resolve<'t>(
        mut self,
        ty: &'t TypeHandle,
        starting_slot: Option<usize>,
    ) -> Result<&'t InterfaceLayout, TypeLoadError> {
        if let Some(e) = ty.failure() {
            return Err(e.clone());
        }
        if let Some(layout) = ty.interface_layout() {
            if let Some(start) = starting_slot {
                assert_eq!(
                    layout.start_slot(),
                    start,
                    "{}: interface layout already resolved from a different starting slot",
                    ty.full_name()
                );
            }
            return Ok(layout);
        }
        match self.compute(ty, starting_slot) {
            Ok(layout) => {
                debug!(
                    "{}: {} interfaces, slots {}..{}",
                    ty.full_name(),
                    layout.len(),
                    layout.start_slot(),
                    layout.next_slot()
                );
                Ok(ty.publish_layout(layout))
            }
            Err(e) => Err(ty.fail(e)),
        }
    }

    fn parent_vtable_size(&mut self, ty: &TypeHandle) -> Result<usize, TypeLoadError> {
        let Some(parent) = ty.parent() else {
            return Ok(0);
        };
        self.loader
            .ensure_built(parent)
            .map_err(|e| TypeLoadError::ParentFailed {
                type_name: ty.full_name(),
                parent: parent.full_name(),
                source: Box::new(e),
            })?;
        parent
            .vtable_size()
            .ok_or_else(|| TypeLoadError::CircularInheritance {
                type_name: ty.full_name(),
            })
    }

    fn compute(
        &mut self,
        ty: &TypeHandle,
        starting_slot: Option<usize>,
    ) -> Result<InterfaceLayout, TypeLoadError> {
        let parent_size = self.parent_vtable_size(ty)?;
        let start = starting_slot.unwrap_or(parent_size);

        if let Some(generic) = ty.generic() {
            return self.copy_from_definition(ty, &generic.definition, &generic.args, start);
        }

        let mut entries: Vec<InterfaceEntry> = vec![];
        let mut seen: HashSet<u32> = HashSet::new();

        // Ancestors' ranges, root-most first, offsets verbatim.
        let mut ancestors: Vec<&TypeHandle> = ty.ancestors().collect();
        ancestors.reverse();
        for ancestor in ancestors {
            let layout = ancestor.interface_layout().unwrap_or_else(|| {
                panic!("ancestor {} of {} has no interface layout", ancestor.full_name(), ty.full_name())
            });
            for e in layout.entries() {
                if seen.insert(e.iid()) {
                    entries.push(InterfaceEntry {
                        introduced: false,
                        ..e.clone()
                    });
                }
            }
        }

        let mut cursor = start;
        for iface in own_interfaces(ty) {
            if !iface.is_interface() {
                return Err(TypeLoadError::NotAnInterface {
                    type_name: ty.full_name(),
                    interface: iface.full_name(),
                });
            }
            if !Arc::ptr_eq(&iface, ty) {
                self.loader
                    .ensure_built(&iface)
                    .map_err(|e| TypeLoadError::InterfaceFailed {
                        type_name: ty.full_name(),
                        interface: iface.full_name(),
                        source: Box::new(e),
                    })?;
            }
            if !seen.insert(iid_of(&iface)) {
                continue;
            }
            trace!(
                "{}: {} at offset {}",
                ty.full_name(),
                iface.full_name(),
                cursor
            );
            let count = iface.virtual_method_count();
            entries.push(InterfaceEntry {
                interface: iface,
                offset: cursor,
                introduced: true,
            });
            cursor += count;
        }

        Ok(InterfaceLayout::new(entries, start, cursor))
    }

    /// A generic instantiation has the geometry of its definition. Only the interface identities
    /// are substituted.
    fn copy_from_definition(
        &mut self,
        ty: &TypeHandle,
        definition: &TypeHandle,
        args: &[TypeHandle],
        start: usize,
    ) -> Result<InterfaceLayout, TypeLoadError> {
        let shape_mismatch = || TypeLoadError::GenericShapeMismatch {
            type_name: ty.full_name(),
            definition: definition.full_name(),
        };
        self.loader
            .ensure_built(definition)
            .map_err(|e| TypeLoadError::ParentFailed {
                type_name: ty.full_name(),
                parent: definition.full_name(),
                source: Box::new(e),
            })?;
        let def_layout = definition
            .interface_layout()
            .ok_or_else(|| TypeLoadError::CircularInheritance {
                type_name: ty.full_name(),
            })?;
        if def_layout.start_slot() != start {
            return Err(shape_mismatch());
        }

        let mut entries = Vec::with_capacity(def_layout.len());
        let mut seen = HashSet::new();
        for e in def_layout.entries() {
            let inflated = if Arc::ptr_eq(&e.interface, definition) {
                ty.clone()
            } else {
                self.loader.type_system().inflate(&e.interface, args)
            };
            if !inflated.is_interface() {
                return Err(TypeLoadError::NotAnInterface {
                    type_name: ty.full_name(),
                    interface: inflated.full_name(),
                });
            }
            if !Arc::ptr_eq(&inflated, ty) && !Arc::ptr_eq(&inflated, &e.interface) {
                self.loader
                    .ensure_built(&inflated)
                    .map_err(|err| TypeLoadError::InterfaceFailed {
                        type_name: ty.full_name(),
                        interface: inflated.full_name(),
                        source: Box::new(err),
                    })?;
            }
            if inflated.virtual_method_count() != e.interface.virtual_method_count()
                || !seen.insert(iid_of(&inflated))
            {
                return Err(shape_mismatch());
            }
            entries.push(InterfaceEntry {
                interface: inflated,
                offset: e.offset,
                introduced: e.introduced,
            });
        }
        Ok(InterfaceLayout::new(
            entries,
            start,
            def_layout.next_slot(),
        ))
    }
}
