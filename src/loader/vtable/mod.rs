//! Building the dispatch table of a type.
//!
//! The table is laid out as the parent's slots, then one range per interface the type
//! introduces (at the offsets chosen by [`super::interface_offsets`]), then the type's own new
//! virtual methods. An interface's table is just its own methods, numbered in declaration order.
//!
//! Once built, a table is published on its type and never changes.

mod override_map;

use std::fmt;
use std::sync::Arc;

use self::override_map::{InterfaceOverrideMap, Resolution};
use super::interface_offsets::InterfaceLayout;
use super::signature::{MethodSignature, SignatureRelation};
use super::{Loader, MethodDesc, MethodHandle, TypeHandle};
use crate::error::{RejectReason, RejectedCandidate, TypeLoadError, UnresolvedType};
use crate::vm::TypeSystem;

/// What a vtable slot dispatches to.
#[derive(Clone)]
pub enum Slot {
    Method(MethodHandle),
    /// Several interface bodies, none more specific than the others. Calling it fails.
    Ambiguous(Arc<[MethodHandle]>),
    /// An interface re-declared the method abstract. Calling it fails.
    Reabstracted(MethodHandle),
}

impl Slot {
    /// The method a call lands on, if there is exactly one and it has a body.
    pub fn target(&self) -> Option<&MethodHandle> {
        match self {
            Slot::Method(m) if !m.is_abstract() => Some(m),
            _ => None,
        }
    }

    fn is_interface_supplied(&self) -> bool {
        match self {
            Slot::Method(m) => m.is_interface_method(),
            Slot::Ambiguous(_) | Slot::Reabstracted(_) => true,
        }
    }

    fn holds(&self, method: &MethodHandle) -> bool {
        matches!(self, Slot::Method(m) if Arc::ptr_eq(m, method))
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Slot::Method(a), Slot::Method(b)) => Arc::ptr_eq(a, b),
            (Slot::Reabstracted(a), Slot::Reabstracted(b)) => Arc::ptr_eq(a, b),
            (Slot::Ambiguous(a), Slot::Ambiguous(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| Arc::ptr_eq(x, y))
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Method(m) => write!(f, "{}", m.full_name()),
            Slot::Reabstracted(m) => write!(f, "abstract {}", m.full_name()),
            Slot::Ambiguous(c) => {
                let names: Vec<String> = c.iter().map(|m| m.full_name()).collect();
                write!(f, "ambiguous [{}]", names.join(", "))
            }
        }
    }
}

/// A method name that cannot be dispatched by name because several unrelated interfaces supply a
/// body for it.
#[derive(Clone, Debug)]
pub struct Ambiguity {
    pub method: String,
    pub signature: MethodSignature,
    /// The interface method the bodies compete for, when they override one.
    pub declaration: Option<MethodHandle>,
    pub candidates: Vec<MethodHandle>,
}

impl Ambiguity {
    pub fn candidate_names(&self) -> Vec<String> {
        self.candidates.iter().map(|m| m.full_name()).collect()
    }
}

/// The published vtable of a type.
#[derive(Debug)]
pub struct DispatchTable {
    slots: Arc<[Slot]>,
    ambiguities: Vec<Ambiguity>,
    shared: bool,
}

impl DispatchTable {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn ambiguities(&self) -> &[Ambiguity] {
        &self.ambiguities
    }

    /// The slot array is the parent's, because the two would have been identical.
    pub fn is_shared_with_parent(&self) -> bool {
        self.shared
    }

    pub fn shares_slots_with(&self, other: &DispatchTable) -> bool {
        Arc::ptr_eq(&self.slots, &other.slots)
    }
}

/// Whether `candidate` may stand in for a method it compares to as `relation`.
fn accepts(relation: SignatureRelation, candidate: &MethodDesc) -> Result<(), RejectReason> {
    match relation {
        SignatureRelation::Equal => Ok(()),
        SignatureRelation::Covariant if !cfg!(feature = "covariant_returns") => {
            Err(RejectReason::CovariantReturnsDisabled)
        }
        SignatureRelation::Covariant if candidate.has_covariant_return() => Ok(()),
        SignatureRelation::Covariant | SignatureRelation::Unrelated => {
            Err(RejectReason::SignatureMismatch)
        }
    }
}

struct MissingMethod {
    interface: String,
    method: String,
    rejected: Vec<RejectedCandidate>,
}

pub struct VTableBuilder<'l, 'a, TS: TypeSystem> {
    loader: &'l mut Loader<'a, TS>,
    ty: &'l TypeHandle,
    parent_size: usize,
    slots: Vec<Option<Slot>>,
    overrides: InterfaceOverrideMap,
    /// Interface slots whose explicit overrides conflict, with the declaration.
    pending: Vec<(usize, MethodHandle)>,
    missing: Vec<MissingMethod>,
    ambiguities: Vec<Ambiguity>,
}

impl<'l, 'a, TS: TypeSystem> VTableBuilder<'l, 'a, TS> {
    pub(crate) fn new(loader: &'l mut Loader<'a, TS>, ty: &'l TypeHandle) -> Self {
        VTableBuilder {
            loader,
            ty,
            parent_size: 0,
            slots: vec![],
            overrides: InterfaceOverrideMap::new(),
            pending: vec![],
            missing: vec![],
            ambiguities: vec![],
        }
    }

    /// Build the table. Publishing it, or the failure, is up to the caller.
    pub fn build(mut self) -> Result<DispatchTable, TypeLoadError> {
        let ty = self.ty;
        self.check_signatures()?;
        let layout = self.loader.resolve_interface_offsets(ty, None)?;
        let parent_table = ty.parent().map(|p| {
            p.dispatch_table()
                .unwrap_or_else(|| panic!("parent {} of {} is not built", p.full_name(), ty.full_name()))
        });
        self.parent_size = parent_table.map_or(0, DispatchTable::len);
        debug_assert_eq!(layout.start_slot(), self.parent_size);

        let estimate = self.parent_size
            + layout
                .entries()
                .iter()
                .filter(|e| e.introduced)
                .map(|e| e.interface.virtual_method_count())
                .sum::<usize>()
            + ty.virtual_method_count()
            + usize::from(ty.is_array());
        self.slots.reserve_exact(estimate);

        if let Some(parent) = parent_table {
            self.slots.extend(parent.slots().iter().cloned().map(Some));
        }
        self.slots.resize(layout.next_slot(), None);

        self.collect_interface_overrides(layout)?;
        if !ty.is_interface() {
            self.apply_class_overrides(layout)?;
        }
        self.fill_interface_slots(layout)?;
        self.check_missing_interface_methods()?;
        self.place_virtual_methods()?;
        #[cfg(feature = "covariant_returns")]
        self.check_covariant_returns()?;
        self.resolve_conflicts();
        self.find_name_ambiguities();
        self.check_concrete()?;

        assert!(
            self.slots.len() <= estimate,
            "{}: {} slots exceed the estimate of {}",
            ty.full_name(),
            self.slots.len(),
            estimate
        );
        for m in ty.virtual_methods() {
            assert!(m.slot().is_some(), "{} was not given a slot", m.full_name());
        }
        Ok(self.finish(parent_table))
    }

    fn type_name(&self) -> String {
        self.ty.full_name()
    }

    fn unresolvable(&self, method: &MethodDesc, e: UnresolvedType) -> TypeLoadError {
        TypeLoadError::UnresolvableSignature {
            type_name: self.type_name(),
            method: method.full_name(),
            unresolved: e.name,
        }
    }

    fn compare(
        &self,
        candidate: &MethodDesc,
        target: &MethodDesc,
    ) -> Result<SignatureRelation, TypeLoadError> {
        self.loader
            .type_system()
            .compare_signatures(candidate.signature(), target.signature())
            .map_err(|e| self.unresolvable(candidate, e))
    }

    fn check_signatures(&self) -> Result<(), TypeLoadError> {
        for m in self.ty.methods() {
            if let Some(name) = m.signature().first_unresolved() {
                return Err(self.unresolvable(
                    m,
                    UnresolvedType {
                        name: name.to_string(),
                    },
                ));
            }
        }
        Ok(())
    }

    /// Record the overrides every implemented interface declares for methods of the interfaces
    /// it extends.
    fn collect_interface_overrides(&mut self, layout: &InterfaceLayout) -> Result<(), TypeLoadError> {
        for entry in layout.entries() {
            let iface = &entry.interface;
            for mi in iface.method_impls() {
                let malformed = |reason: &str| TypeLoadError::MalformedOverride {
                    type_name: iface.full_name(),
                    declaration: mi.declaration.full_name(),
                    body: mi.body.to_string(),
                    reason: reason.to_string(),
                };
                let body = iface
                    .find_method(&mi.body)
                    .cloned()
                    .ok_or_else(|| malformed("no method with that name"))?;
                if !mi.declaration.is_interface_method() {
                    return Err(malformed("an interface can only override interface methods"));
                }
                if !iface.extends_interface(&mi.declaration.owner_type()) {
                    return Err(malformed("the declaring interface is not extended"));
                }
                self.overrides.record(&mi.declaration, &body, iface);
            }
        }
        Ok(())
    }

    fn apply_class_overrides(&mut self, layout: &InterfaceLayout) -> Result<(), TypeLoadError> {
        let ty = self.ty;
        for mi in ty.method_impls() {
            let decl = &mi.declaration;
            let malformed = |reason: &str| TypeLoadError::MalformedOverride {
                type_name: ty.full_name(),
                declaration: decl.full_name(),
                body: mi.body.to_string(),
                reason: reason.to_string(),
            };
            let body = ty
                .find_method(&mi.body)
                .cloned()
                .ok_or_else(|| malformed("no method with that name"))?;
            if !body.needs_slot() {
                return Err(malformed("the body is not virtual"));
            }
            if let Err(reason) = accepts(self.compare(&body, decl)?, &body) {
                return Err(malformed(&reason.to_string()));
            }
            let owner = decl.owner_type();
            if decl.is_interface_method() {
                if layout.offset_of(&owner).is_none() {
                    return Err(malformed("the interface is not implemented"));
                }
                if self.overrides.has_class_candidate(decl) {
                    return Err(malformed("the declaration is already overridden"));
                }
                self.overrides.record(decl, &body, ty);
            } else {
                if !ty.is_subclass_of(&owner) {
                    return Err(malformed("the declaring type is not an ancestor"));
                }
                if !decl.needs_slot() {
                    return Err(malformed("the declaration is not virtual"));
                }
                if decl.is_final() {
                    return Err(TypeLoadError::OverrideOfFinal {
                        type_name: ty.full_name(),
                        method: body.full_name(),
                        overridden: decl.full_name(),
                    });
                }
                let slot = decl
                    .slot()
                    .unwrap_or_else(|| panic!("{} of a built ancestor has no slot", decl.full_name()));
                // Every inherited slot holding the replaced body follows the override.
                match self.slots[slot].clone() {
                    Some(Slot::Method(replaced)) => {
                        for s in self.slots.iter_mut() {
                            if s.as_ref().is_some_and(|s| s.holds(&replaced)) {
                                *s = Some(Slot::Method(body.clone()));
                            }
                        }
                    }
                    _ => self.slots[slot] = Some(Slot::Method(body.clone())),
                }
                if body.slot().is_none() && !body.is_new_slot() {
                    body.set_slot(slot);
                }
            }
        }
        Ok(())
    }

    fn fill_interface_slots(&mut self, layout: &InterfaceLayout) -> Result<(), TypeLoadError> {
        let ty = self.ty;
        for entry in layout.entries() {
            let iface = &entry.interface;
            let declared = entry.introduced
                || ty
                    .declared_interfaces()
                    .iter()
                    .any(|i| Arc::ptr_eq(i, iface));
            for (i, decl) in iface.virtual_methods().enumerate() {
                if !Arc::ptr_eq(iface, ty) {
                    debug_assert_eq!(decl.slot(), Some(i));
                }
                let s = entry.offset + i;
                let left_abstract = matches!(
                    &self.slots[s],
                    Some(Slot::Method(m)) if m.is_interface_method() && m.is_abstract()
                );
                if declared || (left_abstract && !ty.is_interface()) {
                    self.fill_slot(s, decl)?;
                } else {
                    self.refresh_inherited_slot(s, decl);
                }
            }
        }
        Ok(())
    }

    /// An inherited interface slot keeps its body unless this type overrides it explicitly, or
    /// it came from an interface and a newly visible interface is more specific.
    fn refresh_inherited_slot(&mut self, s: usize, decl: &MethodHandle) {
        match self.overrides.resolve(decl) {
            Some(Resolution::Class(body)) => self.slots[s] = Some(Slot::Method(body)),
            Some(resolution)
                if self.slots[s]
                    .as_ref()
                    .is_some_and(Slot::is_interface_supplied) =>
            {
                self.apply_resolution(s, decl, resolution)
            }
            _ => {}
        }
    }

    fn fill_slot(&mut self, s: usize, decl: &MethodHandle) -> Result<(), TypeLoadError> {
        let ty = self.ty;
        let resolution = self.overrides.resolve(decl);
        if let Some(Resolution::Class(body)) = &resolution {
            self.slots[s] = Some(Slot::Method(body.clone()));
            return Ok(());
        }
        let mut rejected = vec![];
        if !ty.is_interface() {
            if let Some(m) = self.find_implicit(decl, &mut rejected)? {
                if m.is_owned_by(ty) && m.slot().is_none() && self.find_overridden(&m)?.is_none() {
                    m.set_slot(s);
                }
                self.slots[s] = Some(Slot::Method(m));
                return Ok(());
            }
        }
        match resolution {
            Some(resolution) => self.apply_resolution(s, decl, resolution),
            None => {
                if decl.is_abstract() && !ty.is_abstract() {
                    self.missing.push(MissingMethod {
                        interface: decl.owner_type().full_name(),
                        method: decl.name().to_string(),
                        rejected,
                    });
                }
                self.slots[s] = Some(Slot::Method(decl.clone()));
            }
        }
        Ok(())
    }

    fn apply_resolution(&mut self, s: usize, decl: &MethodHandle, resolution: Resolution) {
        self.slots[s] = match resolution {
            Resolution::Class(body) => Some(Slot::Method(body)),
            Resolution::Unique(body) if body.is_abstract() => Some(Slot::Reabstracted(body)),
            Resolution::Unique(body) => Some(Slot::Method(body)),
            Resolution::Conflict(_) => {
                self.pending.push((s, decl.clone()));
                None
            }
        };
    }

    /// A class method implementing `decl` by name and signature: this type's own methods first,
    /// then inherited ones, most derived first.
    fn find_implicit(
        &self,
        decl: &MethodHandle,
        rejected: &mut Vec<RejectedCandidate>,
    ) -> Result<Option<MethodHandle>, TypeLoadError> {
        let own = self.ty.methods().iter().filter(|m| m.name() == decl.name());
        let inherited = self.slots[..self.parent_size]
            .iter()
            .rev()
            .filter_map(|s| match s {
                Some(Slot::Method(m)) if !m.is_interface_method() && m.name() == decl.name() => {
                    Some(m)
                }
                _ => None,
            });
        let mut considered: Vec<&MethodHandle> = vec![];
        for m in own.chain(inherited) {
            if considered.iter().any(|c| Arc::ptr_eq(c, m)) {
                continue;
            }
            considered.push(m);
            let reason = if !m.needs_slot() {
                Some(RejectReason::NotVirtual)
            } else if !self.loader.type_system().can_implement(m, decl) {
                Some(RejectReason::NotAccessible)
            } else {
                accepts(self.compare(m, decl)?, m).err()
            };
            match reason {
                None => return Ok(Some(m.clone())),
                Some(reason) => rejected.push(RejectedCandidate {
                    method: m.full_name(),
                    reason,
                }),
            }
        }
        Ok(None)
    }

    /// The inherited class method `m` overrides, if any.
    fn find_overridden(&self, m: &MethodHandle) -> Result<Option<MethodHandle>, TypeLoadError> {
        if m.is_new_slot() {
            return Ok(None);
        }
        for slot in self.slots[..self.parent_size].iter().rev() {
            let Some(Slot::Method(p)) = slot else {
                continue;
            };
            if p.is_interface_method() || p.name() != m.name() || p.is_owned_by(self.ty) {
                continue;
            }
            if !self.loader.type_system().can_override(m, p) {
                continue;
            }
            if accepts(self.compare(m, p)?, m).is_ok() {
                return Ok(Some(p.clone()));
            }
        }
        Ok(None)
    }

    fn check_missing_interface_methods(&mut self) -> Result<(), TypeLoadError> {
        if self.missing.is_empty() {
            return Ok(());
        }
        let also_missing = self.missing.len() - 1;
        let first = self.missing.swap_remove(0);
        Err(TypeLoadError::MissingInterfaceMethod {
            type_name: self.type_name(),
            interface: first.interface,
            method: first.method,
            rejected: first.rejected,
            also_missing,
        })
    }

    /// Give every virtual method of this type a slot: an interface numbers its own methods, a
    /// class reuses the slot of the method it overrides or appends a new one.
    fn place_virtual_methods(&mut self) -> Result<(), TypeLoadError> {
        let ty = self.ty;
        if ty.is_interface() {
            for (ordinal, m) in ty.virtual_methods().enumerate() {
                debug_assert!(self.slots[ordinal]
                    .as_ref()
                    .is_some_and(|s| s.holds(m) || s.is_interface_supplied()));
                m.set_slot(ordinal);
            }
            return Ok(());
        }
        for m in ty.virtual_methods() {
            if m.slot().is_some() {
                continue;
            }
            match self.find_overridden(m)? {
                Some(overridden) => {
                    if overridden.is_final() {
                        return Err(TypeLoadError::OverrideOfFinal {
                            type_name: ty.full_name(),
                            method: m.full_name(),
                            overridden: overridden.full_name(),
                        });
                    }
                    let slot = overridden.slot().unwrap_or_else(|| {
                        panic!("{} of a built ancestor has no slot", overridden.full_name())
                    });
                    trace!("{} overrides {} at slot {}", m.full_name(), overridden.full_name(), slot);
                    m.set_slot(slot);
                    for s in self.slots.iter_mut() {
                        if s.as_ref().is_some_and(|s| s.holds(&overridden)) {
                            *s = Some(Slot::Method(m.clone()));
                        }
                    }
                }
                None => {
                    m.set_slot(self.slots.len());
                    self.slots.push(Some(Slot::Method(m.clone())));
                }
            }
        }
        Ok(())
    }

    /// Along a chain of overrides, a return type may only narrow. Checked against the method each
    /// ancestor has in the same slot, whenever either side is declared covariant.
    #[cfg(feature = "covariant_returns")]
    fn check_covariant_returns(&self) -> Result<(), TypeLoadError> {
        let ty = self.ty;
        if ty.is_interface() {
            return Ok(());
        }
        for m in ty.virtual_methods() {
            let Some(s) = m.slot() else {
                continue;
            };
            if s >= self.parent_size {
                continue;
            }
            for ancestor in ty.ancestors() {
                let Some(Slot::Method(am)) = ancestor.dispatch_table().and_then(|t| t.slot(s))
                else {
                    continue;
                };
                if am.is_interface_method() || Arc::ptr_eq(am, m) {
                    continue;
                }
                if !m.has_covariant_return() && !am.has_covariant_return() {
                    continue;
                }
                let narrower = self
                    .loader
                    .type_system()
                    .is_assignable_to(&m.signature().ret, &am.signature().ret)
                    .map_err(|e| self.unresolvable(m, e))?;
                if !narrower {
                    return Err(TypeLoadError::CovariantReturnMismatch {
                        type_name: ty.full_name(),
                        method: m.full_name(),
                        signature: m.signature().to_string(),
                        ancestor_method: am.full_name(),
                        ancestor_signature: am.signature().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn resolve_conflicts(&mut self) {
        for (s, decl) in std::mem::take(&mut self.pending) {
            let candidates = match self.overrides.resolve(&decl) {
                Some(Resolution::Conflict(candidates)) => candidates,
                other => panic!("slot {} of {} is no longer in conflict: {:?}", s, self.type_name(), other),
            };
            debug!(
                "{}: {} is ambiguous between {} bodies",
                self.type_name(),
                decl.full_name(),
                candidates.len()
            );
            self.slots[s] = Some(Slot::Ambiguous(candidates.clone().into()));
            self.ambiguities.push(Ambiguity {
                method: decl.name().to_string(),
                signature: decl.signature().clone(),
                declaration: Some(decl),
                candidates,
            });
        }
    }

    /// Default bodies of the same name and signature reachable through unrelated interfaces make
    /// a call by name ambiguous, unless a class method of that name takes precedence.
    fn find_name_ambiguities(&mut self) {
        let ty = self.ty;
        if ty.is_interface() {
            return;
        }
        let mut groups: Vec<(String, MethodSignature, Vec<MethodHandle>)> = vec![];
        for slot in self.slots.iter().flatten() {
            let Slot::Method(m) = slot else {
                continue;
            };
            if !m.is_interface_method() || m.is_abstract() {
                continue;
            }
            match groups
                .iter_mut()
                .find(|(name, sig, _)| name.as_str() == m.name() && sig == m.signature())
            {
                Some((_, _, bodies)) => {
                    if !bodies.iter().any(|b| Arc::ptr_eq(b, m)) {
                        bodies.push(m.clone());
                    }
                }
                None => groups.push((m.name().to_string(), m.signature().clone(), vec![m.clone()])),
            }
        }
        for (name, signature, bodies) in groups {
            let survivors: Vec<MethodHandle> = bodies
                .iter()
                .filter(|b| {
                    let owner = b.owner_type();
                    !bodies.iter().any(|other| {
                        !Arc::ptr_eq(other, *b) && other.owner_type().extends_interface(&owner)
                    })
                })
                .cloned()
                .collect();
            if survivors.len() < 2 {
                continue;
            }
            let class_method = self
                .slots
                .iter()
                .flatten()
                .filter_map(|s| match s {
                    Slot::Method(m) => Some(m),
                    _ => None,
                })
                .chain(ty.methods())
                .chain(ty.ancestors().flat_map(|a| a.methods()))
                .any(|m| !m.is_interface_method() && m.name() == name);
            if class_method
                || self
                    .ambiguities
                    .iter()
                    .any(|a| a.method == name && a.signature == signature)
            {
                continue;
            }
            debug!("{}: {} is ambiguous by name", ty.full_name(), name);
            self.ambiguities.push(Ambiguity {
                method: name,
                signature,
                declaration: None,
                candidates: survivors,
            });
        }
    }

    fn check_concrete(&self) -> Result<(), TypeLoadError> {
        let ty = self.ty;
        if ty.is_abstract() {
            return Ok(());
        }
        for slot in self.slots.iter().flatten() {
            if let Slot::Method(m) = slot {
                if !m.is_abstract() {
                    continue;
                }
                return Err(if m.is_interface_method() {
                    TypeLoadError::MissingInterfaceMethod {
                        type_name: ty.full_name(),
                        interface: m.owner_type().full_name(),
                        method: m.name().to_string(),
                        rejected: vec![],
                        also_missing: 0,
                    }
                } else {
                    TypeLoadError::AbstractMethodNotImplemented {
                        type_name: ty.full_name(),
                        method: m.full_name(),
                    }
                });
            }
        }
        Ok(())
    }

    fn finish(self, parent: Option<&DispatchTable>) -> DispatchTable {
        let ty = self.ty;
        let slots: Vec<Slot> = self
            .slots
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.unwrap_or_else(|| panic!("{}: slot {} was never filled", ty.full_name(), i)))
            .collect();
        if self.loader.options().share_identical_vtables {
            if let Some(parent) = parent {
                if parent.slots() == &slots[..] {
                    trace!("{} shares the vtable of its parent", ty.full_name());
                    return DispatchTable {
                        slots: parent.slots.clone(),
                        ambiguities: self.ambiguities,
                        shared: true,
                    };
                }
            }
        }
        DispatchTable {
            slots: slots.into(),
            ambiguities: self.ambiguities,
            shared: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::loader::{MethodDef, MethodFlags, TypeDef, TypeFlags};
    use crate::util::test_util::fixtures::*;
    use crate::util::test_util::mock_vm::runtime;

    #[test]
    fn interface_method_is_implemented_by_name() {
        let rt = runtime();
        let i = interface(&rt, "I", &["M"]);
        let a = class(&rt, "A", None, &[&i], &["M"]);
        let table = rt.build_vtable(&a).unwrap();
        assert_eq!(slot_names(table), vec!["A.M"]);
        assert_eq!(method(&a, "M").slot(), Some(0));
        assert_eq!(method(&i, "M").slot(), Some(0));
    }

    #[test]
    fn rejected_candidates_are_reported() {
        let rt = runtime();
        let i = interface(&rt, "I", &["M", "N"]);
        let c = rt.define_type(
            TypeDef::class("", "C")
                .implements(&i)
                .method(MethodDef::instance_method("M")),
        );
        match rt.build_vtable(&c).unwrap_err() {
            TypeLoadError::MissingInterfaceMethod {
                interface,
                method,
                rejected,
                also_missing,
                ..
            } => {
                assert_eq!(interface, "I");
                assert_eq!(method, "M");
                assert_eq!(
                    rejected,
                    vec![RejectedCandidate {
                        method: "C.M".into(),
                        reason: RejectReason::NotVirtual,
                    }]
                );
                assert_eq!(also_missing, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn inaccessible_and_mismatched_candidates_are_rejected() {
        let rt = runtime();
        let i = interface(&rt, "I", &["M"]);
        let private = rt.define_type(
            TypeDef::class("", "Private").implements(&i).method(
                MethodDef::virtual_method("M")
                    .without_flags(MethodFlags::PUBLIC)
                    .with_flags(MethodFlags::PRIVATE),
            ),
        );
        let mismatched = rt.define_type(
            TypeDef::class("", "Mismatched").implements(&i).method(
                MethodDef::virtual_method("M").with_signature(MethodSignature::new(
                    vec![crate::loader::SigType::named("int")],
                    crate::loader::SigType::Void,
                )),
            ),
        );
        let reason = |ty: &TypeHandle| match rt.build_vtable(ty).unwrap_err() {
            TypeLoadError::MissingInterfaceMethod { rejected, .. } => rejected[0].reason,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(reason(&private), RejectReason::NotAccessible);
        assert_eq!(reason(&mismatched), RejectReason::SignatureMismatch);
    }

    #[test]
    fn abstract_class_may_leave_interface_methods_open() {
        let rt = runtime();
        let i = interface(&rt, "I", &["M"]);
        let base = rt.define_type(
            TypeDef::class("", "Base")
                .with_flags(TypeFlags::ABSTRACT)
                .implements(&i),
        );
        let table = rt.build_vtable(&base).unwrap();
        assert_eq!(slot_names(table), vec!["I.M"]);

        // A concrete subclass picks the method up without listing the interface again.
        let derived = class(&rt, "Derived", Some(&base), &[], &["M"]);
        let table = rt.build_vtable(&derived).unwrap();
        assert_eq!(slot_names(table), vec!["Derived.M"]);
        let m = rt.dispatch_interface(&derived, &method(&i, "M")).unwrap();
        assert!(Arc::ptr_eq(&m, &method(&derived, "M")));
    }

    #[test]
    fn override_reuses_the_parent_slot_everywhere() {
        let rt = runtime();
        let i = interface(&rt, "I", &["M"]);
        let base = class(&rt, "Base", None, &[&i], &["M", "Other"]);
        let derived = class(&rt, "Derived", Some(&base), &[], &["M"]);
        assert_eq!(
            slot_names(rt.build_vtable(&derived).unwrap()),
            vec!["Derived.M", "Base.Other"]
        );
        assert_eq!(method(&derived, "M").slot(), Some(0));
        let via_base = rt.dispatch_virtual(&derived, &method(&base, "M")).unwrap();
        assert!(Arc::ptr_eq(&via_base, &method(&derived, "M")));
    }

    #[test]
    fn new_slot_does_not_override() {
        let rt = runtime();
        let base = class(&rt, "Base", None, &[], &["Run"]);
        let derived = rt.define_type(
            TypeDef::class("", "Derived")
                .extends(&base)
                .method(MethodDef::virtual_method("Run").with_flags(MethodFlags::NEW_SLOT)),
        );
        assert_eq!(
            slot_names(rt.build_vtable(&derived).unwrap()),
            vec!["Base.Run", "Derived.Run"]
        );
        let hidden = rt.dispatch_virtual(&derived, &method(&base, "Run")).unwrap();
        assert!(Arc::ptr_eq(&hidden, &method(&base, "Run")));
    }

    #[test]
    fn final_methods_cannot_be_overridden() {
        let rt = runtime();
        let base = rt.define_type(
            TypeDef::class("", "Base")
                .method(MethodDef::virtual_method("Run").with_flags(MethodFlags::FINAL)),
        );
        let derived = class(&rt, "Derived", Some(&base), &[], &["Run"]);
        assert_eq!(
            rt.build_vtable(&derived).unwrap_err(),
            TypeLoadError::OverrideOfFinal {
                type_name: "Derived".into(),
                method: "Derived.Run".into(),
                overridden: "Base.Run".into(),
            }
        );
    }

    #[test]
    fn concrete_class_must_implement_abstract_methods() {
        let rt = runtime();
        let base = rt.define_type(
            TypeDef::class("", "Shape")
                .with_flags(TypeFlags::ABSTRACT)
                .method(MethodDef::abstract_method("Area")),
        );
        assert!(rt.build_vtable(&base).is_ok());
        let square = class(&rt, "Square", Some(&base), &[], &[]);
        assert_eq!(
            rt.build_vtable(&square).unwrap_err(),
            TypeLoadError::AbstractMethodNotImplemented {
                type_name: "Square".into(),
                method: "Shape.Area".into(),
            }
        );
        let circle = class(&rt, "Circle", Some(&base), &[], &["Area"]);
        assert_eq!(slot_names(rt.build_vtable(&circle).unwrap()), vec!["Circle.Area"]);
    }

    #[test]
    fn explicit_overrides() {
        let rt = runtime();
        let i = interface(&rt, "I", &["M"]);
        let base = class(&rt, "Base", None, &[], &["Run"]);
        let c = rt.define_type(
            TypeDef::class("", "C")
                .extends(&base)
                .implements(&i)
                .method(MethodDef::virtual_method("ImplM").with_flags(MethodFlags::NEW_SLOT))
                .method(MethodDef::virtual_method("ImplRun"))
                .with_override(&method(&i, "M"), "ImplM")
                .with_override(&method(&base, "Run"), "ImplRun"),
        );
        let table = rt.build_vtable(&c).unwrap();
        assert_eq!(slot_names(table), vec!["C.ImplRun", "C.ImplM", "C.ImplM"]);
        assert_eq!(method(&c, "ImplRun").slot(), Some(0));
        let m = rt.dispatch_interface(&c, &method(&i, "M")).unwrap();
        assert!(Arc::ptr_eq(&m, &method(&c, "ImplM")));
    }

    #[test]
    fn explicit_override_follows_into_inherited_interface_slots() {
        let rt = runtime();
        let root = class(&rt, "Root", None, &[], &["M"]);
        let i = interface(&rt, "I", &["M"]);
        let base = class(&rt, "Base", Some(&root), &[&i], &[]);
        assert_eq!(slot_names(rt.build_vtable(&base).unwrap()), vec!["Root.M", "Root.M"]);

        let derived = rt.define_type(
            TypeDef::class("", "Derived")
                .extends(&base)
                .method(MethodDef::virtual_method("Impl"))
                .with_override(&method(&root, "M"), "Impl"),
        );
        assert_eq!(
            slot_names(rt.build_vtable(&derived).unwrap()),
            vec!["Derived.Impl", "Derived.Impl"]
        );
        let body = method(&derived, "Impl");
        let virt = rt.dispatch_virtual(&derived, &method(&root, "M")).unwrap();
        let via_i = rt.dispatch_interface(&derived, &method(&i, "M")).unwrap();
        assert!(Arc::ptr_eq(&virt, &body));
        assert!(Arc::ptr_eq(&via_i, &body));
    }

    #[test]
    fn explicit_override_needs_a_body() {
        let rt = runtime();
        let base = class(&rt, "Base", None, &[], &["Run"]);
        let c = rt.define_type(
            TypeDef::class("", "C")
                .extends(&base)
                .with_override(&method(&base, "Run"), "Missing"),
        );
        assert!(matches!(
            rt.build_vtable(&c).unwrap_err(),
            TypeLoadError::MalformedOverride { .. }
        ));
    }

    fn diamond<VM: crate::vm::VMBinding>(
        rt: &crate::Runtime<VM>,
    ) -> (TypeHandle, TypeHandle, TypeHandle) {
        let base = interface(rt, "IBase", &["M"]);
        let m = method(&base, "M");
        let left = rt.define_type(
            TypeDef::interface("", "ILeft")
                .implements(&base)
                .method(MethodDef::virtual_method("LeftM"))
                .with_override(&m, "LeftM"),
        );
        let right = rt.define_type(
            TypeDef::interface("", "IRight")
                .implements(&base)
                .method(MethodDef::virtual_method("RightM"))
                .with_override(&m, "RightM"),
        );
        (base, left, right)
    }

    #[test]
    fn diamond_of_defaults_is_ambiguous_only_when_called() {
        let rt = runtime();
        let (base, left, right) = diamond(&rt);
        let c = class(&rt, "C", None, &[&left, &right], &[]);
        let table = rt.build_vtable(&c).unwrap();
        assert_eq!(table.ambiguities().len(), 1);
        assert!(Arc::ptr_eq(
            table.ambiguities()[0].declaration.as_ref().unwrap(),
            &method(&base, "M")
        ));
        match rt.dispatch_interface(&c, &method(&base, "M")) {
            Err(DispatchError::Ambiguous { candidates, .. }) => {
                assert_eq!(candidates, vec!["ILeft.LeftM", "IRight.RightM"])
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            rt.dispatch_by_name(&c, "M"),
            Err(DispatchError::Ambiguous { .. })
        ));
        let left_m = rt.dispatch_interface(&c, &method(&left, "LeftM")).unwrap();
        assert!(Arc::ptr_eq(&left_m, &method(&left, "LeftM")));
    }

    #[test]
    fn more_specific_interface_wins_the_diamond() {
        let rt = runtime();
        let (base, left, _) = diamond(&rt);
        let more = rt.define_type(
            TypeDef::interface("", "IMore")
                .implements(&left)
                .method(MethodDef::virtual_method("MoreM"))
                .with_override(&method(&base, "M"), "MoreM"),
        );
        let c = class(&rt, "C", None, &[&left, &more], &[]);
        let table = rt.build_vtable(&c).unwrap();
        assert!(table.ambiguities().is_empty());
        let m = rt.dispatch_interface(&c, &method(&base, "M")).unwrap();
        assert!(Arc::ptr_eq(&m, &method(&more, "MoreM")));
    }

    #[test]
    fn class_method_settles_the_diamond() {
        let rt = runtime();
        let (base, left, right) = diamond(&rt);
        let c = class(&rt, "C", None, &[&left, &right], &["M"]);
        let table = rt.build_vtable(&c).unwrap();
        assert!(table.ambiguities().is_empty());
        let m = rt.dispatch_interface(&c, &method(&base, "M")).unwrap();
        assert!(Arc::ptr_eq(&m, &method(&c, "M")));
    }

    #[test]
    fn reabstracted_slot_faults_when_called() {
        let rt = runtime();
        let base = interface_extending(&rt, "IBase", &[], &[], &["M"]);
        let re = rt.define_type(
            TypeDef::interface("", "IRe")
                .implements(&base)
                .method(MethodDef::abstract_method("ReM"))
                .with_override(&method(&base, "M"), "ReM"),
        );
        let c = class(&rt, "C", None, &[&re], &["ReM"]);
        let table = rt.build_vtable(&c).unwrap();
        assert!(table
            .slots()
            .iter()
            .any(|s| matches!(s, Slot::Reabstracted(_))));
        assert!(matches!(
            rt.dispatch_interface(&c, &method(&base, "M")),
            Err(DispatchError::AbstractMethod { .. })
        ));
        assert!(rt.dispatch_interface(&c, &method(&re, "ReM")).is_ok());
    }

    #[cfg(feature = "covariant_returns")]
    mod covariant {
        use super::*;
        use crate::loader::SigType;

        fn returning(name: &str, ty: &TypeHandle) -> MethodDef {
            MethodDef::virtual_method(name)
                .with_signature(MethodSignature::new(vec![], SigType::Type(ty.clone())))
        }

        #[test]
        fn narrowing_override_is_accepted_only_when_tagged() {
            let rt = runtime();
            let animal = class(&rt, "Animal", None, &[], &[]);
            let dog = class(&rt, "Dog", Some(&animal), &[], &[]);
            let base = rt.define_type(TypeDef::class("", "Shelter").method(returning("Adopt", &animal)));
            let tagged = rt.define_type(
                TypeDef::class("", "DogShelter")
                    .extends(&base)
                    .method(returning("Adopt", &dog).with_flags(MethodFlags::COVARIANT_RETURN)),
            );
            let untagged = rt.define_type(
                TypeDef::class("", "OtherShelter")
                    .extends(&base)
                    .method(returning("Adopt", &dog)),
            );
            assert_eq!(rt.build_vtable(&tagged).unwrap().len(), 1);
            assert_eq!(rt.build_vtable(&untagged).unwrap().len(), 2);
        }

        #[test]
        fn chain_must_keep_narrowing() {
            let rt = runtime();
            let animal = class(&rt, "Animal", None, &[], &[]);
            let dog = class(&rt, "Dog", Some(&animal), &[], &[]);
            let cat = class(&rt, "Cat", Some(&animal), &[], &[]);
            let base = rt.define_type(TypeDef::class("", "Shelter").method(returning("Adopt", &animal)));
            let mid = rt.define_type(
                TypeDef::class("", "DogShelter")
                    .extends(&base)
                    .method(returning("Adopt", &dog).with_flags(MethodFlags::COVARIANT_RETURN)),
            );
            let leaf = rt.define_type(
                TypeDef::class("", "CatShelter")
                    .extends(&mid)
                    .method(returning("AdoptCat", &cat).with_flags(MethodFlags::COVARIANT_RETURN))
                    .with_override(&method(&base, "Adopt"), "AdoptCat"),
            );
            match rt.build_vtable(&leaf).unwrap_err() {
                TypeLoadError::CovariantReturnMismatch {
                    method,
                    ancestor_method,
                    ..
                } => {
                    assert_eq!(method, "CatShelter.AdoptCat");
                    assert_eq!(ancestor_method, "DogShelter.Adopt");
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
