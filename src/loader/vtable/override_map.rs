use std::sync::Arc;

use crate::loader::{MethodHandle, TypeHandle};

/// A body offered for an interface method, and the type offering it.
#[derive(Clone, Debug)]
pub struct OverrideCandidate {
    pub body: MethodHandle,
    pub supplier: TypeHandle,
}

impl OverrideCandidate {
    fn from_class(&self) -> bool {
        !self.supplier.is_interface()
    }

    /// `self` is more specific than `other`: both come from interfaces and `self`'s supplier
    /// extends `other`'s.
    fn dominates(&self, other: &OverrideCandidate) -> bool {
        !Arc::ptr_eq(&self.supplier, &other.supplier)
            && self.supplier.is_interface()
            && other.supplier.is_interface()
            && self.supplier.extends_interface(&other.supplier)
    }
}

/// What the explicit overrides say about one interface method.
#[derive(Clone, Debug)]
pub enum Resolution {
    /// The class being built names a body itself. Always wins.
    Class(MethodHandle),
    /// Exactly one most-specific interface body.
    Unique(MethodHandle),
    /// Several interface bodies, none more specific than the others.
    Conflict(Vec<MethodHandle>),
}

/// Explicit overrides of interface methods, keyed by the overridden declaration.
///
/// Candidates are only collected here. Picking the winner is deferred to [`Self::resolve`], so a
/// diamond is reported as a conflict rather than settled by discovery order.
#[derive(Default, Debug)]
pub struct InterfaceOverrideMap {
    entries: Vec<(MethodHandle, Vec<OverrideCandidate>)>,
}

impl InterfaceOverrideMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn candidates(&self, declaration: &MethodHandle) -> Option<&[OverrideCandidate]> {
        self.entries
            .iter()
            .find(|(d, _)| Arc::ptr_eq(d, declaration))
            .map(|(_, c)| c.as_slice())
    }

    pub fn has_class_candidate(&self, declaration: &MethodHandle) -> bool {
        self.candidates(declaration)
            .is_some_and(|c| c.iter().any(OverrideCandidate::from_class))
    }

    pub fn record(&mut self, declaration: &MethodHandle, body: &MethodHandle, supplier: &TypeHandle) {
        trace!(
            "{} overrides {} (from {})",
            body.full_name(),
            declaration.full_name(),
            supplier.full_name()
        );
        let candidate = OverrideCandidate {
            body: body.clone(),
            supplier: supplier.clone(),
        };
        match self
            .entries
            .iter_mut()
            .find(|(d, _)| Arc::ptr_eq(d, declaration))
        {
            Some((_, candidates)) => {
                if !candidates
                    .iter()
                    .any(|c| Arc::ptr_eq(&c.body, body) && Arc::ptr_eq(&c.supplier, supplier))
                {
                    candidates.push(candidate);
                }
            }
            None => self.entries.push((declaration.clone(), vec![candidate])),
        }
    }

    /// Pick the body for `declaration`. `None` when nothing overrides it.
    pub fn resolve(&self, declaration: &MethodHandle) -> Option<Resolution> {
        let candidates = self.candidates(declaration)?;
        if let Some(class) = candidates.iter().rev().find(|c| c.from_class()) {
            return Some(Resolution::Class(class.body.clone()));
        }
        let mut survivors: Vec<MethodHandle> = vec![];
        for c in candidates {
            if candidates.iter().any(|other| other.dominates(c)) {
                continue;
            }
            if !survivors.iter().any(|s| Arc::ptr_eq(s, &c.body)) {
                survivors.push(c.body.clone());
            }
        }
        match survivors.len() {
            0 => None,
            1 => survivors.pop().map(Resolution::Unique),
            _ => Some(Resolution::Conflict(survivors)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
