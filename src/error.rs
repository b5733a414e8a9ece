//! Error types.
//!
//! A [`TypeLoadError`] is stored on the type that failed and handed out again to every later
//! caller, which is why it is `Clone` and carries names rather than handles. A
//! [`DispatchError`] is raised at call time and leaves the type usable. Internal inconsistencies in
//! the loader are assertions and never appear here.

use itertools::Itertools;
use strum_macros::Display;
use thiserror::Error;

/// Why an interface method could not be implemented by a particular class method.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum RejectReason {
    #[strum(to_string = "it is not virtual")]
    NotVirtual,
    #[strum(to_string = "it is not accessible from the interface")]
    NotAccessible,
    #[strum(to_string = "its signature does not match")]
    SignatureMismatch,
    #[strum(to_string = "its return type only matches covariantly, and covariant returns are disabled")]
    CovariantReturnsDisabled,
}

/// A same-named class method that was considered for an interface slot and turned down.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedCandidate {
    pub method: String,
    pub reason: RejectReason,
}

fn describe_rejected(rejected: &[RejectedCandidate], also_missing: &usize) -> String {
    let mut msg = if rejected.is_empty() {
        "no candidate with that name".to_string()
    } else {
        rejected
            .iter()
            .map(|r| format!("{} was rejected because {}", r.method, r.reason))
            .join("; ")
    };
    if *also_missing > 0 {
        msg += &format!(", and {} more interface methods are missing", also_missing);
    }
    msg
}

/// A permanent failure to lay out a type.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum TypeLoadError {
    #[error("type {type_name} lists {interface} as an interface, but it is not one")]
    NotAnInterface { type_name: String, interface: String },

    #[error("type {type_name} cannot be loaded because its parent {parent} failed to load")]
    ParentFailed {
        type_name: String,
        parent: String,
        #[source]
        source: Box<TypeLoadError>,
    },

    #[error("type {type_name} cannot be loaded because its interface {interface} failed to load")]
    InterfaceFailed {
        type_name: String,
        interface: String,
        #[source]
        source: Box<TypeLoadError>,
    },

    #[error("type {type_name} has a malformed override of {declaration} by {body}: {reason}")]
    MalformedOverride {
        type_name: String,
        declaration: String,
        body: String,
        reason: String,
    },

    #[error("type {type_name}: the signature of {method} refers to {unresolved}, which cannot be resolved")]
    UnresolvableSignature {
        type_name: String,
        method: String,
        unresolved: String,
    },

    #[error(
        "type {type_name} does not implement {interface}.{method} ({})",
        describe_rejected(.rejected, .also_missing)
    )]
    MissingInterfaceMethod {
        type_name: String,
        interface: String,
        method: String,
        rejected: Vec<RejectedCandidate>,
        also_missing: usize,
    },

    #[error("concrete type {type_name} does not implement abstract method {method}")]
    AbstractMethodNotImplemented { type_name: String, method: String },

    #[error("method {method} of type {type_name} overrides final method {overridden}")]
    OverrideOfFinal {
        type_name: String,
        method: String,
        overridden: String,
    },

    #[error(
        "type {type_name}: the return type of {method} ({signature}) is not assignable to the one of {ancestor_method} ({ancestor_signature})"
    )]
    CovariantReturnMismatch {
        type_name: String,
        method: String,
        signature: String,
        ancestor_method: String,
        ancestor_signature: String,
    },

    #[error("instantiation {type_name} does not have the interface shape of its definition {definition}")]
    GenericShapeMismatch { type_name: String, definition: String },

    #[error("type {type_name} inherits from itself")]
    CircularInheritance { type_name: String },
}

/// A failure to dispatch a call. Only `TypeLoad` means the receiver's type is unusable.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum DispatchError {
    #[error("call to {method} on {type_name} is ambiguous between {}", .candidates.join(" and "))]
    Ambiguous {
        type_name: String,
        method: String,
        candidates: Vec<String>,
    },

    #[error("call to {method} on {type_name} reaches an abstract method")]
    AbstractMethod { type_name: String, method: String },

    #[error("{type_name} has no method {method}")]
    NotImplemented { type_name: String, method: String },

    #[error(transparent)]
    TypeLoad(#[from] TypeLoadError),
}

/// Errors of the name index. Only the case-insensitive index allocates while looking up, so only
/// it can fail.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum NameIndexError {
    #[error("out of memory while folding the case of a {requested}-byte name")]
    OutOfMemory { requested: usize },
}

/// A signature comparison hit a type the type system cannot resolve.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("type {name} cannot be resolved")]
pub struct UnresolvedType {
    pub name: String,
}
