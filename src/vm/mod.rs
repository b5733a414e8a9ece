//! The seams between this crate and the runtime embedding it.
//!
//! A binding picks a [`TypeSystem`] and a [`PlatformSuspend`] backend by implementing
//! [`VMBinding`]. The crate ships [`DefaultTypeSystem`] and the portable
//! [`crate::stw::CooperativeSuspend`] backend, which together are enough to run everything.

mod suspend;
mod type_system;

pub use self::suspend::{PlatformSuspend, SuspendStatus};
pub use self::type_system::{DefaultTypeSystem, TypeSystem};

/// Ties together the collaborators of a [`crate::Runtime`].
pub trait VMBinding
where
    Self: Sized + 'static + Send + Sync,
{
    /// Signature comparison, accessibility and generic substitution.
    type VMTypeSystem: TypeSystem;
    /// Stops and restarts threads that are not polling.
    type VMSuspend: PlatformSuspend;
}
