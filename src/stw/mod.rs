//! Stopping and restarting mutator threads.
//!
//! Every attached thread owns a [`state::StateWord`]. The [`StopTheWorld`] coordinator moves
//! threads into a suspended state either cooperatively (the thread notices at its next
//! [`MutatorHandle::safepoint`]) or asynchronously through a [`crate::vm::PlatformSuspend`]
//! backend. Threads inside [`MutatorHandle::blocking`] regions count as already stopped.

mod backoff;
pub mod cooperative;
mod coordinator;
mod semaphore;
#[cfg(all(unix, feature = "signal_suspend"))]
pub mod signal;
pub mod state;
mod thread;

pub use self::backoff::Backoff;
pub use self::cooperative::CooperativeSuspend;
pub use self::coordinator::{PauseStats, StopTheWorld};
pub use self::semaphore::{PendingOps, Semaphore};
#[cfg(all(unix, feature = "signal_suspend"))]
pub use self::signal::SignalSuspend;
pub use self::state::ThreadState;
pub use self::thread::{MutatorHandle, MutatorThread, ThreadKind};
