//! Type layout, interface dispatch and stop-the-world suspension for a managed-object runtime.
//!
//! The crate is organised around a single explicitly constructed [`Runtime`] instance. A runtime
//! is parameterised by a [`vm::VMBinding`], which supplies the two collaborators this crate does
//! not own:
//!
//! * a [`vm::TypeSystem`] that compares method signatures and answers accessibility and
//!   generic-instantiation queries, and
//! * a [`vm::PlatformSuspend`] backend that knows how to stop and restart a mutator thread.
//!
//! The major components are:
//!
//! * [`util::concurrent_map::ConcurrentMap`]: lock-free reads, single writer, epoch-reclaimed
//!   resizing.
//! * [`loader::name_index`]: per-module (namespace, name) lookup with nested-type chains and a
//!   case-insensitive shadow table.
//! * [`loader::interface_offsets`]: packs the interfaces a class implements and assigns each a
//!   vtable slot range.
//! * [`loader::vtable`]: builds and publishes the immutable vtable of a class.
//! * [`stw`]: the per-thread suspend state machine and the stop-the-world coordinator.

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod util;
pub mod error;
pub mod loader;
mod runtime;
pub mod stw;
pub mod vm;

pub use crate::error::{DispatchError, NameIndexError, TypeLoadError};
pub use crate::loader::{MethodHandle, TypeHandle};
pub use crate::runtime::{Runtime, RuntimeBuilder};
