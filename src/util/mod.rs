//! Utilities shared by the loader and the stop-the-world coordinator.

/// An interface-membership bitmap indexed by interface id.
pub mod bitmap;
/// A lock-free-read, single-writer hash table.
pub mod concurrent_map;
/// Logger initialization
pub mod logger;
/// Runtime options
#[macro_use]
pub mod options;
/// Wrappers around language features that the standard library does not provide yet.
pub mod rust_util;

#[cfg(any(test, feature = "mock_test"))]
pub mod test_util;

pub use self::concurrent_map::ConcurrentMap;
pub use self::options::Options;
