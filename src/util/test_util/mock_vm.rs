//! A binding for unit tests: the default type system and the cooperative suspend backend.

use crate::stw::CooperativeSuspend;
use crate::vm::{DefaultTypeSystem, VMBinding};
use crate::{Runtime, RuntimeBuilder};

#[derive(Default)]
pub struct MockVM;

impl VMBinding for MockVM {
    type VMTypeSystem = DefaultTypeSystem;
    type VMSuspend = CooperativeSuspend;
}

/// A runtime with default options. Environment variables are ignored so tests do not depend on
/// the shell they run in.
pub fn runtime() -> Runtime<MockVM> {
    runtime_with(|_| {})
}

/// A runtime with options adjusted by `setup`.
pub fn runtime_with<F>(setup: F) -> Runtime<MockVM>
where
    F: FnOnce(&mut RuntimeBuilder),
{
    let mut builder = RuntimeBuilder::defaults_only();
    setup(&mut builder);
    builder.build::<MockVM>(DefaultTypeSystem, CooperativeSuspend)
}
