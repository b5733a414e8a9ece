use super::MutatorThread;
use crate::vm::{PlatformSuspend, SuspendStatus};

/// The portable backend. It cannot interrupt a thread, so every mutator stops itself at a
/// safepoint or is already safe in a blocking region.
#[derive(Copy, Clone, Debug, Default)]
pub struct CooperativeSuspend;

impl PlatformSuspend for CooperativeSuspend {
    fn supports_async(&self) -> bool {
        false
    }

    fn request_suspend(&self, _thread: &MutatorThread) -> bool {
        false
    }

    fn confirm_suspended(&self, thread: &MutatorThread) -> SuspendStatus {
        if thread.has_saved_context() {
            SuspendStatus::Suspended
        } else {
            SuspendStatus::NotPossible
        }
    }

    fn request_resume(&self, _thread: &MutatorThread) -> bool {
        false
    }

    fn confirm_resumed(&self, thread: &MutatorThread) -> bool {
        !thread.state().is_suspended()
    }
}
