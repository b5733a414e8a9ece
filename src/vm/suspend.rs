use crate::stw::MutatorThread;

/// Where a thread turned out to be once it acknowledged a suspend request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SuspendStatus {
    /// Stopped with a saved context. Safe for the collector.
    Suspended,
    /// Stopped somewhere it must not stay, such as a critical region. The coordinator resumes it
    /// and asks again later.
    InCriticalLocation,
    /// Its context could not be captured yet. The coordinator asks again later. This does not mean
    /// the thread is gone.
    NotPossible,
}

/// The platform primitive that stops and restarts a thread which is not polling.
///
/// The coordinator owns the state machine and the acknowledgement protocol. A backend only moves
/// the thread. Threads that stop themselves at a safepoint never reach `request_suspend` or
/// `request_resume`, so a backend without asynchronous support only has to classify contexts.
pub trait PlatformSuspend: Send + Sync + 'static {
    /// Whether `request_suspend` can stop a thread that never polls. If not, every thread is
    /// stopped cooperatively whatever the configured policy.
    fn supports_async(&self) -> bool;

    /// Interrupt `thread`, whose state is already `AsyncSuspendRequested`. The interrupted thread
    /// must call `StateWord::finish_async_suspend` and acknowledge through its `PendingOps`. Return
    /// false if the request could not be delivered.
    fn request_suspend(&self, thread: &MutatorThread) -> bool;

    /// Classify a thread after it acknowledged a suspend request.
    fn confirm_suspended(&self, thread: &MutatorThread) -> SuspendStatus;

    /// Wake an asynchronously suspended thread. It acknowledges once it runs again. Return false
    /// if the request could not be delivered.
    fn request_resume(&self, thread: &MutatorThread) -> bool;

    /// Whether an acknowledged thread has fully left its suspended context, so that a new
    /// request can be delivered to it.
    fn confirm_resumed(&self, thread: &MutatorThread) -> bool;
}
