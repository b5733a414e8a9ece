//! Mutator thread records and the handle a thread uses to cooperate with the coordinator.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use super::coordinator::WorldShared;
use super::semaphore::{PendingOps, Semaphore};
use super::state::{DetachResult, DoBlockingResult, DoneBlockingResult, PollResult, StateWord, ThreadState};
use crate::util::rust_util::approximate_stack_pointer;

thread_local! {
    // The record of the calling thread while it is attached. The asynchronous suspend handler
    // reads it, so it must stay a plain pointer.
    static CURRENT: Cell<*const MutatorThread> = const { Cell::new(std::ptr::null()) };
}

/// The record of the calling thread, if it is attached. The pointer is valid until the thread
/// detaches.
pub(crate) fn current_thread_ptr() -> *const MutatorThread {
    CURRENT.with(|c| c.get())
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadKind {
    Mutator,
    /// A collector worker. Never suspended by a world stop.
    GcWorker,
}

/// Everything the coordinator and the platform backend know about one attached thread.
pub struct MutatorThread {
    id: usize,
    os_thread: ThreadId,
    native: usize,
    kind: ThreadKind,
    preemptible: bool,
    pub(crate) state: StateWord,
    critical_nesting: AtomicUsize,
    stack_base: AtomicUsize,
    saved_sp: AtomicUsize,
    pub(crate) resume: Semaphore,
    pub(crate) pending: Arc<PendingOps>,
    // Set by the asynchronous suspend handler.
    pub(crate) in_handler: AtomicBool,
    pub(crate) stopped_in_critical: AtomicBool,
    pub(crate) async_resume: AtomicBool,
}

fn native_thread_handle() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            unsafe { libc::pthread_self() as usize }
        } else {
            0
        }
    }
}

/// The highest address of the calling thread's stack. Where the platform cannot tell us, the
/// caller's frame stands in, and `save_context` widens it if a later frame sits above it.
fn current_stack_base() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            unsafe {
                let mut attr: libc::pthread_attr_t = std::mem::zeroed();
                if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) == 0 {
                    let mut addr: *mut libc::c_void = std::ptr::null_mut();
                    let mut size: libc::size_t = 0;
                    let found = libc::pthread_attr_getstack(&attr, &mut addr, &mut size) == 0;
                    libc::pthread_attr_destroy(&mut attr);
                    if found {
                        return addr as usize + size;
                    }
                }
            }
            approximate_stack_pointer()
        } else {
            approximate_stack_pointer()
        }
    }
}

impl MutatorThread {
    pub(crate) fn for_current_thread(
        id: usize,
        kind: ThreadKind,
        preemptible: bool,
        pending: Arc<PendingOps>,
    ) -> Self {
        MutatorThread {
            id,
            os_thread: std::thread::current().id(),
            native: native_thread_handle(),
            kind,
            preemptible,
            state: StateWord::new(),
            critical_nesting: AtomicUsize::new(0),
            stack_base: AtomicUsize::new(0),
            saved_sp: AtomicUsize::new(0),
            resume: Semaphore::new(),
            pending,
            in_handler: AtomicBool::new(false),
            stopped_in_critical: AtomicBool::new(false),
            async_resume: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn os_thread(&self) -> ThreadId {
        self.os_thread
    }

    /// The `pthread_t` of the thread on unix, 0 elsewhere.
    pub fn native_handle(&self) -> usize {
        self.native
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    /// Whether the thread may be stopped asynchronously under the hybrid policy.
    pub fn is_preemptible(&self) -> bool {
        self.preemptible
    }

    pub fn state(&self) -> ThreadState {
        self.state.state()
    }

    pub fn suspend_count(&self) -> u8 {
        self.state.suspend_count()
    }

    pub fn in_critical_region(&self) -> bool {
        self.critical_nesting.load(Ordering::Relaxed) > 0
    }

    /// The stack range `(top, base)` captured when the thread last stopped, if it has stopped.
    pub fn saved_stack(&self) -> Option<(usize, usize)> {
        match self.saved_sp.load(Ordering::Acquire) {
            0 => None,
            sp => Some((sp, self.stack_base.load(Ordering::Relaxed))),
        }
    }

    pub fn has_saved_context(&self) -> bool {
        self.saved_sp.load(Ordering::Acquire) != 0
    }

    pub(crate) fn save_context(&self, sp: usize) {
        self.stack_base.fetch_max(sp, Ordering::Relaxed);
        self.saved_sp.store(sp, Ordering::Release);
    }

    pub(crate) fn clear_saved_context(&self) {
        self.saved_sp.store(0, Ordering::Release);
        self.stopped_in_critical.store(false, Ordering::Relaxed);
    }

    fn record_stack_base(&self) {
        self.stack_base
            .store(current_stack_base(), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorThread")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .finish()
    }
}

/// The calling thread's membership in a runtime. Dropping it detaches the thread.
///
/// A handle is tied to the thread that attached, and is therefore neither `Send` nor `Sync`.
pub struct MutatorHandle {
    thread: Arc<MutatorThread>,
    shared: Arc<WorldShared>,
    detached: bool,
    _not_send: PhantomData<*const ()>,
}

impl MutatorHandle {
    /// Register the calling thread. Mutators wait here while the world is stopped.
    pub(crate) fn attach(shared: Arc<WorldShared>, kind: ThreadKind, preemptible: bool) -> Self {
        assert!(
            current_thread_ptr().is_null(),
            "thread {:?} is already attached",
            std::thread::current().id()
        );
        let thread = Arc::new(MutatorThread::for_current_thread(
            shared.registry.next_id(),
            kind,
            preemptible,
            shared.pending.clone(),
        ));
        shared.register(&thread);
        thread.record_stack_base();
        CURRENT.with(|c| c.set(Arc::as_ptr(&thread)));
        thread.state.attach();
        debug!("Attached {:?} thread {}", kind, thread.id());
        MutatorHandle {
            thread,
            shared,
            detached: false,
            _not_send: PhantomData,
        }
    }

    pub fn thread(&self) -> &Arc<MutatorThread> {
        &self.thread
    }

    /// Check for a pending suspend request, and stop here until resumed if there is one.
    pub fn safepoint(&self) {
        if !self.thread.state.suspend_requested() {
            return;
        }
        // The context must be in place before the coordinator can see us suspended.
        self.thread.save_context(approximate_stack_pointer());
        match self.thread.state.state_poll() {
            PollResult::Continue => self.thread.clear_saved_context(),
            PollResult::SelfSuspend { notify } => {
                trace!("Thread {} suspends itself (notify: {})", self.thread.id(), notify);
                if notify {
                    self.thread.pending.post();
                }
                self.wait_for_resume();
            }
        }
    }

    fn wait_for_resume(&self) {
        self.thread.resume.wait();
        trace!("Thread {} resumed", self.thread.id());
        self.thread.pending.post();
    }

    /// Enter a region in which this thread does not touch managed state. A world stop treats
    /// the thread as already suspended while it is inside.
    pub fn enter_blocking(&self) {
        loop {
            self.thread.save_context(approximate_stack_pointer());
            match self.thread.state.do_blocking() {
                DoBlockingResult::Continue => return,
                DoBlockingResult::PollAndRetry => self.safepoint(),
            }
        }
    }

    /// Leave a blocking region. If the world was stopped meanwhile, wait for it to restart.
    pub fn leave_blocking(&self) {
        match self.thread.state.done_blocking() {
            DoneBlockingResult::Continue => self.thread.clear_saved_context(),
            DoneBlockingResult::Wait => self.wait_for_resume(),
        }
    }

    /// Run `f` inside a blocking region.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter_blocking();
        let result = f();
        self.leave_blocking();
        result
    }

    /// Mark a region in which an asynchronous suspension is not safe. Nests.
    pub fn begin_critical(&self) {
        self.thread.critical_nesting.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_critical(&self) {
        let old = self.thread.critical_nesting.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(old > 0, "unbalanced critical region");
    }

    pub fn detach(mut self) {
        self.detach_inner();
    }

    fn detach_inner(&mut self) {
        if self.detached {
            return;
        }
        if matches!(
            self.thread.state(),
            ThreadState::Blocking | ThreadState::BlockingAndSuspended
        ) {
            self.leave_blocking();
        }
        loop {
            match self.thread.state.detach() {
                DetachResult::Detached => break,
                DetachResult::MustPoll => self.safepoint(),
            }
        }
        CURRENT.with(|c| c.set(std::ptr::null()));
        self.shared.unregister(&self.thread);
        self.detached = true;
        debug!("Detached thread {}", self.thread.id());
    }
}

impl Drop for MutatorHandle {
    fn drop(&mut self) {
        self.detach_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stw::cooperative::CooperativeSuspend;
    use crate::stw::StopTheWorld;
    use crate::util::options::Options;

    #[inline(never)]
    fn deeper<R>(depth: usize, f: impl FnOnce() -> R) -> R {
        let pad = std::hint::black_box([0u8; 256]);
        let result = if depth == 0 { f() } else { deeper(depth - 1, f) };
        std::hint::black_box(pad);
        result
    }

    #[test]
    fn stack_base_is_above_the_caller() {
        let sp = approximate_stack_pointer();
        assert!(current_stack_base() >= sp);
    }

    #[test]
    fn saved_stack_range_is_not_inverted() {
        let stw = StopTheWorld::new(CooperativeSuspend, &Options::defaults_only());
        let handle = stw.attach_mutator(false);
        let record = handle.thread().clone();
        for depth in [0, 4, 16] {
            let saved = deeper(depth, || handle.blocking(|| record.saved_stack()));
            let (top, base) = saved.unwrap();
            assert!(top <= base, "top {:#x} is above base {:#x}", top, base);
        }
        assert!(record.saved_stack().is_none());
        handle.detach();
    }
}
