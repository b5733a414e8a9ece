//! The stop-the-world coordinator.
//!
//! `stop_world` takes the suspend lock and keeps it until the matching `restart_world` has
//! completed its handshake with every thread it stopped. A mutator that attaches while the lock is
//! held waits for it before it joins the registry, so it can never slip past a world stop.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use super::backoff::Backoff;
use super::semaphore::PendingOps;
use super::state::{RequestSuspendResult, ResumeResult};
use super::thread::{MutatorHandle, MutatorThread, ThreadKind};
use crate::util::options::{Options, SuspendPolicy};
use crate::vm::{PlatformSuspend, SuspendStatus};

/// The global suspend lock. Held from the start of `stop_world` to the end of `restart_world`,
/// which are separate calls, so it cannot be a guard-based mutex.
struct SuspendLock {
    locked: Mutex<bool>,
    released: Condvar,
    held: AtomicBool,
}

impl SuspendLock {
    fn new() -> Self {
        SuspendLock {
            locked: Mutex::new(false),
            released: Condvar::new(),
            held: AtomicBool::new(false),
        }
    }

    fn acquire(&self) {
        let mut locked = self.locked.lock().unwrap();
        while *locked {
            locked = self.released.wait(locked).unwrap();
        }
        *locked = true;
        self.held.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        let mut locked = self.locked.lock().unwrap();
        debug_assert!(*locked);
        *locked = false;
        self.held.store(false, Ordering::SeqCst);
        self.released.notify_all();
    }

    fn wait_until_released(&self) {
        let mut locked = self.locked.lock().unwrap();
        while *locked {
            locked = self.released.wait(locked).unwrap();
        }
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

pub(crate) struct ThreadRegistry {
    threads: spin::Mutex<Vec<Arc<MutatorThread>>>,
    next_id: AtomicUsize,
}

impl ThreadRegistry {
    fn new() -> Self {
        ThreadRegistry {
            threads: spin::Mutex::new(vec![]),
            next_id: AtomicUsize::new(0),
        }
    }

    pub(crate) fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn snapshot(&self) -> Vec<Arc<MutatorThread>> {
        self.threads.lock().clone()
    }
}

/// The part of the coordinator that attached threads keep a reference to.
pub(crate) struct WorldShared {
    lock: SuspendLock,
    pub(crate) registry: ThreadRegistry,
    pub(crate) pending: Arc<PendingOps>,
}

impl WorldShared {
    pub(crate) fn register(&self, thread: &Arc<MutatorThread>) {
        loop {
            {
                let mut threads = self.registry.threads.lock();
                // Collector workers must be able to join a stopped world.
                if thread.kind() == ThreadKind::GcWorker || !self.lock.is_held() {
                    threads.push(thread.clone());
                    return;
                }
            }
            trace!("Thread {} waits for the world to restart before attaching", thread.id());
            self.lock.wait_until_released();
        }
    }

    pub(crate) fn unregister(&self, thread: &Arc<MutatorThread>) {
        self.registry
            .threads
            .lock()
            .retain(|t| !Arc::ptr_eq(t, thread));
    }
}

/// Statistics of completed world stops.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PauseStats {
    pub collections: usize,
    pub longest_pause: Duration,
    pub total_pause: Duration,
}

/// What the current world stop has done so far.
#[derive(Default)]
struct StoppedWorld {
    generation: u32,
    initiator: Option<ThreadId>,
    started: Option<Instant>,
    /// Every thread whose suspend count this stop raised.
    suspended: Vec<Arc<MutatorThread>>,
}

enum BeginSuspend {
    /// Requested. An acknowledgement will follow.
    Pending,
    /// Already safe. Counted, no acknowledgement.
    Safe,
    Retry,
    Dead,
}

pub struct StopTheWorld<P: PlatformSuspend> {
    shared: Arc<WorldShared>,
    backend: P,
    policy: SuspendPolicy,
    backoff_us: usize,
    max_backoff_us: usize,
    world: spin::Mutex<StoppedWorld>,
    warned_no_async: AtomicBool,
    collections: AtomicUsize,
    longest_pause_ns: AtomicU64,
    total_pause_ns: AtomicU64,
}

impl<P: PlatformSuspend> StopTheWorld<P> {
    pub fn new(backend: P, options: &Options) -> Self {
        StopTheWorld {
            shared: Arc::new(WorldShared {
                lock: SuspendLock::new(),
                registry: ThreadRegistry::new(),
                pending: Arc::new(PendingOps::new()),
            }),
            backend,
            policy: options.suspend_policy,
            backoff_us: options.suspend_backoff_us,
            max_backoff_us: options.suspend_max_backoff_us,
            world: spin::Mutex::new(StoppedWorld::default()),
            warned_no_async: AtomicBool::new(false),
            collections: AtomicUsize::new(0),
            longest_pause_ns: AtomicU64::new(0),
            total_pause_ns: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &P {
        &self.backend
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_us, self.max_backoff_us)
    }

    /// Attach the calling thread as a mutator. Waits if the world is stopped.
    pub fn attach_mutator(&self, preemptible: bool) -> MutatorHandle {
        MutatorHandle::attach(self.shared.clone(), ThreadKind::Mutator, preemptible)
    }

    /// Attach the calling thread as a collector worker. Workers are never suspended.
    pub fn attach_gc_worker(&self) -> MutatorHandle {
        MutatorHandle::attach(self.shared.clone(), ThreadKind::GcWorker, false)
    }

    pub fn thread_count(&self) -> usize {
        self.shared.registry.threads.lock().len()
    }

    pub fn is_world_stopped(&self) -> bool {
        self.shared.lock.is_held()
    }

    pub fn stats(&self) -> PauseStats {
        PauseStats {
            collections: self.collections.load(Ordering::Relaxed),
            longest_pause: Duration::from_nanos(self.longest_pause_ns.load(Ordering::Relaxed)),
            total_pause: Duration::from_nanos(self.total_pause_ns.load(Ordering::Relaxed)),
        }
    }

    fn use_async(&self, thread: &MutatorThread) -> bool {
        let wanted = match self.policy {
            SuspendPolicy::Cooperative => false,
            SuspendPolicy::Preemptive => true,
            SuspendPolicy::Hybrid => thread.is_preemptible(),
        };
        if wanted && !self.backend.supports_async() {
            if !self.warned_no_async.swap(true, Ordering::Relaxed) {
                warn!(
                    "Suspend policy {} needs asynchronous suspension, which the platform backend lacks. Falling back to safepoints.",
                    self.policy
                );
            }
            return false;
        }
        wanted
    }

    fn begin_suspend(&self, thread: &Arc<MutatorThread>) -> BeginSuspend {
        let result = if self.use_async(thread) {
            thread.state.request_async_suspension()
        } else {
            thread.state.request_self_suspension()
        };
        match result {
            RequestSuspendResult::InitSelfSuspend => BeginSuspend::Pending,
            RequestSuspendResult::InitAsyncSuspend => {
                if !self.backend.request_suspend(thread) {
                    // The request is still in the state word. The thread acknowledges at its next
                    // safepoint instead.
                    warn!(
                        "Could not deliver an asynchronous suspend to thread {}",
                        thread.id()
                    );
                }
                BeginSuspend::Pending
            }
            RequestSuspendResult::AlreadySuspended => BeginSuspend::Safe,
            RequestSuspendResult::NotPossible => BeginSuspend::Retry,
            RequestSuspendResult::Dead => BeginSuspend::Dead,
        }
    }

    /// Drop one suspension of `thread`. Return whether it will acknowledge.
    ///
    /// The saved context is discarded only when the thread actually runs again. A thread that
    /// stays blocking keeps the context it saved on entry.
    fn resume_thread(&self, thread: &MutatorThread) -> bool {
        match thread.state.request_resume() {
            ResumeResult::InitSelfResume => {
                thread.clear_saved_context();
                thread.resume.post();
                true
            }
            ResumeResult::InitAsyncResume => {
                thread.clear_saved_context();
                if !self.backend.request_resume(thread) {
                    warn!(
                        "Could not deliver an asynchronous resume to thread {}",
                        thread.id()
                    );
                }
                true
            }
            ResumeResult::StillSuspended
            | ResumeResult::ResumeBlocking
            | ResumeResult::Cancelled => false,
        }
    }

    fn wait_until_resumed(&self, threads: &[Arc<MutatorThread>]) {
        for thread in threads {
            let mut backoff = self.backoff();
            while !self.backend.confirm_resumed(thread) {
                backoff.snooze();
            }
        }
    }

    /// Stop every mutator other than the calling thread. Returns once all of them are suspended
    /// or blocking. The world stays stopped until `restart_world`.
    ///
    /// There is no timeout: a thread that never reaches a safe point stalls this call.
    pub fn stop_world(&self, generation: u32) {
        self.shared.lock.acquire();
        let started = Instant::now();
        let initiator = std::thread::current().id();
        info!("Stopping the world for generation {}", generation);

        let mut suspended = vec![];
        let mut candidates: Vec<Arc<MutatorThread>> = self
            .shared
            .registry
            .snapshot()
            .into_iter()
            .filter(|t| t.os_thread() != initiator && t.kind() == ThreadKind::Mutator)
            .collect();
        let mut backoff = self.backoff();
        let mut phase = 1;

        loop {
            let mut waiting = vec![];
            let mut retry = vec![];
            for thread in candidates {
                match self.begin_suspend(&thread) {
                    BeginSuspend::Pending => waiting.push(thread),
                    BeginSuspend::Safe => suspended.push(thread),
                    BeginSuspend::Retry => retry.push(thread),
                    BeginSuspend::Dead => {}
                }
            }
            trace!(
                "Phase {}: waiting for {} acknowledgements",
                phase,
                waiting.len()
            );
            self.shared.pending.wait(waiting.len(), self.backoff());

            let mut resumed = vec![];
            for thread in waiting {
                match self.backend.confirm_suspended(&thread) {
                    SuspendStatus::Suspended => suspended.push(thread),
                    status => {
                        debug!("Thread {} is not safe yet ({:?})", thread.id(), status);
                        if self.resume_thread(&thread) {
                            resumed.push(thread.clone());
                        }
                        retry.push(thread);
                    }
                }
            }
            if !resumed.is_empty() {
                self.shared.pending.wait(resumed.len(), self.backoff());
                self.wait_until_resumed(&resumed);
            }

            if retry.is_empty() {
                break;
            }
            warn!(
                "Phase {}: {} threads could not be suspended, retrying",
                phase,
                retry.len()
            );
            backoff.snooze();
            candidates = retry;
            phase += 1;
        }

        info!(
            "World stopped for generation {}: {} threads suspended in {:?}",
            generation,
            suspended.len(),
            started.elapsed()
        );
        *self.world.lock() = StoppedWorld {
            generation,
            initiator: Some(initiator),
            started: Some(started),
            suspended,
        };
    }

    /// Resume every thread `stop_world` stopped, wait for all of them to acknowledge, then release
    /// the suspend lock. Returns the length of the pause.
    pub fn restart_world(&self, generation: u32) -> Duration {
        assert!(
            self.shared.lock.is_held(),
            "restart_world without a matching stop_world"
        );
        let world = std::mem::take(&mut *self.world.lock());
        if world.generation != generation {
            warn!(
                "Restarting generation {}, but generation {} was stopped",
                generation, world.generation
            );
        }
        trace!("Restart initiated by {:?}", world.initiator);

        let mut waking = vec![];
        for thread in world.suspended.iter() {
            if self.resume_thread(thread) {
                waking.push(thread.clone());
            }
        }
        self.shared.pending.wait(waking.len(), self.backoff());
        self.wait_until_resumed(&waking);

        let pause = world.started.map(|s| s.elapsed()).unwrap_or_default();
        let pause_ns = pause.as_nanos() as u64;
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.longest_pause_ns.fetch_max(pause_ns, Ordering::Relaxed);
        self.total_pause_ns.fetch_add(pause_ns, Ordering::Relaxed);
        info!(
            "World restarted for generation {} after {:?}",
            generation, pause
        );

        // Only now can attaching threads proceed.
        self.shared.lock.release();
        pause
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stw::cooperative::CooperativeSuspend;
    use crate::stw::ThreadState;
    use crate::util::test_util::panic_after;
    use std::sync::mpsc;

    fn coordinator() -> Arc<StopTheWorld<CooperativeSuspend>> {
        Arc::new(StopTheWorld::new(
            CooperativeSuspend,
            &Options::defaults_only(),
        ))
    }

    #[test]
    fn empty_world() {
        let stw = coordinator();
        stw.stop_world(1);
        assert!(stw.is_world_stopped());
        stw.restart_world(1);
        assert!(!stw.is_world_stopped());
        assert_eq!(stw.stats().collections, 1);
    }

    #[test]
    fn initiator_is_not_suspended() {
        panic_after(5000, || {
            let stw = coordinator();
            let me = stw.attach_mutator(false);
            stw.stop_world(1);
            assert_eq!(me.thread().state(), ThreadState::Running);
            stw.restart_world(1);
            me.detach();
            assert_eq!(stw.thread_count(), 0);
        });
    }

    #[test]
    fn polling_mutator_is_stopped_and_resumed() {
        panic_after(10_000, || {
            let stw = coordinator();
            let stop = Arc::new(AtomicBool::new(false));
            let polls = Arc::new(AtomicUsize::new(0));
            let (tx, rx) = mpsc::channel();
            let worker = {
                let (stw, stop, polls) = (stw.clone(), stop.clone(), polls.clone());
                std::thread::spawn(move || {
                    let handle = stw.attach_mutator(false);
                    let record = handle.thread().clone();
                    tx.send(record).unwrap();
                    while !stop.load(Ordering::Relaxed) {
                        polls.fetch_add(1, Ordering::Relaxed);
                        handle.safepoint();
                    }
                })
            };
            let record = rx.recv().unwrap();

            stw.stop_world(7);
            assert_eq!(record.state(), ThreadState::SelfSuspended);
            assert!(record.saved_stack().is_some());
            let frozen = polls.load(Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(20));
            assert_eq!(polls.load(Ordering::Relaxed), frozen);
            stw.restart_world(7);

            assert!(record.saved_stack().is_none());
            stop.store(true, Ordering::Relaxed);
            worker.join().unwrap();
        });
    }

    #[test]
    fn blocking_mutator_counts_as_stopped() {
        panic_after(10_000, || {
            let stw = coordinator();
            let (entered_tx, entered_rx) = mpsc::channel();
            let (go_tx, go_rx) = mpsc::channel::<()>();
            let worker = {
                let stw = stw.clone();
                std::thread::spawn(move || {
                    let handle = stw.attach_mutator(false);
                    handle.blocking(|| {
                        entered_tx.send(handle.thread().clone()).unwrap();
                        go_rx.recv().unwrap();
                    });
                    // Leaving the blocking region waits for the restart.
                    handle.safepoint();
                })
            };
            let record = entered_rx.recv().unwrap();
            stw.stop_world(1);
            assert_eq!(record.state(), ThreadState::BlockingAndSuspended);
            go_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            assert!(record.state().is_suspended());
            stw.restart_world(1);
            worker.join().unwrap();
        });
    }

    #[test]
    fn blocking_mutator_keeps_its_context_across_collections() {
        panic_after(10_000, || {
            let stw = coordinator();
            let (entered_tx, entered_rx) = mpsc::channel();
            let (go_tx, go_rx) = mpsc::channel::<()>();
            let worker = {
                let stw = stw.clone();
                std::thread::spawn(move || {
                    let handle = stw.attach_mutator(false);
                    handle.blocking(|| {
                        entered_tx.send(handle.thread().clone()).unwrap();
                        go_rx.recv().unwrap();
                    });
                })
            };
            let record = entered_rx.recv().unwrap();
            let saved = record.saved_stack();
            assert!(saved.is_some());

            stw.stop_world(1);
            assert_eq!(record.saved_stack(), saved);
            stw.restart_world(1);
            // Still inside the blocking region, so the context stays valid.
            assert_eq!(record.state(), ThreadState::Blocking);
            assert_eq!(record.saved_stack(), saved);

            stw.stop_world(2);
            assert_eq!(record.state(), ThreadState::BlockingAndSuspended);
            assert_eq!(record.saved_stack(), saved);
            stw.restart_world(2);

            go_tx.send(()).unwrap();
            worker.join().unwrap();
            assert!(record.saved_stack().is_none());
        });
    }

    #[test]
    fn attach_waits_for_restart() {
        panic_after(10_000, || {
            let stw = coordinator();
            stw.stop_world(1);
            let attached = Arc::new(AtomicBool::new(false));
            let worker = {
                let (stw, attached) = (stw.clone(), attached.clone());
                std::thread::spawn(move || {
                    let _handle = stw.attach_mutator(false);
                    attached.store(true, Ordering::SeqCst);
                })
            };
            std::thread::sleep(Duration::from_millis(20));
            assert!(!attached.load(Ordering::SeqCst));
            stw.restart_world(1);
            worker.join().unwrap();
            assert!(attached.load(Ordering::SeqCst));
        });
    }

    #[test]
    fn gc_workers_attach_during_a_stop_and_are_not_suspended() {
        panic_after(5000, || {
            let stw = coordinator();
            stw.stop_world(1);
            let worker = {
                let stw = stw.clone();
                std::thread::spawn(move || {
                    let handle = stw.attach_gc_worker();
                    assert_eq!(handle.thread().state(), ThreadState::Running);
                })
            };
            worker.join().unwrap();
            stw.restart_world(1);
        });
    }

    #[test]
    fn pause_statistics_accumulate() {
        let stw = coordinator();
        for generation in 0..3 {
            stw.stop_world(generation);
            std::thread::sleep(Duration::from_millis(2));
            let pause = stw.restart_world(generation);
            assert!(pause >= Duration::from_millis(2));
        }
        let stats = stw.stats();
        assert_eq!(stats.collections, 3);
        assert!(stats.longest_pause >= Duration::from_millis(2));
        assert!(stats.total_pause >= stats.longest_pause);
    }
}
