//! The per-thread suspend state machine.
//!
//! The state and the suspend count share one 32-bit word so every transition is a single
//! compare-and-swap. The low byte is the [`ThreadState`], the next byte the suspend count.
//! Transitions are driven from three directions: the thread itself (polling, blocking, detaching),
//! the coordinator (requesting suspension and resumption), and the asynchronous suspend handler
//! running on the thread.

use std::sync::atomic::{AtomicU32, Ordering};

const STATE_MASK: u32 = 0xff;
const COUNT_SHIFT: u32 = 8;
const COUNT_MASK: u32 = 0xff;
const MAX_SUSPEND_COUNT: u8 = u8::MAX;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// Registered, but its stack is not known yet. Cannot be suspended.
    Starting = 0,
    Running = 1,
    Detached = 2,
    /// Stopped by the asynchronous suspend handler at an arbitrary instruction.
    AsyncSuspended = 3,
    /// Stopped at a safepoint on its own accord.
    SelfSuspended = 4,
    AsyncSuspendRequested = 5,
    SelfSuspendRequested = 6,
    /// In a region (such as blocking I/O) where it does not touch managed state.
    Blocking = 7,
    /// Asked to suspend while blocking. It stays blocked, and stops if it leaves the region.
    BlockingAndSuspended = 8,
}

const_assert!((ThreadState::BlockingAndSuspended as u32) <= STATE_MASK);

impl ThreadState {
    fn from_u8(raw: u8) -> ThreadState {
        match raw {
            0 => ThreadState::Starting,
            1 => ThreadState::Running,
            2 => ThreadState::Detached,
            3 => ThreadState::AsyncSuspended,
            4 => ThreadState::SelfSuspended,
            5 => ThreadState::AsyncSuspendRequested,
            6 => ThreadState::SelfSuspendRequested,
            7 => ThreadState::Blocking,
            8 => ThreadState::BlockingAndSuspended,
            _ => panic!("corrupted thread state {}", raw),
        }
    }

    /// A thread in this state will not touch managed state until it is resumed.
    pub fn is_suspended(self) -> bool {
        matches!(
            self,
            ThreadState::AsyncSuspended
                | ThreadState::SelfSuspended
                | ThreadState::BlockingAndSuspended
        )
    }
}

fn pack(state: ThreadState, count: u8) -> u32 {
    (state as u32) | ((count as u32) << COUNT_SHIFT)
}

fn unpack(raw: u32) -> (ThreadState, u8) {
    (
        ThreadState::from_u8((raw & STATE_MASK) as u8),
        ((raw >> COUNT_SHIFT) & COUNT_MASK) as u8,
    )
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestSuspendResult {
    /// The request was posted. The coordinator must wait for the thread to acknowledge it.
    InitSelfSuspend,
    /// The request was posted, and the platform backend must deliver it.
    InitAsyncSuspend,
    /// The thread was already safe. Its count went up; no acknowledgement will come.
    AlreadySuspended,
    /// The thread cannot be suspended yet. Ask again later.
    NotPossible,
    /// The thread detached.
    Dead,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PollResult {
    Continue,
    /// The thread must stop. If `notify` is false the asynchronous handler acknowledges on its
    /// behalf.
    SelfSuspend { notify: bool },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AsyncSuspendOutcome {
    /// The handler suspended the thread and must acknowledge.
    Suspended,
    /// The thread suspended itself first. The handler acknowledges for it and does not suspend.
    LostRace,
    /// The request was withdrawn before the handler ran.
    Cancelled,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResumeResult {
    /// Wake a self-suspended thread. It acknowledges once it runs.
    InitSelfResume,
    /// Ask the platform backend to wake an asynchronously suspended thread.
    InitAsyncResume,
    /// The count dropped, but another suspension is still outstanding.
    StillSuspended,
    /// The thread is still blocking and was never actually stopped. Nothing to wake.
    ResumeBlocking,
    /// A request that was never acted upon was withdrawn.
    Cancelled,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DoBlockingResult {
    Continue,
    /// A suspend request is pending. Poll, then try again.
    PollAndRetry,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DoneBlockingResult {
    Continue,
    /// The world was stopped while blocking. Wait to be resumed before touching managed state.
    Wait,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DetachResult {
    Detached,
    /// A suspend request is pending. Poll, then try again.
    MustPoll,
}

/// The atomic state word of one thread.
pub struct StateWord {
    raw: AtomicU32,
}

impl StateWord {
    pub fn new() -> Self {
        StateWord {
            raw: AtomicU32::new(pack(ThreadState::Starting, 0)),
        }
    }

    pub fn load(&self) -> (ThreadState, u8) {
        unpack(self.raw.load(Ordering::Acquire))
    }

    pub fn state(&self) -> ThreadState {
        self.load().0
    }

    pub fn suspend_count(&self) -> u8 {
        self.load().1
    }

    /// Compute a transition from the current word and try to install it. Retries on interference.
    /// `f` returns the new state and count together with the result, or `None` with the result to
    /// leave the word untouched.
    fn transition<R>(&self, mut f: impl FnMut(ThreadState, u8) -> (Option<(ThreadState, u8)>, R)) -> R {
        loop {
            let raw = self.raw.load(Ordering::Acquire);
            let (state, count) = unpack(raw);
            let (next, result) = f(state, count);
            let Some((next_state, next_count)) = next else {
                return result;
            };
            if self
                .raw
                .compare_exchange(
                    raw,
                    pack(next_state, next_count),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                trace!(
                    "thread state {:?}({}) -> {:?}({})",
                    state,
                    count,
                    next_state,
                    next_count
                );
                return result;
            }
        }
    }

    /// Starting -> Running, once the thread's stack is known.
    pub fn attach(&self) {
        self.transition(|state, count| match state {
            ThreadState::Starting => (Some((ThreadState::Running, count)), ()),
            _ => panic!("cannot attach a thread in state {:?}", state),
        })
    }

    pub fn detach(&self) -> DetachResult {
        self.transition(|state, count| match state {
            ThreadState::Running | ThreadState::Starting => {
                assert_eq!(count, 0, "detaching with suspend count {}", count);
                (Some((ThreadState::Detached, 0)), DetachResult::Detached)
            }
            ThreadState::SelfSuspendRequested | ThreadState::AsyncSuspendRequested => {
                (None, DetachResult::MustPoll)
            }
            _ => panic!("cannot detach a thread in state {:?}", state),
        })
    }

    fn request_suspension(&self, requested: ThreadState) -> RequestSuspendResult {
        let init = if requested == ThreadState::AsyncSuspendRequested {
            RequestSuspendResult::InitAsyncSuspend
        } else {
            RequestSuspendResult::InitSelfSuspend
        };
        self.transition(|state, count| match state {
            ThreadState::Starting => (None, RequestSuspendResult::NotPossible),
            ThreadState::Detached => (None, RequestSuspendResult::Dead),
            ThreadState::Running => {
                debug_assert_eq!(count, 0);
                (Some((requested, 1)), init)
            }
            ThreadState::AsyncSuspended
            | ThreadState::SelfSuspended
            | ThreadState::BlockingAndSuspended => {
                assert!(count < MAX_SUSPEND_COUNT, "suspend count overflow");
                (Some((state, count + 1)), RequestSuspendResult::AlreadySuspended)
            }
            ThreadState::Blocking => (
                Some((ThreadState::BlockingAndSuspended, 1)),
                RequestSuspendResult::AlreadySuspended,
            ),
            ThreadState::AsyncSuspendRequested | ThreadState::SelfSuspendRequested => {
                panic!("suspension requested twice (state {:?})", state)
            }
        })
    }

    /// Ask the thread to stop at its next safepoint.
    pub fn request_self_suspension(&self) -> RequestSuspendResult {
        self.request_suspension(ThreadState::SelfSuspendRequested)
    }

    /// Ask the thread to stop wherever it is. The backend must then interrupt it.
    pub fn request_async_suspension(&self) -> RequestSuspendResult {
        self.request_suspension(ThreadState::AsyncSuspendRequested)
    }

    /// Called by the thread at a safepoint.
    pub fn state_poll(&self) -> PollResult {
        self.transition(|state, count| match state {
            ThreadState::Running => (None, PollResult::Continue),
            ThreadState::SelfSuspendRequested => (
                Some((ThreadState::SelfSuspended, count)),
                PollResult::SelfSuspend { notify: true },
            ),
            ThreadState::AsyncSuspendRequested => (
                Some((ThreadState::SelfSuspended, count)),
                PollResult::SelfSuspend { notify: false },
            ),
            _ => panic!("safepoint poll in state {:?}", state),
        })
    }

    /// Called by the asynchronous suspend handler on the interrupted thread.
    ///
    /// Runs in a signal handler, so unlike the other transitions it neither logs nor panics.
    pub fn finish_async_suspend(&self) -> AsyncSuspendOutcome {
        const REQUESTED: u32 = ThreadState::AsyncSuspendRequested as u32;
        const LOST: u32 = ThreadState::SelfSuspended as u32;
        let mut raw = self.raw.load(Ordering::Acquire);
        loop {
            // Compare the raw bits so that even a corrupted word cannot panic here.
            let next = match raw & STATE_MASK {
                REQUESTED => (raw & !STATE_MASK) | ThreadState::AsyncSuspended as u32,
                LOST => return AsyncSuspendOutcome::LostRace,
                _ => return AsyncSuspendOutcome::Cancelled,
            };
            match self
                .raw
                .compare_exchange(raw, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return AsyncSuspendOutcome::Suspended,
                Err(current) => raw = current,
            }
        }
    }

    /// Drop one suspension. Only the last one wakes the thread.
    pub fn request_resume(&self) -> ResumeResult {
        self.transition(|state, count| {
            assert!(count > 0, "resuming a thread in state {:?} that is not suspended", state);
            if count > 1 {
                return (Some((state, count - 1)), ResumeResult::StillSuspended);
            }
            match state {
                ThreadState::AsyncSuspended => {
                    (Some((ThreadState::Running, 0)), ResumeResult::InitAsyncResume)
                }
                ThreadState::SelfSuspended => {
                    (Some((ThreadState::Running, 0)), ResumeResult::InitSelfResume)
                }
                ThreadState::BlockingAndSuspended => {
                    (Some((ThreadState::Blocking, 0)), ResumeResult::ResumeBlocking)
                }
                ThreadState::AsyncSuspendRequested | ThreadState::SelfSuspendRequested => {
                    (Some((ThreadState::Running, 0)), ResumeResult::Cancelled)
                }
                _ => panic!("resuming a thread in state {:?}", state),
            }
        })
    }

    /// Enter a blocking region.
    pub fn do_blocking(&self) -> DoBlockingResult {
        self.transition(|state, count| match state {
            ThreadState::Running => (Some((ThreadState::Blocking, count)), DoBlockingResult::Continue),
            ThreadState::SelfSuspendRequested | ThreadState::AsyncSuspendRequested => {
                (None, DoBlockingResult::PollAndRetry)
            }
            _ => panic!("entering a blocking region in state {:?}", state),
        })
    }

    /// Leave a blocking region.
    pub fn done_blocking(&self) -> DoneBlockingResult {
        self.transition(|state, count| match state {
            ThreadState::Blocking => (Some((ThreadState::Running, count)), DoneBlockingResult::Continue),
            ThreadState::BlockingAndSuspended => (
                Some((ThreadState::SelfSuspended, count)),
                DoneBlockingResult::Wait,
            ),
            _ => panic!("leaving a blocking region in state {:?}", state),
        })
    }

    /// Whether the fast path of a safepoint can be skipped.
    pub fn suspend_requested(&self) -> bool {
        matches!(
            self.state(),
            ThreadState::SelfSuspendRequested | ThreadState::AsyncSuspendRequested
        )
    }
}

impl Default for StateWord {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (state, count) = self.load();
        write!(f, "{:?}({})", state, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> StateWord {
        let word = StateWord::new();
        word.attach();
        word
    }

    #[test]
    fn starting_threads_cannot_be_suspended() {
        let word = StateWord::new();
        assert_eq!(
            word.request_self_suspension(),
            RequestSuspendResult::NotPossible
        );
        assert_eq!(word.load(), (ThreadState::Starting, 0));
    }

    #[test]
    fn self_suspend_round_trip() {
        let word = running();
        assert_eq!(
            word.request_self_suspension(),
            RequestSuspendResult::InitSelfSuspend
        );
        assert!(word.suspend_requested());
        assert_eq!(word.state_poll(), PollResult::SelfSuspend { notify: true });
        assert_eq!(word.load(), (ThreadState::SelfSuspended, 1));
        assert_eq!(word.request_resume(), ResumeResult::InitSelfResume);
        assert_eq!(word.load(), (ThreadState::Running, 0));
        assert_eq!(word.state_poll(), PollResult::Continue);
    }

    #[test]
    fn async_suspend_round_trip() {
        let word = running();
        assert_eq!(
            word.request_async_suspension(),
            RequestSuspendResult::InitAsyncSuspend
        );
        assert_eq!(word.finish_async_suspend(), AsyncSuspendOutcome::Suspended);
        assert_eq!(word.load(), (ThreadState::AsyncSuspended, 1));
        assert_eq!(word.request_resume(), ResumeResult::InitAsyncResume);
        assert_eq!(word.state(), ThreadState::Running);
    }

    #[test]
    fn async_handler_tolerates_unexpected_states() {
        let word = StateWord::new();
        assert_eq!(word.finish_async_suspend(), AsyncSuspendOutcome::Cancelled);
        assert_eq!(word.load(), (ThreadState::Starting, 0));

        let word = running();
        word.do_blocking();
        word.request_self_suspension();
        assert_eq!(word.finish_async_suspend(), AsyncSuspendOutcome::Cancelled);
        assert_eq!(word.load(), (ThreadState::BlockingAndSuspended, 1));

        // Garbage state bits do not panic either.
        let word = StateWord {
            raw: AtomicU32::new(STATE_MASK),
        };
        assert_eq!(word.finish_async_suspend(), AsyncSuspendOutcome::Cancelled);
        assert_eq!(word.raw.load(Ordering::Relaxed), STATE_MASK);
    }

    #[test]
    fn async_suspend_keeps_nested_count() {
        let word = running();
        word.request_async_suspension();
        assert_eq!(word.finish_async_suspend(), AsyncSuspendOutcome::Suspended);
        assert_eq!(
            word.request_async_suspension(),
            RequestSuspendResult::AlreadySuspended
        );
        assert_eq!(word.load(), (ThreadState::AsyncSuspended, 2));
        assert_eq!(word.request_resume(), ResumeResult::StillSuspended);
        assert_eq!(word.request_resume(), ResumeResult::InitAsyncResume);
    }

    #[test]
    fn handler_losing_to_self_suspend_acknowledges_once() {
        let word = running();
        word.request_async_suspension();
        // The thread polls before the handler runs. It must not acknowledge itself.
        assert_eq!(word.state_poll(), PollResult::SelfSuspend { notify: false });
        assert_eq!(word.finish_async_suspend(), AsyncSuspendOutcome::LostRace);
        assert_eq!(word.load(), (ThreadState::SelfSuspended, 1));
        assert_eq!(word.request_resume(), ResumeResult::InitSelfResume);
    }

    #[test]
    fn withdrawn_request_cancels_handler() {
        let word = running();
        word.request_async_suspension();
        assert_eq!(word.request_resume(), ResumeResult::Cancelled);
        assert_eq!(word.finish_async_suspend(), AsyncSuspendOutcome::Cancelled);
        assert_eq!(word.load(), (ThreadState::Running, 0));
    }

    #[test]
    fn blocking_threads_are_already_safe() {
        let word = running();
        assert_eq!(word.do_blocking(), DoBlockingResult::Continue);
        assert_eq!(
            word.request_self_suspension(),
            RequestSuspendResult::AlreadySuspended
        );
        assert_eq!(word.load(), (ThreadState::BlockingAndSuspended, 1));
        assert_eq!(word.request_resume(), ResumeResult::ResumeBlocking);
        assert_eq!(word.done_blocking(), DoneBlockingResult::Continue);
        assert_eq!(word.state(), ThreadState::Running);
    }

    #[test]
    fn leaving_blocking_while_suspended_waits() {
        let word = running();
        word.do_blocking();
        word.request_async_suspension();
        assert_eq!(word.done_blocking(), DoneBlockingResult::Wait);
        assert_eq!(word.load(), (ThreadState::SelfSuspended, 1));
        assert_eq!(word.request_resume(), ResumeResult::InitSelfResume);
    }

    #[test]
    fn nested_suspensions_count() {
        let word = running();
        word.request_self_suspension();
        word.state_poll();
        assert_eq!(
            word.request_async_suspension(),
            RequestSuspendResult::AlreadySuspended
        );
        assert_eq!(word.suspend_count(), 2);
        assert_eq!(word.request_resume(), ResumeResult::StillSuspended);
        assert_eq!(word.request_resume(), ResumeResult::InitSelfResume);
    }

    #[test]
    fn detach() {
        let word = running();
        word.request_self_suspension();
        assert_eq!(word.detach(), DetachResult::MustPoll);
        word.state_poll();
        word.request_resume();
        assert_eq!(word.detach(), DetachResult::Detached);
        assert_eq!(word.request_self_suspension(), RequestSuspendResult::Dead);
        assert_eq!(word.request_async_suspension(), RequestSuspendResult::Dead);
    }

    #[test]
    fn blocking_with_pending_request_must_poll() {
        let word = running();
        word.request_self_suspension();
        assert_eq!(word.do_blocking(), DoBlockingResult::PollAndRetry);
    }

    #[test]
    #[should_panic]
    fn resuming_a_running_thread_panics() {
        running().request_resume();
    }
}
