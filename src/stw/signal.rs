//! Asynchronous suspension with POSIX signals.
//!
//! The suspend signal's handler runs on the target thread, records where the thread stopped,
//! acknowledges, and then sits in `sigsuspend` until the coordinator sets `async_resume` and sends
//! the resume signal. The resume signal stays blocked inside the suspend handler except while in
//! `sigsuspend`, so a resume that arrives early is kept pending rather than lost.

use std::io;
use std::sync::atomic::Ordering;

use super::state::{AsyncSuspendOutcome, ThreadState};
use super::thread::current_thread_ptr;
use super::MutatorThread;
use crate::util::rust_util::approximate_stack_pointer;
use crate::vm::{PlatformSuspend, SuspendStatus};

pub const SUSPEND_SIGNAL: libc::c_int = libc::SIGXCPU;
pub const RESUME_SIGNAL: libc::c_int = libc::SIGXFSZ;

extern "C" fn suspend_handler(_signal: libc::c_int) {
    let ptr = current_thread_ptr();
    if ptr.is_null() {
        // Not an attached thread.
        return;
    }
    let thread = unsafe { &*ptr };
    thread.in_handler.store(true, Ordering::SeqCst);
    match thread.state.finish_async_suspend() {
        AsyncSuspendOutcome::Suspended => {
            thread
                .stopped_in_critical
                .store(thread.in_critical_region(), Ordering::Relaxed);
            thread.save_context(approximate_stack_pointer());
            thread.pending.post_from_signal();
            unsafe {
                let mut mask: libc::sigset_t = std::mem::zeroed();
                libc::sigfillset(&mut mask);
                libc::sigdelset(&mut mask, RESUME_SIGNAL);
                while !thread.async_resume.load(Ordering::Acquire) {
                    libc::sigsuspend(&mask);
                }
            }
            thread.async_resume.store(false, Ordering::Relaxed);
            thread.pending.post_from_signal();
        }
        // The thread stopped itself at a safepoint and left the acknowledgement to us.
        AsyncSuspendOutcome::LostRace => thread.pending.post_from_signal(),
        AsyncSuspendOutcome::Cancelled => {}
    }
    thread.in_handler.store(false, Ordering::SeqCst);
}

extern "C" fn resume_handler(_signal: libc::c_int) {
    // Only here to interrupt `sigsuspend`.
}

/// Replace the process-wide handler of `signal`, blocking `blocked` while it runs.
fn install(signal: libc::c_int, handler: extern "C" fn(libc::c_int), blocked: &[libc::c_int]) -> io::Result<()> {
    let result = unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        for s in blocked {
            libc::sigaddset(&mut action.sa_mask, *s);
        }
        libc::sigaction(signal, &action, std::ptr::null_mut())
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The signal backend. Installing it replaces any handlers for `SUSPEND_SIGNAL` and
/// `RESUME_SIGNAL` in the whole process.
#[derive(Debug)]
pub struct SignalSuspend {
    _private: (),
}

impl SignalSuspend {
    pub fn install() -> io::Result<Self> {
        install(SUSPEND_SIGNAL, suspend_handler, &[RESUME_SIGNAL])?;
        install(RESUME_SIGNAL, resume_handler, &[])?;
        info!(
            "Installed signal suspend handlers (suspend: {}, resume: {})",
            SUSPEND_SIGNAL, RESUME_SIGNAL
        );
        Ok(SignalSuspend { _private: () })
    }

    fn send(thread: &MutatorThread, signal: libc::c_int) -> bool {
        let result = unsafe { libc::pthread_kill(thread.native_handle() as libc::pthread_t, signal) };
        if result != 0 {
            warn!(
                "pthread_kill({}, {}) failed: {}",
                thread.id(),
                signal,
                io::Error::from_raw_os_error(result)
            );
        }
        result == 0
    }
}

impl PlatformSuspend for SignalSuspend {
    fn supports_async(&self) -> bool {
        true
    }

    fn request_suspend(&self, thread: &MutatorThread) -> bool {
        Self::send(thread, SUSPEND_SIGNAL)
    }

    fn confirm_suspended(&self, thread: &MutatorThread) -> SuspendStatus {
        if !thread.has_saved_context() {
            return SuspendStatus::NotPossible;
        }
        match thread.state() {
            ThreadState::AsyncSuspended if thread.stopped_in_critical.load(Ordering::Relaxed) => {
                SuspendStatus::InCriticalLocation
            }
            _ => SuspendStatus::Suspended,
        }
    }

    fn request_resume(&self, thread: &MutatorThread) -> bool {
        thread.async_resume.store(true, Ordering::Release);
        Self::send(thread, RESUME_SIGNAL)
    }

    fn confirm_resumed(&self, thread: &MutatorThread) -> bool {
        !thread.in_handler.load(Ordering::SeqCst) && !thread.state().is_suspended()
    }
}
