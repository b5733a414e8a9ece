use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use super::backoff::Backoff;

/// A counting semaphore. A suspended thread waits on its own semaphore until it is resumed.
#[derive(Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    cvar: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits += 1;
        self.cvar.notify_one();
    }

    pub fn wait(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.cvar.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    pub fn try_wait(&self) -> bool {
        let mut permits = self.permits.lock().unwrap();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }
}

/// Counts acknowledgements from mutators to the thread stopping or restarting the world.
///
/// Posting is a single atomic add, so it may be done from a signal handler. The waiter polls.
#[derive(Default)]
pub struct PendingOps {
    acks: AtomicUsize,
}

impl PendingOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self) {
        self.acks.fetch_add(1, Ordering::Release);
    }

    /// `post` for use inside a signal handler. Touches nothing but the counter.
    pub fn post_from_signal(&self) {
        self.acks.fetch_add(1, Ordering::Release);
    }

    /// Consume `count` acknowledgements, waiting until they have all arrived.
    pub fn wait(&self, count: usize, mut backoff: Backoff) {
        let mut consumed = 0;
        while consumed < count {
            let available = self.acks.load(Ordering::Acquire);
            if available == 0 {
                backoff.snooze();
                continue;
            }
            let take = available.min(count - consumed);
            if self
                .acks
                .compare_exchange(
                    available,
                    available - take,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                consumed += take;
                backoff.reset();
            }
        }
    }

    /// Acknowledgements posted but not yet consumed.
    pub fn outstanding(&self) -> usize {
        self.acks.load(Ordering::Acquire)
    }
}
