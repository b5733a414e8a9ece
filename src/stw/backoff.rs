use std::time::Duration;

/// Yields this many times before it starts sleeping.
const YIELD_LIMIT: u32 = 8;

/// Bounded exponential backoff for the suspend retry loop: a few yields, then sleeps that double
/// from `unit` up to `max`. There is no overall deadline.
#[derive(Clone, Debug)]
pub struct Backoff {
    step: u32,
    unit: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(unit_us: usize, max_us: usize) -> Self {
        let unit = Duration::from_micros(unit_us as u64);
        Backoff {
            step: 0,
            unit,
            max: Duration::from_micros(max_us as u64).max(unit),
        }
    }

    /// The sleep the next `snooze` would take, or `None` if it would only yield.
    pub fn next_sleep(&self) -> Option<Duration> {
        if self.step < YIELD_LIMIT {
            return None;
        }
        let doublings = (self.step - YIELD_LIMIT).min(16);
        Some(self.unit.saturating_mul(1 << doublings).min(self.max))
    }

    pub fn snooze(&mut self) {
        match self.next_sleep() {
            None => std::thread::yield_now(),
            Some(duration) => std::thread::sleep(duration),
        }
        self.step = self.step.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_then_sleeps_with_cap() {
        let mut backoff = Backoff::new(200, 1000);
        for _ in 0..YIELD_LIMIT {
            assert_eq!(backoff.next_sleep(), None);
            backoff.step += 1;
        }
        assert_eq!(backoff.next_sleep(), Some(Duration::from_micros(200)));
        backoff.step += 1;
        assert_eq!(backoff.next_sleep(), Some(Duration::from_micros(400)));
        backoff.step += 1;
        assert_eq!(backoff.next_sleep(), Some(Duration::from_micros(800)));
        backoff.step += 1;
        assert_eq!(backoff.next_sleep(), Some(Duration::from_micros(1000)));
        backoff.step += 100;
        assert_eq!(backoff.next_sleep(), Some(Duration::from_micros(1000)));
        backoff.reset();
        assert_eq!(backoff.next_sleep(), None);
    }
}
