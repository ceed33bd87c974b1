//! Exponentially time-decaying counter used to score recent node errors.
//!
//! Every read decays the stored value across the time elapsed since the last
//! observation and writes the decayed value back, so reading is not free of
//! side effects.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Time for an untouched counter to lose half of its value.
pub const DEFAULT_HALF_LIFE: Duration = Duration::from_secs(10);

struct DecayState {
    p: f64,
    stamped: Instant,
}

/// A scalar that shrinks as `p * base^(rate * elapsed_secs)` between increments.
pub struct Decaying {
    state: Mutex<DecayState>,
    base: f64,
    rate: f64,
}

impl Decaying {
    /// Counter starting at zero that halves every [`DEFAULT_HALF_LIFE`].
    pub fn new() -> Self {
        Self::with_half_life(0.0, DEFAULT_HALF_LIFE)
    }

    /// Counter with base `e` and a rate derived from `half_life`.
    pub fn with_half_life(p: f64, half_life: Duration) -> Self {
        let rate = -std::f64::consts::LN_2 / half_life.as_secs_f64();
        Self::with_params(p, std::f64::consts::E, rate)
    }

    pub fn with_params(p: f64, base: f64, rate: f64) -> Self {
        Self {
            state: Mutex::new(DecayState {
                p,
                stamped: Instant::now(),
            }),
            base,
            rate,
        }
    }

    /// Add `amount` to the decayed value.
    pub fn incr(&self, amount: f64) {
        let mut state = self.lock();
        let decayed = self.decay(&mut state, Instant::now());
        state.p = decayed + amount;
    }

    /// Current decayed value. Persists the decay and restamps the counter.
    pub fn value(&self) -> f64 {
        let mut state = self.lock();
        self.decay(&mut state, Instant::now())
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn decay(&self, state: &mut DecayState, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(state.stamped).as_secs_f64();
        state.p *= self.base.powf(self.rate * elapsed);
        state.stamped = now;
        state.p
    }

    fn lock(&self) -> MutexGuard<'_, DecayState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Decaying counter lock poisoned - recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Pretend the last observation happened `by` earlier than it did.
    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        let mut state = self.lock();
        if let Some(earlier) = state.stamped.checked_sub(by) {
            state.stamped = earlier;
        }
    }
}

impl Default for Decaying {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Decaying {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decaying")
            .field("p", &self.lock().p)
            .field("base", &self.base)
            .field("rate", &self.rate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TOLERANCE: f64 = 1e-3;

    #[test]
    fn starts_at_zero() {
        let counter = Decaying::new();
        assert_eq!(counter.value(), 0.0);
    }

    #[test]
    fn value_right_after_incr_is_the_increment() {
        let counter = Decaying::new();
        counter.incr(5.0);
        assert!((counter.value() - 5.0).abs() < TOLERANCE);
    }

    #[test]
    fn value_halves_after_one_half_life() {
        let counter = Decaying::new();
        counter.incr(5.0);
        assert!((counter.value() - 5.0).abs() < TOLERANCE);

        counter.backdate(DEFAULT_HALF_LIFE);
        assert!((counter.value() - 2.5).abs() < TOLERANCE);
    }

    #[test]
    fn read_persists_decay() {
        let counter = Decaying::new();
        counter.incr(8.0);
        counter.backdate(DEFAULT_HALF_LIFE);
        let first = counter.value();
        // The second read decays from the persisted value, not from 8.
        let second = counter.value();
        assert!((first - 4.0).abs() < TOLERANCE);
        assert!(second <= first);
        assert!((second - 4.0).abs() < TOLERANCE);
    }

    #[test]
    fn incr_adds_to_decayed_value() {
        let counter = Decaying::new();
        counter.incr(4.0);
        counter.backdate(DEFAULT_HALF_LIFE * 2);
        counter.incr(1.0);
        assert!((counter.value() - 2.0).abs() < TOLERANCE);
    }

    #[test]
    fn real_time_decay_with_short_half_life() {
        let counter = Decaying::with_half_life(10.0, Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(100));
        assert!(counter.value() < 10.0 / 4.0);
    }

    #[test]
    fn default_rate_halves_in_ten_seconds() {
        let counter = Decaying::new();
        assert_eq!(counter.base(), std::f64::consts::E);
        let factor = counter.base().powf(counter.rate() * 10.0);
        assert!((factor - 0.5).abs() < 1e-9);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        // Long half-life so decay during the test is negligible.
        let counter = Arc::new(Decaying::with_half_life(0.0, Duration::from_secs(3600 * 24)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        counter.incr(1.0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!((counter.value() - 800.0).abs() < 0.1);
    }
}
