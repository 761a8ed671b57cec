use std::time::{Duration, Instant};

use rand::Rng;

use crate::settings::StreamSettings;

/// Exponential backoff with jitter.
///
/// The base delay starts at zero so that the first retry after a reset runs
/// immediately, grows by `backoff_factor` after every attempt and is clamped
/// between the initial delay and `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    jitter: f64,
    current_base: Duration,
    last_attempt: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, backoff_factor: f64, max_delay: Duration, jitter: f64) -> Self {
        Self {
            initial_delay,
            backoff_factor,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
            current_base: Duration::ZERO,
            last_attempt: None,
        }
    }

    pub fn from_settings(settings: &StreamSettings) -> Self {
        Self::new(
            settings.initial_backoff,
            settings.backoff_factor,
            settings.max_backoff,
            settings.backoff_jitter,
        )
    }

    /// Resets to the floor; the next attempt runs without delay.
    pub fn reset(&mut self) {
        self.current_base = Duration::ZERO;
    }

    /// Forces the next attempt to wait the maximum delay.
    pub fn reset_to_max(&mut self) {
        self.current_base = self.max_delay;
    }

    pub fn current_base(&self) -> Duration {
        self.current_base
    }

    /// Returns the delay before the next attempt and advances the base delay.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    pub(crate) fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base_millis = self.current_base.as_millis() as f64;
        let jitter = if self.jitter > 0.0 {
            self.jitter * base_millis * rng.gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        let desired = Duration::from_millis((base_millis + jitter).max(0.0).round() as u64);

        // Time already spent since the last attempt counts against the delay.
        let elapsed = self
            .last_attempt
            .map(|instant| instant.elapsed())
            .unwrap_or(Duration::ZERO);
        let remaining = desired.saturating_sub(elapsed);
        if remaining > Duration::ZERO {
            log::debug!(
                "backing off for {} ms (base delay {} ms)",
                remaining.as_millis(),
                self.current_base.as_millis()
            );
        }

        self.last_attempt = Some(Instant::now() + remaining);
        self.current_base = self
            .current_base
            .mul_f64(self.backoff_factor)
            .clamp(self.initial_delay, self.max_delay);
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn backoff(jitter: f64) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(1_000),
            jitter,
        )
    }

    #[test]
    fn first_attempt_after_reset_is_immediate() {
        let mut backoff = backoff(0.5);
        let mut rng = StdRng::seed_from_u64(42);
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
        assert_eq!(backoff.current_base(), Duration::from_millis(100));
    }

    #[test]
    fn base_delay_is_non_decreasing_up_to_ceiling() {
        let mut backoff = backoff(0.0);
        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            backoff.last_attempt = None;
            let delay = backoff.next_delay_with_rng(&mut StdRng::seed_from_u64(1));
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(1_000));
            previous = delay;
        }
        assert_eq!(backoff.current_base(), Duration::from_millis(1_000));
    }

    #[test]
    fn reset_returns_to_floor_and_reset_to_max_jumps_to_ceiling() {
        let mut backoff = backoff(0.0);
        for _ in 0..3 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.current_base(), Duration::ZERO);
        backoff.reset_to_max();
        assert_eq!(backoff.current_base(), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = backoff(0.5);
        backoff.reset_to_max();
        let mut rng = StdRng::seed_from_u64(7);
        let delay = backoff.next_delay_with_rng(&mut rng);
        assert!(delay >= Duration::from_millis(500));
        assert!(delay <= Duration::from_millis(1_500));
    }
}
