use std::time::Duration;

use crate::errors::SignalError;

/// Exponential retry delay: `next()` hands out the current delay and then
/// multiplies it, capped at `maximum`.
///
/// Not synchronized. The transport actor is the only caller.
#[derive(Debug, Clone)]
pub struct BackoffCounter {
    minimum: Duration,
    maximum: Duration,
    multiplier: f64,
    current: Duration,
}

impl BackoffCounter {
    pub fn new(minimum: Duration, maximum: Duration, multiplier: f64) -> Result<Self, SignalError> {
        if minimum.is_zero() {
            return Err(SignalError::InvalidBackoff("minimum must be positive".into()));
        }
        if maximum < minimum {
            return Err(SignalError::InvalidBackoff(format!(
                "maximum {maximum:?} is below minimum {minimum:?}"
            )));
        }
        if !multiplier.is_finite() || multiplier <= 1.0 {
            return Err(SignalError::InvalidBackoff(format!(
                "multiplier must be greater than 1, got {multiplier}"
            )));
        }
        Ok(Self {
            minimum,
            maximum,
            multiplier,
            current: minimum,
        })
    }

    /// Return the delay to wait now and grow the next one.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.maximum)
            .min(self.maximum);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.minimum;
    }

    /// The delay the next call to `next()` will return.
    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for BackoffCounter {
    fn default() -> Self {
        Self {
            minimum: Duration::from_millis(500),
            maximum: Duration::from_secs(32),
            multiplier: 2.0,
            current: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> BackoffCounter {
        BackoffCounter::new(Duration::from_millis(500), Duration::from_secs(4), 2.0).unwrap()
    }

    #[test]
    fn delays_double_until_maximum() {
        let mut backoff = counter();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next().as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 4000, 4000, 4000]);
    }

    #[test]
    fn delays_never_decrease() {
        let mut backoff =
            BackoffCounter::new(Duration::from_millis(300), Duration::from_secs(10), 1.5).unwrap();
        let mut previous = Duration::ZERO;
        for _ in 0..30 {
            let delay = backoff.next();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(10));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(10));
    }

    #[test]
    fn reset_returns_to_minimum() {
        let mut backoff = counter();
        backoff.next();
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(500));
        assert_eq!(backoff.next(), Duration::from_millis(500));
    }

    #[test]
    fn default_matches_transport_defaults() {
        let mut backoff = BackoffCounter::default();
        assert_eq!(backoff.next(), Duration::from_millis(500));
        assert_eq!(backoff.next(), Duration::from_secs(1));
        for _ in 0..10 {
            backoff.next();
        }
        assert_eq!(backoff.current(), Duration::from_secs(32));
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(BackoffCounter::new(Duration::ZERO, Duration::from_secs(1), 2.0).is_err());
        assert!(BackoffCounter::new(Duration::from_secs(2), Duration::from_secs(1), 2.0).is_err());
        assert!(BackoffCounter::new(Duration::from_secs(1), Duration::from_secs(2), 1.0).is_err());
        assert!(
            BackoffCounter::new(Duration::from_secs(1), Duration::from_secs(2), f64::NAN).is_err()
        );
    }

    #[test]
    fn minimum_equal_to_maximum_is_constant() {
        let mut backoff =
            BackoffCounter::new(Duration::from_secs(1), Duration::from_secs(1), 3.0).unwrap();
        assert_eq!(backoff.next(), Duration::from_secs(1));
        assert_eq!(backoff.next(), Duration::from_secs(1));
    }
}
