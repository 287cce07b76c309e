use std::time::Duration;

use rand::Rng;

/// Backoff used when the upstream connection has to be re-established.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay added or removed at random.
    pub jitter_factor: f64,
    /// Give up after this many consecutive failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Policy without jitter, handy where timing has to be predictable.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            jitter_factor: 0.0,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }

    /// Delay before retry number `attempt` (0-based): base * 2^attempt, capped
    /// at `max_delay`, then jittered by +/- `jitter_factor`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = base_ms * 2.0_f64.powi(attempt.min(30) as i32);
        let capped = exp.min(max_ms);

        let jitter_range = capped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).clamp(0.0, max_ms) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_without_jitter() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.0,
            max_attempts: None,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.0,
            max_attempts: None,
        };
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.2,
            max_attempts: None,
        };
        for _ in 0..100 {
            let d = policy.delay_for(0).as_millis();
            assert!((800..=1200).contains(&d), "got {d}ms");
        }
    }

    #[test]
    fn attempt_limit() {
        let unlimited = ReconnectPolicy::default();
        assert!(unlimited.allows(1_000_000));

        let limited = ReconnectPolicy::fixed(Duration::from_millis(10)).with_max_attempts(3);
        assert!(limited.allows(0));
        assert!(limited.allows(2));
        assert!(!limited.allows(3));
        assert_eq!(limited.delay_for(7), Duration::from_millis(10));
    }
}
