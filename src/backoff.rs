use std::{collections::HashMap, sync::Mutex, time::Duration};

/// Per-record exponential requeue backoff
pub struct Backoff {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
    attempts: Mutex<HashMap<String, u32>>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

impl Backoff {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let base = (self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt.min(32) as i32))
            .min(max);

        let jitter_range = base * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;

        Duration::from_secs_f64((base + jitter).clamp(0.0, max))
    }

    /// Delay before the next retry of `key`; every call counts as a failure.
    pub fn next(&self, key: &str) -> Duration {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            let attempt = attempts.entry(key.to_string()).or_insert(0);
            let current = *attempt;
            *attempt = attempt.saturating_add(1);
            current
        };
        self.delay_for_attempt(attempt)
    }

    pub fn reset(&self, key: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}
