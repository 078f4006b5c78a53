use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Pool configuration. Defaults match an unconfigured pool: four slots and
/// a one-millisecond readiness poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Delay between readiness scans after a waiter has been served.
    #[serde(default = "default_ready_poll_interval")]
    pub ready_poll_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            ready_poll_interval: default_ready_poll_interval(),
        }
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn ready_poll_interval(mut self, interval: Duration) -> Self {
        self.ready_poll_interval = interval;
        self
    }
}

fn default_limit() -> usize {
    4
}

fn default_ready_poll_interval() -> Duration {
    Duration::from_millis(1)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::PoolOptions;

    #[test]
    fn defaults_are_four_slots_and_one_millisecond() {
        let options = PoolOptions::default();
        assert_eq!(options.limit, 4);
        assert_eq!(options.ready_poll_interval, Duration::from_millis(1));
    }

    #[test]
    fn builder_setters_override_fields() {
        let options = PoolOptions::new()
            .limit(2)
            .ready_poll_interval(Duration::from_millis(5));
        assert_eq!(options.limit, 2);
        assert_eq!(options.ready_poll_interval, Duration::from_millis(5));
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let options: PoolOptions = serde_json::from_str(r#"{"limit": 2}"#).expect("deserialize");
        assert_eq!(options.limit, 2);
        assert_eq!(options.ready_poll_interval, Duration::from_millis(1));
    }
}
