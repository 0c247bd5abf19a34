//! Replica timing parameters.

use std::time::Duration;

/// Timing configuration for a replica.
///
/// The heartbeat interval must stay comfortably below the minimum
/// election timeout or followers start elections against a live leader;
/// the default is one tenth of it.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Interval between leader append rounds (default: 25ms).
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (default: 250ms).
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 500ms).
    pub election_timeout_max: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        let election_timeout_min = Duration::from_millis(250);
        Self {
            heartbeat_interval: election_timeout_min / 10,
            election_timeout_min,
            election_timeout_max: Duration::from_millis(500),
        }
    }
}

impl ReplicaConfig {
    /// Create a new config with a custom heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Create a new config with a custom election timeout range
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Draw a fresh uniform random election timeout within the configured
    /// range. A new draw per reset is what breaks symmetric split votes.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }
}
