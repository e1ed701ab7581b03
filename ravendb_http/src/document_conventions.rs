use std::time::Duration;

/// Client-side configuration shared by the store and its request executors.
#[derive(Debug, Clone)]
pub struct DocumentConventions {
    disable_topology_updates: bool,
    topology_refresh_interval: Duration,
    request_timeout: Duration,
    speed_test_enabled: bool,
    aggressive_cache_duration: Duration,
    changes_reconnect_delay: Duration,
    changes_max_reconnect_delay: Duration,
}

impl Default for DocumentConventions {
    fn default() -> Self {
        Self {
            disable_topology_updates: false,
            topology_refresh_interval: Duration::from_secs(5 * 60),
            request_timeout: Duration::from_secs(30),
            speed_test_enabled: true,
            aggressive_cache_duration: Duration::from_secs(24 * 60 * 60),
            changes_reconnect_delay: Duration::from_secs(1),
            changes_max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

// Mutators
impl DocumentConventions {
    /// Conventions for talking to exactly one server: no topology discovery, no failover.
    pub fn default_for_single_server() -> Self {
        Self {
            disable_topology_updates: true,
            ..Default::default()
        }
    }

    pub fn with_disable_topology_updates(mut self, disable: bool) -> Self {
        self.disable_topology_updates = disable;
        self
    }

    pub fn with_topology_refresh_interval(mut self, interval: Duration) -> Self {
        self.topology_refresh_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_speed_test(mut self, enabled: bool) -> Self {
        self.speed_test_enabled = enabled;
        self
    }

    pub fn with_aggressive_cache_duration(mut self, duration: Duration) -> Self {
        self.aggressive_cache_duration = duration;
        self
    }

    pub fn with_changes_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.changes_reconnect_delay = initial;
        self.changes_max_reconnect_delay = max.max(initial);
        self
    }
}

// Getters
impl DocumentConventions {
    pub fn disable_topology_updates(&self) -> bool {
        self.disable_topology_updates
    }

    pub fn topology_refresh_interval(&self) -> Duration {
        self.topology_refresh_interval
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn speed_test_enabled(&self) -> bool {
        self.speed_test_enabled
    }

    pub fn aggressive_cache_duration(&self) -> Duration {
        self.aggressive_cache_duration
    }

    pub fn changes_reconnect_delay(&self) -> Duration {
        self.changes_reconnect_delay
    }

    pub fn changes_max_reconnect_delay(&self) -> Duration {
        self.changes_max_reconnect_delay
    }
}
