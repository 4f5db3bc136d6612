//! Configuration types for the consumer coordinator.

use std::time::Duration;

/// Hard fan-out limit of subscriptions multiplexed on one connection.
///
/// Subscription ids are a single byte, so a connection can never host more.
pub const MAX_SUBSCRIPTIONS_PER_CLIENT: usize = 256;

/// Back-off schedule for recovery attempts.
///
/// `delay(attempt)` yields the wait before the given attempt, or `None` once
/// the optional timeout budget is exhausted, which callers treat as a
/// terminal marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackOffDelayPolicy {
    pub initial_delay: Duration,
    pub delay: Duration,
    pub timeout: Option<Duration>,
}

impl BackOffDelayPolicy {
    /// Same delay before every attempt, no terminal budget.
    pub fn fixed(delay: Duration) -> Self {
        Self::fixed_with_initial_delay(delay, delay)
    }

    pub fn fixed_with_initial_delay(initial_delay: Duration, delay: Duration) -> Self {
        Self {
            initial_delay,
            delay,
            timeout: None,
        }
    }

    pub fn fixed_with_initial_delay_and_timeout(
        initial_delay: Duration,
        delay: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            initial_delay,
            delay,
            timeout: Some(timeout),
        }
    }

    /// Wait before `attempt` (0-based), or `None` when the budget is spent.
    pub fn delay(&self, attempt: usize) -> Option<Duration> {
        if let Some(timeout) = self.timeout {
            let scheduled = self.initial_delay + self.delay * attempt as u32;
            if scheduled > timeout {
                return None;
            }
        }
        if attempt == 0 {
            Some(self.initial_delay)
        } else {
            Some(self.delay)
        }
    }
}

impl Default for BackOffDelayPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

/// Configuration of the consumer coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Tag carried in the pool key so connection categories do not collide.
    pub connection_name: String,
    /// Fan-out limit per connection, at most [`MAX_SUBSCRIPTIONS_PER_CLIENT`].
    pub max_subscriptions_per_client: usize,
    /// Back-off applied when a connection is lost.
    pub recovery_back_off: BackOffDelayPolicy,
    /// Back-off applied after a stream topology change.
    pub topology_update_back_off: BackOffDelayPolicy,
    /// Attempts for a stored-offset query before the failure propagates.
    pub offset_query_attempts: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            connection_name: "consumer-connection".to_string(),
            max_subscriptions_per_client: MAX_SUBSCRIPTIONS_PER_CLIENT,
            recovery_back_off: BackOffDelayPolicy::default(),
            topology_update_back_off: BackOffDelayPolicy::fixed_with_initial_delay_and_timeout(
                Duration::from_secs(5),
                Duration::from_secs(1),
                Duration::from_secs(60),
            ),
            offset_query_attempts: 3,
        }
    }
}

impl CoordinatorConfig {
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new()
    }
}

/// Builder for [`CoordinatorConfig`].
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
        }
    }

    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.config.connection_name = name.into();
        self
    }

    pub fn max_subscriptions_per_client(mut self, max: usize) -> Self {
        self.config.max_subscriptions_per_client = max.min(MAX_SUBSCRIPTIONS_PER_CLIENT);
        self
    }

    pub fn recovery_back_off(mut self, policy: BackOffDelayPolicy) -> Self {
        self.config.recovery_back_off = policy;
        self
    }

    pub fn topology_update_back_off(mut self, policy: BackOffDelayPolicy) -> Self {
        self.config.topology_update_back_off = policy;
        self
    }

    pub fn offset_query_attempts(mut self, attempts: usize) -> Self {
        self.config.offset_query_attempts = attempts.max(1);
        self
    }

    pub fn build(self) -> CoordinatorConfig {
        self.config
    }
}
