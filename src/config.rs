// Copyright 2020 Joyent, Inc.

//! Configuration for a remoting core.

use std::time::Duration;

use serde_derive::Deserialize;

use crate::protocol::DEFAULT_FRAME_MAX_LENGTH;

/// Remoting configuration.
///
/// Permit counts are fixed once a `RemotingCore` is built from this value.
/// Durations are expressed in milliseconds so the structure can be read
/// directly from a JSON document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RemotingConfig {
    /// Concurrent asynchronous requests in flight.
    /// Default: 64
    pub permits_async: usize,
    /// Concurrent one-way requests in flight.
    /// Default: 256
    pub permits_oneway: usize,
    /// Workers running response callbacks. Zero runs callbacks inline on
    /// the thread that matched the response.
    /// Default: 4
    pub callback_executor_threads: usize,
    /// Queued callbacks before submission is rejected.
    /// Default: 10000
    pub callback_queue_capacity: usize,
    /// Delay before the first response table scan.
    /// Default: 3000
    pub reaper_initial_delay_ms: u64,
    /// Period between response table scans.
    /// Default: 1000
    pub reaper_interval_ms: u64,
    /// Slack added to a request's timeout before the reaper expires it.
    /// Default: 1000
    pub reaper_grace_ms: u64,
    /// Connection events held before new ones are dropped.
    /// Default: 10000
    pub event_queue_capacity: usize,
    /// How long the event worker waits for an event before rechecking
    /// its stop flag.
    /// Default: 3000
    pub event_poll_interval_ms: u64,
    /// A connection with no inbound frame for this long reports IDLE.
    /// Zero disables idle detection.
    /// Default: 120000
    pub channel_max_idle_ms: u64,
    /// Largest accepted frame in bytes.
    /// Default: 16 MiB
    pub frame_max_length: usize,
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self {
            permits_async: 64,
            permits_oneway: 256,
            callback_executor_threads: 4,
            callback_queue_capacity: 10_000,
            reaper_initial_delay_ms: 3000,
            reaper_interval_ms: 1000,
            reaper_grace_ms: 1000,
            event_queue_capacity: 10_000,
            event_poll_interval_ms: 3000,
            channel_max_idle_ms: 120_000,
            frame_max_length: DEFAULT_FRAME_MAX_LENGTH,
        }
    }
}

impl RemotingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_permits_async(mut self, permits: usize) -> Self {
        self.permits_async = permits;
        self
    }

    pub fn with_permits_oneway(mut self, permits: usize) -> Self {
        self.permits_oneway = permits;
        self
    }

    pub fn with_callback_executor_threads(mut self, threads: usize) -> Self {
        self.callback_executor_threads = threads;
        self
    }

    pub fn with_reaper_interval_ms(mut self, interval_ms: u64) -> Self {
        self.reaper_interval_ms = interval_ms;
        self
    }

    pub fn with_reaper_initial_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reaper_initial_delay_ms = delay_ms;
        self
    }

    pub fn with_reaper_grace_ms(mut self, grace_ms: u64) -> Self {
        self.reaper_grace_ms = grace_ms;
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    pub fn with_event_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.event_poll_interval_ms = interval_ms;
        self
    }

    pub fn with_channel_max_idle_ms(mut self, idle_ms: u64) -> Self {
        self.channel_max_idle_ms = idle_ms;
        self
    }

    pub fn with_frame_max_length(mut self, len: usize) -> Self {
        self.frame_max_length = len;
        self
    }

    /// At least one millisecond; a zero period is not a schedule.
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms.max(1))
    }

    pub fn reaper_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reaper_initial_delay_ms)
    }

    pub fn reaper_grace(&self) -> Duration {
        Duration::from_millis(self.reaper_grace_ms)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms.max(1))
    }

    /// `None` when idle detection is turned off with a zero limit.
    pub fn channel_max_idle(&self) -> Option<Duration> {
        match self.channel_max_idle_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            RemotingConfig::from_json(r#"{"permits_async": 8, "reaper_grace_ms": 250}"#)
                .unwrap();
        assert_eq!(config.permits_async, 8);
        assert_eq!(config.reaper_grace(), Duration::from_millis(250));
        assert_eq!(config.permits_oneway, 256);
        assert_eq!(config.event_queue_capacity, 10_000);
    }

    #[test]
    fn builder_overrides() {
        let config = RemotingConfig::new()
            .with_permits_oneway(0)
            .with_callback_executor_threads(0);
        assert_eq!(config.permits_oneway, 0);
        assert_eq!(config.callback_executor_threads, 0);
        assert_eq!(config.reaper_interval(), Duration::from_secs(1));
    }

    #[test]
    fn zero_periods_stay_usable() {
        let config = RemotingConfig::from_json(
            r#"{"reaper_interval_ms": 0, "event_poll_interval_ms": 0, "channel_max_idle_ms": 0}"#,
        )
        .unwrap();
        assert_eq!(config.reaper_interval(), Duration::from_millis(1));
        assert_eq!(config.event_poll_interval(), Duration::from_millis(1));
        assert_eq!(config.channel_max_idle(), None);
        assert_eq!(
            RemotingConfig::new().channel_max_idle(),
            Some(Duration::from_secs(120))
        );
    }
}
