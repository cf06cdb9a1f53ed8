//! Session configuration.
//!
//! Every timing constant the drivers depend on lives in [`Timing`] so hosts
//! can tune them without touching driver code. All fields have defaults, so
//! an empty JSON object is a valid configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::keys::InputMode;

/// Timeouts, delays and limits used by the link and the drivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// How long to wait for the first byte of a frame.
    pub initial_timeout_ms: u64,
    /// How long to wait for each following byte of a frame.
    pub continuation_timeout_ms: u64,
    /// How long each identify attempt waits for a response.
    pub identify_timeout_ms: u64,
    /// Total identify attempts before giving up.
    pub retry_limit: u32,
    /// How long a write may wait for the previous packet's acknowledgement.
    pub ack_timeout_ms: u64,
    /// Pause after asking a device to change its baud rate.
    pub baud_switch_delay_ms: u64,
    /// Window in which an identical non-repeatable command is dropped.
    pub non_repeat_ms: u64,
    /// Consecutive malformed frames tolerated before the session fails.
    pub fault_limit: u32,
    /// Extra delay per slow-update level after each display write.
    pub slow_update_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            initial_timeout_ms: 0,
            continuation_timeout_ms: 100,
            identify_timeout_ms: 1000,
            retry_limit: 3,
            ack_timeout_ms: 1000,
            baud_switch_delay_ms: 100,
            non_repeat_ms: 300,
            fault_limit: 8,
            slow_update_ms: 24,
        }
    }
}

impl Timing {
    /// Timing with every sleep removed, for in-memory transports.
    ///
    /// Read timeouts stay non-zero so that scripted responses queued by a
    /// responder are still picked up within one attempt.
    pub fn immediate() -> Self {
        Self {
            initial_timeout_ms: 0,
            continuation_timeout_ms: 10,
            identify_timeout_ms: 10,
            retry_limit: 3,
            ack_timeout_ms: 0,
            baud_switch_delay_ms: 0,
            non_repeat_ms: 300,
            fault_limit: 8,
            slow_update_ms: 0,
        }
    }

    pub fn continuation_timeout(&self) -> Duration {
        Duration::from_millis(self.continuation_timeout_ms)
    }

    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }

    pub fn non_repeat(&self) -> Duration {
        Duration::from_millis(self.non_repeat_ms)
    }
}

/// Configuration for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timing: Timing,
    /// Whether reads deliver raw key events or resolved commands.
    pub input_mode: InputMode,
    /// How often a host should poll for input.
    pub poll_interval_ms: u64,
    /// Full display rewrite period for drivers that refresh periodically.
    pub freshen_every: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timing: Timing::default(),
            input_mode: InputMode::Keys,
            poll_interval_ms: 40,
            freshen_every: 12,
        }
    }
}

impl SessionConfig {
    /// Configuration suited to tests over [`crate::transport::MockTransport`].
    pub fn immediate() -> Self {
        Self {
            timing: Timing::immediate(),
            ..Self::default()
        }
    }

    pub fn with_input_mode(mut self, mode: InputMode) -> Self {
        self.input_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: SessionConfig = serde_json::from_str("{}").expect("empty config should parse");
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.timing.fault_limit, 8);
        assert_eq!(config.freshen_every, 12);
    }

    #[test]
    fn test_partial_timing_override() {
        let json = r#"{"timing":{"retry_limit":5,"non_repeat_ms":150},"input_mode":"commands"}"#;
        let config: SessionConfig = serde_json::from_str(json).expect("config should parse");
        assert_eq!(config.timing.retry_limit, 5);
        assert_eq!(config.timing.non_repeat_ms, 150);
        assert_eq!(
            config.timing.identify_timeout_ms, 1000,
            "unset fields keep their defaults"
        );
        assert_eq!(config.input_mode, InputMode::Commands);
    }

    #[test]
    fn test_immediate_has_no_sleeps() {
        let timing = Timing::immediate();
        assert_eq!(timing.slow_update_ms, 0);
        assert_eq!(timing.baud_switch_delay_ms, 0);
        assert!(timing.identify_timeout_ms > 0);
    }
}
