//! Centralized configuration for parley.
//!
//! Protocol constants and limits live on holder structs as associated
//! constants; per-run settings are collected in [`RunConfig`].

use crate::error::{ParleyError, Result};
use serde::{Deserialize, Serialize};

/// Wire protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const MAGIC: u32 = 1_736_434_764;
    pub const RESPONSE_MAGIC: u32 = Self::MAGIC + 1;
    pub const SEND_OPCODE: u8 = 3;
    pub const RECEIVE_OPCODE: u8 = 4;
    /// Source id meaning "receive from any instance".
    pub const ANY_SOURCE: i32 = -1;
    pub const MAX_PAYLOAD_SIZE: usize = 8 * 1024 * 1024;

    pub const HEADER_SIZE: usize = 12;
    pub const SEND_HEADER_SIZE: usize = 12;
    pub const RECEIVE_HEADER_SIZE: usize = 8;
    pub const RESPONSE_HEADER_SIZE: usize = 12;

    /// File descriptor on which an instance reads responses.
    pub const INSTANCE_INPUT_FD: i32 = 3;
    /// File descriptor on which an instance writes requests.
    pub const INSTANCE_OUTPUT_FD: i32 = 4;
}

/// Run limits.
pub struct LimitsConfig;

impl LimitsConfig {
    pub const MAX_INSTANCES: usize = 100;
    pub const MESSAGE_COUNT_LIMIT: u64 = 1000;
    pub const MESSAGE_BYTES_LIMIT: u64 = 8 * 1024 * 1024;
    /// Each bridge has at most one request in flight.
    pub const CHANNEL_CAPACITY: usize = 1;
}

/// Per-instance sending quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quotas {
    pub max_messages: u64,
    pub max_bytes: u64,
}

impl Default for Quotas {
    fn default() -> Self {
        Self {
            max_messages: LimitsConfig::MESSAGE_COUNT_LIMIT,
            max_bytes: LimitsConfig::MESSAGE_BYTES_LIMIT,
        }
    }
}

/// What to do with messages that were sent but never received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UndeliveredPolicy {
    Ignore,
    #[default]
    Warn,
    Fail,
}

impl UndeliveredPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UndeliveredPolicy::Ignore => "ignore",
            UndeliveredPolicy::Warn => "warn",
            UndeliveredPolicy::Fail => "fail",
        }
    }
}

impl std::str::FromStr for UndeliveredPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(UndeliveredPolicy::Ignore),
            "warn" => Ok(UndeliveredPolicy::Warn),
            "fail" => Ok(UndeliveredPolicy::Fail),
            other => Err(format!(
                "unknown policy '{}' (expected ignore, warn or fail)",
                other
            )),
        }
    }
}

impl std::fmt::Display for UndeliveredPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Number of instances to start.
    pub instances: usize,
    /// Sending quotas applied to every instance.
    pub quotas: Quotas,
    /// Log every request and response with its virtual time.
    pub trace: bool,
    /// Handling of messages left in the router at the end of the run.
    pub undelivered: UndeliveredPolicy,
}

impl RunConfig {
    /// Create a config for `instances` instances with default limits.
    pub fn new(instances: usize) -> Self {
        Self {
            instances,
            quotas: Quotas::default(),
            trace: false,
            undelivered: UndeliveredPolicy::default(),
        }
    }

    /// Set the sending quotas.
    pub fn with_quotas(mut self, quotas: Quotas) -> Self {
        self.quotas = quotas;
        self
    }

    /// Enable or disable communication tracing.
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Set the undelivered-message policy.
    pub fn with_undelivered(mut self, policy: UndeliveredPolicy) -> Self {
        self.undelivered = policy;
        self
    }

    /// Check that the settings describe a runnable configuration.
    pub fn validate(&self) -> Result<()> {
        if self.instances < 1 || self.instances > LimitsConfig::MAX_INSTANCES {
            return Err(ParleyError::Config {
                message: format!(
                    "number of instances must be in [1, {}], got {}",
                    LimitsConfig::MAX_INSTANCES,
                    self.instances
                ),
            });
        }
        Ok(())
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_magic_follows_magic() {
        assert_eq!(ProtocolConfig::RESPONSE_MAGIC, 1_736_434_765);
    }

    #[test]
    fn test_default_quotas() {
        let quotas = Quotas::default();
        assert_eq!(quotas.max_messages, 1000);
        assert_eq!(quotas.max_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn test_validate_instance_bounds() {
        assert!(RunConfig::new(1).validate().is_ok());
        assert!(RunConfig::new(100).validate().is_ok());
        assert!(RunConfig::new(0).validate().is_err());
        assert!(RunConfig::new(101).validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = RunConfig::new(4)
            .with_trace(true)
            .with_undelivered(UndeliveredPolicy::Fail)
            .with_quotas(Quotas {
                max_messages: 5,
                max_bytes: 10,
            });
        assert!(config.trace);
        assert_eq!(config.undelivered, UndeliveredPolicy::Fail);
        assert_eq!(config.quotas.max_messages, 5);
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!("fail".parse::<UndeliveredPolicy>(), Ok(UndeliveredPolicy::Fail));
        assert_eq!(UndeliveredPolicy::default().to_string(), "warn");
        assert!("sometimes".parse::<UndeliveredPolicy>().is_err());
    }
}
