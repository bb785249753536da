//! Core configuration. Constructed explicitly and passed to each component.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::face::PumpConfig;
use crate::name::Name;
use crate::retry::RetryPolicy;

pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Shared settings for clients, publishers and subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Lifetime of requests this crate builds (default 4000 ms).
    #[serde(default = "default_lifetime", with = "duration_ms")]
    pub default_lifetime: Duration,
    /// Sleep between `pump()` calls in blocking wrappers (default 10 ms, 0 = spin).
    #[serde(default = "default_pump_interval", with = "duration_ms")]
    pub pump_interval: Duration,
    /// Give up a blocking wait after this many pumps (default: never).
    #[serde(default)]
    pub max_pump_iterations: Option<u64>,
    /// Largest content carried by one response before it is segmented.
    /// Publishers split messages at this size.
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: usize,
    /// Messages a publisher keeps for late subscribers, oldest evicted first
    /// (default 1024).
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: Option<usize>,
    /// Publisher pending-table capacity (default: unbounded).
    #[serde(default)]
    pub pit_capacity: Option<usize>,
    /// Namespace shared by all announcements.
    #[serde(default = "default_broadcast_prefix")]
    pub broadcast_prefix: String,
    /// Retry policy for segment fetches.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Segments kept in flight once the final segment is known.
    #[serde(default = "default_pipeline_window")]
    pub pipeline_window: u64,
}

fn default_lifetime() -> Duration {
    crate::packet::DEFAULT_LIFETIME
}
fn default_pump_interval() -> Duration {
    Duration::from_millis(10)
}
fn default_max_segment_size() -> usize {
    crate::segment::DEFAULT_SEGMENT_SIZE
}
fn default_cache_capacity() -> Option<usize> {
    Some(DEFAULT_CACHE_CAPACITY)
}
fn default_broadcast_prefix() -> String {
    "/ndn/broadcast/ndnkit-pubsub".to_string()
}
fn default_pipeline_window() -> u64 {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_lifetime: default_lifetime(),
            pump_interval: default_pump_interval(),
            max_pump_iterations: None,
            max_segment_size: default_max_segment_size(),
            cache_capacity: default_cache_capacity(),
            pit_capacity: None,
            broadcast_prefix: default_broadcast_prefix(),
            retry: RetryPolicy::default(),
            pipeline_window: default_pipeline_window(),
        }
    }
}

impl Config {
    pub fn pump(&self) -> PumpConfig {
        PumpConfig {
            interval: (!self.pump_interval.is_zero()).then_some(self.pump_interval),
            max_iterations: self.max_pump_iterations,
        }
    }

    /// Check values serde cannot: the broadcast prefix parses, the retry
    /// policy can give up and segments are non-empty.
    pub fn validate(&self) -> Result<()> {
        self.broadcast_prefix()?;
        self.retry.validate()?;
        if self.max_segment_size == 0 {
            return Err(Error::InvalidConfig("max_segment_size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn broadcast_prefix(&self) -> Result<Name> {
        self.broadcast_prefix
            .parse()
            .map_err(|e| Error::MalformedName {
                name: Name::new(),
                reason: format!("broadcast prefix {:?}: {}", self.broadcast_prefix, e),
            })
    }
}

/// Serialize a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (v.as_millis() as u64).serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms: u64 = Deserialize::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
