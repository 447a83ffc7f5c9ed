use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::channel::ChannelDescriptor;

/// Per-engine tuning, shared by all links of a publisher or subscriber engine. Not every field
///  is relevant to both sides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound for the publisher's retained queue (trimmed on every ack tick) and for the
    ///  span of the subscriber's receive queue (exceeding it forces a reconnect)
    pub max_queue_size: u64,

    /// Time an accepted (publisher) or established (subscriber) TCP connection has to complete
    ///  the login exchange
    #[serde(rename = "login_timeout_ms", with = "millis")]
    pub login_timeout: Duration,

    /// Delay between a failed connection attempt and the next one. Reconnects caused by
    ///  desynchronization happen immediately.
    #[serde(rename = "reconn_interval_ms", with = "millis")]
    pub reconn_interval: Duration,

    /// Interval for repeating a resend request while the gap is still open. This is also the
    ///  time a manual resend waits for its reply.
    #[serde(rename = "re_req_interval_ms", with = "millis")]
    pub re_req_interval: Duration,

    /// Largest gap a subscriber tries to fill by resend requests, and largest resend request a
    ///  publisher honors. Bigger gaps are treated as desynchronization.
    pub re_req_max_gap: u32,

    /// publisher: interval for trimming the retained queue
    #[serde(rename = "ack_interval_ms", with = "millis")]
    pub ack_interval: Duration,

    /// publisher: interval for multicasting heartbeats
    #[serde(rename = "heartbeat_interval_ms", with = "millis")]
    pub heartbeat_interval: Duration,

    /// subscriber: number of consecutive one-second ticks without any traffic before the link
    ///  is considered dead
    pub timeout: u32,

    /// publisher: listen backlog for TCP login connections
    pub n_accepts: u32,

    pub ttl: u32,
    pub loopback: bool,
    /// outbound interface for multicast sends, and the interface for joining multicast groups
    pub interface: Ipv4Addr,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_queue_size: 100_000,
            login_timeout: Duration::from_secs(10),
            reconn_interval: Duration::from_secs(10),
            re_req_interval: Duration::from_secs(1),
            re_req_max_gap: 10,
            ack_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            timeout: 3,
            n_accepts: 8,
            ttl: 1,
            loopback: false,
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl EngineConfig {
    pub const MAX_QUEUE_SIZE_LIMIT: u64 = 1_000_000;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_queue_size == 0 || self.max_queue_size > Self::MAX_QUEUE_SIZE_LIMIT {
            bail!("max queue size must be between 1 and {}, was {}", Self::MAX_QUEUE_SIZE_LIMIT, self.max_queue_size);
        }
        if self.re_req_max_gap == 0 {
            bail!("maximum resend gap must be positive");
        }
        if self.re_req_max_gap as u64 > self.max_queue_size {
            bail!("maximum resend gap {} exceeds max queue size {}", self.re_req_max_gap, self.max_queue_size);
        }
        if self.login_timeout.is_zero() || self.re_req_interval.is_zero() || self.ack_interval.is_zero() || self.heartbeat_interval.is_zero() {
            bail!("timeouts and intervals must be positive");
        }
        if self.timeout == 0 {
            bail!("heartbeat timeout must be at least one tick");
        }
        if self.n_accepts == 0 {
            bail!("number of accepts must be positive");
        }
        if self.ttl > 255 {
            bail!("multicast TTL must not exceed 255, was {}", self.ttl);
        }
        Ok(())
    }
}

/// The contents of a configuration file: engine settings plus the channels it serves
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub channels: Vec<ChannelDescriptor>,
}

impl ConfigFile {
    pub fn from_toml_str(s: &str) -> anyhow::Result<ConfigFile> {
        let result: ConfigFile = toml::from_str(s)?;
        result.validate()?;
        Ok(result)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<ConfigFile> {
        let s = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&s)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.engine.validate()?;

        let mut ids = FxHashSet::default();
        for channel in &self.channels {
            channel.validate()?;
            if !ids.insert(&channel.id) {
                bail!("duplicate channel id {}", channel.id);
            }
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
