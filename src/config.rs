//! Configuration using Figment
//!
//! A [`CommConfig`] describes one instrument endpoint and how to talk to it.
//! Values are layered, later sources winning:
//! 1. built-in defaults (an echoing mock target, so the CLI runs without a file)
//! 2. a TOML file (`labcomm.toml` by default)
//! 3. environment variables prefixed with `LABCOMM_`, nested keys split on `__`
//!
//! Durations are written the human way: `"250ms"`, `"3s"`, `"1m 30s"`.
//!
//! # Example
//!
//! ```toml
//! [logging]
//! level = "debug"
//!
//! [target]
//! kind = "tcp"
//! address = "192.168.1.40:8000"
//! connect_timeout = "2s"
//!
//! [pool]
//! max_size = 2
//! idle_timeout = "30s"
//!
//! [frame]
//! rx = "\n"
//! tx = "\n"
//!
//! [transaction]
//! deadline = "500ms"
//! max_tries = 3
//! accept_empty_reply = true
//! ```
//!
//! ```no_run
//! use labcomm::config::CommConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // LABCOMM_POOL__MAX_SIZE=4 overrides [pool] max_size
//! let config = CommConfig::load_from("config/labcomm.toml")?;
//! println!("pool size: {}", config.pool.max_size);
//! # Ok(())
//! # }
//! ```

use crate::dialer::BackoffPolicy;
use crate::error::{CommError, Result};
use crate::framed::{Terminators, DEFAULT_MAX_FRAME_LEN, DEFAULT_TERMINATOR};
use crate::logging::{parse_log_level, OutputFormat};
use crate::retry::{is_connection_reset, DEFAULT_MAX_TRIES};
use crate::transaction::{TransactionConfig, DEFAULT_DEADLINE};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use labcomm_pool::PoolConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "labcomm.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "LABCOMM_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Log output settings.
    pub logging: LoggingConfig,
    /// Instrument endpoint.
    pub target: TargetConfig,
    /// Connection pool sizing.
    pub pool: PoolSection,
    /// Frame terminators and limits.
    pub frame: FrameSection,
    /// Per-transaction behavior.
    pub transaction: TransactionSection,
    /// Connection backoff.
    pub dialer: BackoffPolicy,
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: OutputFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

/// Where the instrument is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TargetConfig {
    /// TCP endpoint, e.g. a terminal server port.
    Tcp {
        /// `host:port`
        address: String,
        /// Bound on a single connection attempt.
        #[serde(with = "humantime_serde", default = "default_connect_timeout")]
        connect_timeout: Duration,
    },
    /// Local serial port (requires the `serial` feature).
    Serial {
        /// Device path, e.g. `/dev/ttyUSB0`.
        path: String,
        /// Line speed.
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// In-memory echo link, for trying things out.
    #[default]
    Mock,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_baud_rate() -> u32 {
    9600
}

/// Connection pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Maximum connections alive at once.
    pub max_size: usize,
    /// Idle time before unused connections are closed.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for PoolSection {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            max_size: pool.max_size,
            idle_timeout: pool.idle_timeout,
        }
    }
}

/// Frame terminators and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSection {
    /// Receive terminator, a single byte such as `"\r"` or `13`.
    #[serde(with = "single_byte")]
    pub rx: u8,
    /// Transmit terminator.
    #[serde(with = "single_byte")]
    pub tx: u8,
    /// Largest reply accepted.
    pub max_frame_len: usize,
}

impl Default for FrameSection {
    fn default() -> Self {
        Self {
            rx: DEFAULT_TERMINATOR,
            tx: DEFAULT_TERMINATOR,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Per-transaction behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionSection {
    /// Deadline for each individual read or write.
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
    /// Attempts per phase.
    pub max_tries: u32,
    /// Accept a silent close as a successful reply.
    pub accept_empty_reply: bool,
}

impl Default for TransactionSection {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            max_tries: DEFAULT_MAX_TRIES,
            accept_empty_reply: false,
        }
    }
}

/// Terminators are written as one-character ASCII strings (`"\r"`) or as
/// byte values (`13`). Non-ASCII bytes serialize as integers.
mod single_byte {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Terminator {
        Byte(u8),
        Text(String),
    }

    pub fn serialize<S: Serializer>(byte: &u8, serializer: S) -> Result<S::Ok, S::Error> {
        if byte.is_ascii() {
            serializer.serialize_str(&char::from(*byte).to_string())
        } else {
            serializer.serialize_u8(*byte)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
        match Terminator::deserialize(deserializer)? {
            Terminator::Byte(byte) => Ok(byte),
            Terminator::Text(s) => match s.as_bytes() {
                [byte] => Ok(*byte),
                _ => Err(de::Error::custom(format!(
                    "terminator must be a single ASCII character or a byte value, got {:?}",
                    s
                ))),
            },
        }
    }
}

impl CommConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The layered provider, for callers that want to add their own sources.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Reject values that would make the transport unusable.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CommError::InvalidConfig(msg));

        parse_log_level(&self.logging.level).map_err(CommError::InvalidConfig)?;

        match &self.target {
            TargetConfig::Tcp { address, .. } if address.is_empty() => {
                return invalid("target.address must not be empty".to_string());
            }
            TargetConfig::Serial { path, .. } if path.is_empty() => {
                return invalid("target.path must not be empty".to_string());
            }
            TargetConfig::Serial { baud_rate: 0, .. } => {
                return invalid("target.baud_rate must be positive".to_string());
            }
            _ => {}
        }

        if self.pool.max_size == 0 {
            return invalid("pool.max_size must be at least 1".to_string());
        }
        if self.pool.idle_timeout.is_zero() {
            return invalid("pool.idle_timeout must be positive".to_string());
        }
        if self.frame.max_frame_len == 0 {
            return invalid("frame.max_frame_len must be positive".to_string());
        }
        if self.transaction.deadline.is_zero() {
            return invalid("transaction.deadline must be positive".to_string());
        }
        if self.transaction.max_tries == 0 {
            return invalid("transaction.max_tries must be at least 1".to_string());
        }
        if !self.dialer.multiplier.is_finite() || self.dialer.multiplier < 1.0 {
            return invalid(format!(
                "dialer.multiplier must be finite and at least 1.0, got {}",
                self.dialer.multiplier
            ));
        }
        if self.dialer.initial_interval.is_zero() {
            return invalid("dialer.initial_interval must be positive".to_string());
        }

        Ok(())
    }

    /// Pool settings.
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool.max_size,
            idle_timeout: self.pool.idle_timeout,
        }
    }

    /// Transaction settings, with the default reset predicate.
    #[must_use]
    pub fn transaction_config(&self) -> TransactionConfig {
        TransactionConfig {
            terminators: Terminators {
                rx: self.frame.rx,
                tx: self.frame.tx,
            },
            deadline: self.transaction.deadline,
            max_tries: self.transaction.max_tries,
            accept_empty_reply: self.transaction.accept_empty_reply,
            max_frame_len: self.frame.max_frame_len,
            is_transient: is_connection_reset,
        }
    }
}
