// Notary configuration - parsed and validated once at startup

use crate::identity::{Keypair, KeypairSigner};
use crate::log::TopicId;
use crate::notary::{BackoffPolicy, NotarySettings};
use crate::spend::{DEFAULT_MAX_MESSAGE_SIZE, HEADER_LEN};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// DER prefix some SDKs put in front of a raw Ed25519 seed
const ED25519_DER_PREFIX: &str = "302e020100300506032b657004220420";

/// Errors from loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Malformed config: {0}")]
    Parse(String),

    #[error("Invalid value for `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidField {
        field,
        reason: reason.into(),
    }
}

// ============================================================================
// ACCOUNT ID
// ============================================================================

/// Account paying for log submissions, written `shard.realm.num`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccountId {
    pub shard: u64,
    pub realm: u64,
    pub num: u64,
}

impl AccountId {
    pub fn from_num(num: u64) -> Self {
        Self {
            shard: 0,
            realm: 0,
            num,
        }
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.shard, self.realm, self.num)
    }
}

impl FromStr for AccountId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<u64> = s
            .trim()
            .split('.')
            .map(|p| p.parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|_| format!("`{}` is not of the form shard.realm.num", s))?;

        match parts.as_slice() {
            [num] => Ok(Self::from_num(*num)),
            [shard, realm, num] => Ok(Self {
                shard: *shard,
                realm: *realm,
                num: *num,
            }),
            _ => Err(format!("`{}` is not of the form shard.realm.num", s)),
        }
    }
}

/// Which public network the operator account lives on. A plain flag carried
/// for the log backend; this crate resolves no endpoints from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

// ============================================================================
// RAW FILE FORMAT
// ============================================================================

/// Ids may be written as `"0.0.1234"` or as a bare number
#[derive(Deserialize)]
#[serde(untagged)]
enum IdValue {
    Text(String),
    Number(u64),
}

impl IdValue {
    fn text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Number(n) => n.to_string(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_wait_timeout_secs() -> Option<u64> {
    Some(120)
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    account_id: IdValue,
    private_key: String,
    #[serde(default)]
    topic_id: Option<IdValue>,
    #[serde(default)]
    submit_key: Option<String>,
    #[serde(default)]
    testnet: bool,
    #[serde(default = "default_poll_interval_secs")]
    poll_interval_secs: u64,
    #[serde(default = "default_wait_timeout_secs")]
    wait_timeout_secs: Option<u64>,
    #[serde(default = "default_max_message_size")]
    max_message_size: usize,
    #[serde(default = "default_initial_backoff_ms")]
    reconnect_initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    reconnect_max_backoff_ms: u64,
}

fn parse_key(field: &'static str, text: &str) -> Result<Keypair, ConfigError> {
    let text = text.trim().to_ascii_lowercase();
    let seed = match text.len() {
        64 => text.as_str(),
        96 if text.starts_with(ED25519_DER_PREFIX) => &text[ED25519_DER_PREFIX.len()..],
        n => {
            return Err(invalid(
                field,
                format!("must be 64 hex characters (got {})", n),
            ))
        }
    };
    Keypair::from_hex(seed).map_err(|e| invalid(field, e.to_string()))
}

// ============================================================================
// NOTARY CONFIG
// ============================================================================

/// Validated notary configuration
#[derive(Clone, Debug)]
pub struct NotaryConfig {
    pub account_id: AccountId,
    pub operator_key: Keypair,
    pub topic_id: Option<TopicId>,
    pub submit_key: Option<Keypair>,
    pub network: Network,
    pub poll_interval: Duration,
    pub wait_timeout: Option<Duration>,
    pub max_message_size: usize,
    pub backoff: BackoffPolicy,
}

impl NotaryConfig {
    /// Config with defaults for everything but the account and its key
    pub fn new(account_id: AccountId, operator_key: Keypair) -> Self {
        Self {
            account_id,
            operator_key,
            topic_id: None,
            submit_key: None,
            network: Network::Mainnet,
            poll_interval: Duration::from_secs(default_poll_interval_secs()),
            wait_timeout: default_wait_timeout_secs().map(Duration::from_secs),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_topic(mut self, topic: TopicId) -> Self {
        self.topic_id = Some(topic);
        self
    }

    pub fn with_submit_key(mut self, key: Keypair) -> Self {
        self.submit_key = Some(key);
        self
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Read and validate a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&text)
    }

    /// Parse and validate JSON, failing on the first bad field
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let account_id = raw
            .account_id
            .text()
            .parse::<AccountId>()
            .map_err(|e| invalid("account_id", e))?;

        let operator_key = parse_key("private_key", &raw.private_key)?;

        let topic_id = raw
            .topic_id
            .map(|t| {
                t.text()
                    .parse::<TopicId>()
                    .map_err(|e| invalid("topic_id", e.to_string()))
            })
            .transpose()?;

        let submit_key = raw
            .submit_key
            .map(|k| parse_key("submit_key", &k))
            .transpose()?;

        let config = Self {
            account_id,
            operator_key,
            topic_id,
            submit_key,
            network: if raw.testnet {
                Network::Testnet
            } else {
                Network::Mainnet
            },
            poll_interval: Duration::from_secs(raw.poll_interval_secs),
            wait_timeout: raw.wait_timeout_secs.map(Duration::from_secs),
            max_message_size: raw.max_message_size,
            backoff: BackoffPolicy::new(
                Duration::from_millis(raw.reconnect_initial_backoff_ms),
                Duration::from_millis(raw.reconnect_max_backoff_ms),
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the numeric settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval_secs", "must be > 0"));
        }
        if self.wait_timeout.map(|t| t.is_zero()).unwrap_or(false) {
            return Err(invalid("wait_timeout_secs", "must be > 0, or null to wait forever"));
        }
        if self.max_message_size < HEADER_LEN {
            return Err(invalid(
                "max_message_size",
                format!("must be at least {} bytes", HEADER_LEN),
            ));
        }
        if self.backoff.initial.is_zero() {
            return Err(invalid("reconnect_initial_backoff_ms", "must be > 0"));
        }
        if self.backoff.max < self.backoff.initial {
            return Err(invalid(
                "reconnect_max_backoff_ms",
                "must be >= reconnect_initial_backoff_ms",
            ));
        }
        Ok(())
    }

    /// Runtime settings for the notary
    pub fn settings(&self) -> NotarySettings {
        let mut settings = NotarySettings::new()
            .with_poll_interval(self.poll_interval)
            .with_wait_timeout(self.wait_timeout)
            .with_max_message_size(self.max_message_size)
            .with_backoff(self.backoff);
        if let Some(topic) = self.topic_id {
            settings = settings.with_topic(topic);
        }
        if let Some(key) = &self.submit_key {
            settings = settings.with_submit_key(key.clone());
        }
        settings
    }

    /// Signer producing notary signatures with the operator key
    pub fn signer(&self) -> KeypairSigner {
        KeypairSigner::new(self.operator_key.clone())
    }
}
