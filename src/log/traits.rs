// Ordered Log Traits and Core Types
// Defines the abstract OrderedLog trait and the types exchanged with any consensus log

use crate::identity::{PublicKey, Signature};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ============================================================================
// LOG POSITION
// ============================================================================

/// Sequence number the log assigns to an accepted message. Gapless and strictly increasing per topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition(u64);

impl LogPosition {
    /// Before the first message of a topic; positions start at 1
    pub const ORIGIN: LogPosition = LogPosition(0);

    pub const fn new(position: u64) -> Self {
        Self(position)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// The position immediately after this one
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// TOPIC ID
// ============================================================================

/// Identifier of a topic on the consensus log, written `shard.realm.num`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicId {
    pub shard: u64,
    pub realm: u64,
    pub num: u64,
}

impl TopicId {
    pub fn new(shard: u64, realm: u64, num: u64) -> Self {
        Self { shard, realm, num }
    }

    /// Topic in shard 0, realm 0
    pub fn from_num(num: u64) -> Self {
        Self::new(0, 0, num)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.shard, self.realm, self.num)
    }
}

impl FromStr for TopicId {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        let parse = |p: &str| {
            p.parse::<u64>()
                .map_err(|_| LogError::InvalidTopicId(s.to_string()))
        };

        match parts.as_slice() {
            [num] => Ok(Self::from_num(parse(num)?)),
            [shard, realm, num] => Ok(Self::new(parse(shard)?, parse(realm)?, parse(num)?)),
            _ => Err(LogError::InvalidTopicId(s.to_string())),
        }
    }
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Where a new subscription begins reading
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartFrom {
    /// Only messages accepted after the subscription is established
    Now,
    /// Every message with a position strictly greater than the given one
    After(LogPosition),
}

/// Item delivered to a subscriber, in log order
#[derive(Clone, Debug)]
pub enum LogEvent {
    /// A message accepted by the log
    Message {
        position: LogPosition,
        payload: Vec<u8>,
    },
    /// A transport-level problem; the subscription stays open
    TransportError(LogError),
}

/// Keeps a subscription alive. Dropping it stops delivery.
#[derive(Debug)]
pub struct SubscriptionHandle {
    token: CancellationToken,
    delivers_after: LogPosition,
}

impl SubscriptionHandle {
    /// `delivers_after` is the last position NOT delivered: every message
    /// above it reaches the subscriber, none at or below it does.
    pub fn new(token: CancellationToken, delivers_after: LogPosition) -> Self {
        Self {
            token,
            delivers_after,
        }
    }

    /// Position the subscription was anchored at when established.
    /// For `StartFrom::Now` this is the head of the topic at that moment.
    pub fn delivers_after(&self) -> LogPosition {
        self.delivers_after
    }

    /// Stop delivery to this subscription
    pub fn unsubscribe(self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// ============================================================================
// LOG ERROR
// ============================================================================

/// Errors from the consensus log client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("Topic not found: {0}")]
    TopicNotFound(TopicId),

    #[error("Topic already exists: {0}")]
    TopicExists(TopicId),

    #[error("Invalid topic id: {0}")]
    InvalidTopicId(String),

    #[error("Publish rejected: {0}")]
    PublishRejected(String),

    #[error("Submit key signature missing or invalid for topic {0}")]
    Unauthorized(TopicId),

    #[error("Message of {size} bytes exceeds log limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Transport error: {0}")]
    Transport(String),
}

// ============================================================================
// ORDERED LOG TRAIT
// ============================================================================

/// Client of an external append-only log that assigns every message a total order
#[async_trait]
pub trait OrderedLog: Send + Sync {
    /// Create a topic, optionally guarded by a submit key
    async fn create_topic(
        &self,
        memo: &str,
        submit_key: Option<PublicKey>,
    ) -> Result<TopicId, LogError>;

    /// Append a message and return the position the log assigned to it
    async fn publish(
        &self,
        topic: TopicId,
        payload: Vec<u8>,
        submit_signature: Option<Signature>,
    ) -> Result<LogPosition, LogError>;

    /// Deliver messages (and transport errors) to `sink` in log order.
    /// The returned handle reports the position delivery starts after, so a
    /// caller can resubscribe from exactly there even if nothing arrived.
    /// The stream ends when the subscription is lost; the caller resubscribes.
    async fn subscribe(
        &self,
        topic: TopicId,
        start: StartFrom,
        sink: mpsc::Sender<LogEvent>,
    ) -> Result<SubscriptionHandle, LogError>;
}
