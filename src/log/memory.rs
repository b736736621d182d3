// In-Memory Ordered Log
// Process-local, gapless, totally-ordered log used by the demo binary and tests

use crate::identity::{PublicKey, Signature, Signer};
use crate::log::{LogError, LogEvent, LogPosition, OrderedLog, StartFrom, SubscriptionHandle, TopicId};
use crate::spend::DEFAULT_MAX_MESSAGE_SIZE;
use async_trait::async_trait;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Subscriber {
    queue: mpsc::UnboundedSender<LogEvent>,
    token: CancellationToken,
}

struct Topic {
    memo: String,
    submit_key: Option<PublicKey>,
    messages: Vec<Vec<u8>>,
    subscribers: Vec<Subscriber>,
}

impl Topic {
    fn new(memo: &str, submit_key: Option<PublicKey>) -> Self {
        Self {
            memo: memo.to_string(),
            submit_key,
            messages: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    fn broadcast(&mut self, event: LogEvent) {
        self.subscribers
            .retain(|s| !s.token.is_cancelled() && s.queue.send(event.clone()).is_ok());
    }
}

#[derive(Default)]
struct LogState {
    topics: HashMap<TopicId, Topic>,
    next_topic_num: u64,
}

/// In-process consensus log.
///
/// Positions start at 1 for every topic. Every subscriber sees messages in
/// exactly the order they were accepted; the backlog for `StartFrom::After`
/// is queued under the same lock as registration, so nothing is skipped or
/// delivered twice between backlog and live traffic.
pub struct InMemoryLog {
    state: Mutex<LogState>,
    max_message_size: usize,
    fail_next_publish: AtomicBool,
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState {
                topics: HashMap::new(),
                next_topic_num: 1000,
            }),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            fail_next_publish: AtomicBool::new(false),
        }
    }

    /// Set the largest payload the log accepts
    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a topic under a caller-chosen id. An existing topic is never replaced.
    pub fn create_topic_with_id(
        &self,
        topic: TopicId,
        memo: &str,
        submit_key: Option<PublicKey>,
    ) -> Result<(), LogError> {
        match self.state().topics.entry(topic) {
            Entry::Occupied(_) => Err(LogError::TopicExists(topic)),
            Entry::Vacant(slot) => {
                slot.insert(Topic::new(memo, submit_key));
                Ok(())
            }
        }
    }

    /// Reject the next publish with a transport failure
    pub fn fail_next_publish(&self) {
        self.fail_next_publish.store(true, Ordering::SeqCst);
    }

    /// Push a transport error to every live subscriber of a topic
    pub fn inject_transport_error(&self, topic: TopicId, reason: &str) {
        if let Some(t) = self.state().topics.get_mut(&topic) {
            t.broadcast(LogEvent::TransportError(LogError::Transport(reason.to_string())));
        }
    }

    /// Sever every subscription on a topic, as a dropped connection would
    pub fn drop_subscribers(&self, topic: TopicId) {
        if let Some(t) = self.state().topics.get_mut(&topic) {
            for subscriber in t.subscribers.drain(..) {
                subscriber.token.cancel();
            }
        }
    }

    /// Number of messages accepted on a topic
    pub fn message_count(&self, topic: TopicId) -> usize {
        self.state()
            .topics
            .get(&topic)
            .map(|t| t.messages.len())
            .unwrap_or(0)
    }

    /// Number of live subscriptions on a topic
    pub fn subscriber_count(&self, topic: TopicId) -> usize {
        self.state()
            .topics
            .get(&topic)
            .map(|t| t.subscribers.iter().filter(|s| !s.token.is_cancelled()).count())
            .unwrap_or(0)
    }

    /// Memo the topic was created with
    pub fn topic_memo(&self, topic: TopicId) -> Option<String> {
        self.state().topics.get(&topic).map(|t| t.memo.clone())
    }
}

#[async_trait]
impl OrderedLog for InMemoryLog {
    async fn create_topic(
        &self,
        memo: &str,
        submit_key: Option<PublicKey>,
    ) -> Result<TopicId, LogError> {
        let mut state = self.state();
        // Skip ids already taken through `create_topic_with_id`
        let topic = loop {
            state.next_topic_num += 1;
            let candidate = TopicId::from_num(state.next_topic_num);
            if !state.topics.contains_key(&candidate) {
                break candidate;
            }
        };
        state.topics.insert(topic, Topic::new(memo, submit_key));
        Ok(topic)
    }

    async fn publish(
        &self,
        topic: TopicId,
        payload: Vec<u8>,
        submit_signature: Option<Signature>,
    ) -> Result<LogPosition, LogError> {
        if self.fail_next_publish.swap(false, Ordering::SeqCst) {
            return Err(LogError::PublishRejected("injected failure".to_string()));
        }

        if payload.len() > self.max_message_size {
            return Err(LogError::MessageTooLarge {
                size: payload.len(),
                limit: self.max_message_size,
            });
        }

        let mut state = self.state();
        let t = state
            .topics
            .get_mut(&topic)
            .ok_or(LogError::TopicNotFound(topic))?;

        if let Some(key) = &t.submit_key {
            let authorized = submit_signature
                .as_ref()
                .map(|sig| Signer::verify(key, &payload, sig))
                .unwrap_or(false);
            if !authorized {
                return Err(LogError::Unauthorized(topic));
            }
        }

        t.messages.push(payload.clone());
        let position = LogPosition::new(t.messages.len() as u64);
        t.broadcast(LogEvent::Message { position, payload });

        Ok(position)
    }

    async fn subscribe(
        &self,
        topic: TopicId,
        start: StartFrom,
        sink: mpsc::Sender<LogEvent>,
    ) -> Result<SubscriptionHandle, LogError> {
        let token = CancellationToken::new();
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<LogEvent>();

        let delivers_after = {
            let mut state = self.state();
            let t = state
                .topics
                .get_mut(&topic)
                .ok_or(LogError::TopicNotFound(topic))?;

            let delivers_after = match start {
                StartFrom::Now => LogPosition::new(t.messages.len() as u64),
                StartFrom::After(after) => {
                    let skip = usize::try_from(after.value()).unwrap_or(usize::MAX);
                    for (i, payload) in t.messages.iter().enumerate().skip(skip) {
                        let _ = queue_tx.send(LogEvent::Message {
                            position: LogPosition::new(i as u64 + 1),
                            payload: payload.clone(),
                        });
                    }
                    after
                }
            };

            t.subscribers.push(Subscriber {
                queue: queue_tx,
                token: token.clone(),
            });
            delivers_after
        };

        // Forwarder owns `sink`; when it exits the subscriber sees the stream end
        let forward_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = forward_token.cancelled() => break,
                    event = queue_rx.recv() => match event {
                        Some(event) => {
                            if sink.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(SubscriptionHandle::new(token, delivers_after))
    }
}
