//! Partitioned message bus port and its in-process implementation.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use frontdesk_core::domain::envelope::Envelope;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus subscribe failed: {0}")]
    Subscribe(String),
    #[error("bus receive failed: {0}")]
    Receive(String),
    #[error("bus publish failed: {0}")]
    Publish(String),
}

/// At-least-once delivery; order holds only within one partition.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BusError>;

    /// One consumer per partition of `topic`.
    async fn subscribe(&self, topic: &str) -> Result<Vec<Box<dyn PartitionConsumer>>, BusError>;
}

#[async_trait]
pub trait PartitionConsumer: Send {
    fn partition(&self) -> u32;

    /// `Ok(None)` once the partition is closed.
    async fn next_envelope(&mut self) -> Result<Option<Envelope>, BusError>;
}

pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(partitions.max(1))) as u32
}

struct TopicState {
    senders: Vec<mpsc::UnboundedSender<Envelope>>,
    receivers: Vec<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl TopicState {
    fn new(partitions: u32) -> Self {
        let (senders, receivers) = (0..partitions.max(1))
            .map(|_| {
                let (sender, receiver) = mpsc::unbounded_channel();
                (sender, Some(receiver))
            })
            .unzip();
        Self { senders, receivers }
    }
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, TopicState>,
    published: Option<Vec<(String, Envelope)>>,
}

/// Channel-backed bus for a single process. Each topic supports one subscriber
/// group; `close` ends every partition stream of a topic.
///
/// A topic buffers only once it is declared or subscribed. Envelopes published to a
/// topic nobody listens on are dropped.
#[derive(Clone)]
pub struct InMemoryBus {
    partitions: u32,
    state: Arc<Mutex<BusState>>,
}

impl InMemoryBus {
    pub fn new(partitions: u32) -> Self {
        Self { partitions: partitions.max(1), state: Arc::new(Mutex::new(BusState::default())) }
    }

    /// Like `new`, but also keeps a copy of every published envelope for `published`.
    pub fn recording(partitions: u32) -> Self {
        let state = BusState { published: Some(Vec::new()), ..BusState::default() };
        Self { partitions: partitions.max(1), state: Arc::new(Mutex::new(state)) }
    }

    /// Creates the topic's partitions so publishes queue until the subscriber arrives.
    pub fn declare(&self, topic: &str) {
        let partitions = self.partitions;
        self.with_state(|state| {
            state.topics.entry(topic.to_owned()).or_insert_with(|| TopicState::new(partitions));
        });
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Every envelope published to `topic`, in publish order. Empty unless the bus
    /// was built with `recording`.
    pub fn published(&self, topic: &str) -> Vec<Envelope> {
        self.with_state(|state| {
            state
                .published
                .iter()
                .flatten()
                .filter(|(published_topic, _)| published_topic == topic)
                .map(|(_, envelope)| envelope.clone())
                .collect()
        })
    }

    pub fn close(&self, topic: &str) {
        self.with_state(|state| {
            if let Some(topic_state) = state.topics.get_mut(topic) {
                topic_state.senders.clear();
            }
        });
    }

    fn with_state<T>(&self, apply: impl FnOnce(&mut BusState) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => apply(&mut state),
            Err(poisoned) => apply(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BusError> {
        let partitions = self.partitions;
        self.with_state(|state| {
            if let Some(published) = state.published.as_mut() {
                published.push((topic.to_owned(), envelope.clone()));
            }
            let Some(topic_state) = state.topics.get_mut(topic) else {
                debug!(
                    event_name = "egress.bus.unrouted",
                    topic,
                    message_id = %envelope.message_id.as_str(),
                    "no subscriber for topic, envelope dropped"
                );
                return Ok(());
            };
            if topic_state.senders.is_empty() {
                return Err(BusError::Publish(format!("topic `{topic}` is closed")));
            }
            let partition = partition_for(&envelope.partition_key(), partitions) as usize;
            topic_state.senders[partition].send(envelope.clone()).map_err(|_| {
                BusError::Publish(format!("partition {partition} of `{topic}` dropped"))
            })
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<Vec<Box<dyn PartitionConsumer>>, BusError> {
        let partitions = self.partitions;
        self.with_state(|state| {
            let topic_state =
                state.topics.entry(topic.to_owned()).or_insert_with(|| TopicState::new(partitions));
            let receivers: Vec<_> = topic_state.receivers.iter_mut().map(Option::take).collect();
            if receivers.iter().any(Option::is_none) {
                return Err(BusError::Subscribe(format!(
                    "topic `{topic}` already has a subscriber"
                )));
            }
            Ok(receivers
                .into_iter()
                .flatten()
                .enumerate()
                .map(|(partition, receiver)| {
                    Box::new(ChannelConsumer { partition: partition as u32, receiver })
                        as Box<dyn PartitionConsumer>
                })
                .collect())
        })
    }
}

struct ChannelConsumer {
    partition: u32,
    receiver: mpsc::UnboundedReceiver<Envelope>,
}

#[async_trait]
impl PartitionConsumer for ChannelConsumer {
    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next_envelope(&mut self) -> Result<Option<Envelope>, BusError> {
        Ok(self.receiver.recv().await)
    }
}
