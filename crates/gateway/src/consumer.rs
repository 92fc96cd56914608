//! Long-running bus subscriber: one task per partition, cooperative shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use frontdesk_core::config::GatewayConfig;
use frontdesk_core::dedup::DedupStore;

use crate::bus::{MessageBus, PartitionConsumer};
use crate::events::{EnvelopeDispatcher, HandlerOutcome};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribePolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for SubscribePolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 500, max_delay_ms: 10_000 }
    }
}

impl SubscribePolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_retries: config.subscribe_max_retries,
            base_delay_ms: config.subscribe_backoff_ms,
            ..Self::default()
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionReport {
    pub partition: u32,
    pub responded: usize,
    pub duplicates: usize,
    pub ignored: usize,
    pub failed: usize,
    pub receive_errors: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub subscribed: bool,
    pub partitions: Vec<PartitionReport>,
}

impl ConsumerReport {
    pub fn responded(&self) -> usize {
        self.partitions.iter().map(|partition| partition.responded).sum()
    }

    pub fn duplicates(&self) -> usize {
        self.partitions.iter().map(|partition| partition.duplicates).sum()
    }

    pub fn failed(&self) -> usize {
        self.partitions.iter().map(|partition| partition.failed).sum()
    }
}

pub struct GatewayConsumer {
    bus: Arc<dyn MessageBus>,
    dispatcher: Arc<EnvelopeDispatcher>,
    topic: String,
    policy: SubscribePolicy,
}

impl GatewayConsumer {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        dispatcher: Arc<EnvelopeDispatcher>,
        topic: impl Into<String>,
        policy: SubscribePolicy,
    ) -> Self {
        Self { bus, dispatcher, topic: topic.into(), policy }
    }

    /// Runs until every partition closes or `shutdown` flips to `true`.
    ///
    /// Subscription failures are retried with backoff; once retries are exhausted the
    /// consumer returns an unsubscribed report instead of failing the process.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> ConsumerReport {
        let Some(consumers) = self.subscribe_with_retry(shutdown.clone()).await else {
            return ConsumerReport::default();
        };

        info!(
            event_name = "ingress.bus.subscribed",
            topic = %self.topic,
            partitions = consumers.len(),
            "consuming inbound topic"
        );

        let mut tasks = JoinSet::new();
        for consumer in consumers {
            let dispatcher = self.dispatcher.clone();
            let policy = self.policy.clone();
            let topic = self.topic.clone();
            tasks.spawn(pump_partition(consumer, dispatcher, policy, topic, shutdown.clone()));
        }

        let mut report = ConsumerReport { subscribed: true, partitions: Vec::new() };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(partition) => report.partitions.push(partition),
                Err(error) => warn!(
                    event_name = "ingress.bus.partition_panicked",
                    topic = %self.topic,
                    error = %error,
                    "partition task ended abnormally"
                ),
            }
        }
        report.partitions.sort_by_key(|partition| partition.partition);

        info!(
            event_name = "ingress.bus.stopped",
            topic = %self.topic,
            responded = report.responded(),
            duplicates = report.duplicates(),
            failed = report.failed(),
            "consumer stopped"
        );
        report
    }

    async fn subscribe_with_retry(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<Vec<Box<dyn PartitionConsumer>>> {
        for attempt in 0..=self.policy.max_retries {
            if *shutdown.borrow() {
                return None;
            }
            match self.bus.subscribe(&self.topic).await {
                Ok(consumers) => return Some(consumers),
                Err(error) => {
                    warn!(
                        event_name = "ingress.bus.subscribe_failed",
                        topic = %self.topic,
                        attempt,
                        max_retries = self.policy.max_retries,
                        error = %error,
                        "bus subscription failed"
                    );
                    if attempt >= self.policy.max_retries {
                        warn!(
                            topic = %self.topic,
                            max_retries = self.policy.max_retries,
                            "subscribe retries exhausted; continuing process without consumer"
                        );
                        return None;
                    }
                    let delay = self.policy.backoff(attempt);
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => return None,
                        }
                    }
                }
            }
        }
        None
    }
}

async fn pump_partition(
    mut consumer: Box<dyn PartitionConsumer>,
    dispatcher: Arc<EnvelopeDispatcher>,
    policy: SubscribePolicy,
    topic: String,
    mut shutdown: watch::Receiver<bool>,
) -> PartitionReport {
    let mut report =
        PartitionReport { partition: consumer.partition(), ..PartitionReport::default() };
    let mut consecutive_errors = 0_u32;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            next = consumer.next_envelope() => next,
            _ = shutdown.changed() => break,
        };

        let envelope = match next {
            Ok(Some(envelope)) => {
                consecutive_errors = 0;
                envelope
            }
            Ok(None) => {
                info!(topic = %topic, partition = report.partition, "partition stream closed");
                break;
            }
            Err(error) => {
                report.receive_errors += 1;
                warn!(
                    event_name = "ingress.bus.receive_failed",
                    topic = %topic,
                    partition = report.partition,
                    attempt = consecutive_errors,
                    error = %error,
                    "bus receive failed"
                );
                if consecutive_errors >= policy.max_retries {
                    warn!(
                        topic = %topic,
                        partition = report.partition,
                        "receive retries exhausted; abandoning partition"
                    );
                    break;
                }
                let delay = policy.backoff(consecutive_errors);
                consecutive_errors += 1;
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                continue;
            }
        };

        debug!(
            event_name = "ingress.bus.envelope_received",
            topic = %topic,
            partition = report.partition,
            tenant_id = %envelope.tenant_id,
            session_id = %envelope.session_id,
            message_id = %envelope.message_id.as_str(),
            envelope_type = envelope.envelope_type.as_str(),
            "received envelope"
        );

        match dispatcher.dispatch(&envelope).await {
            Ok(HandlerOutcome::Responded(_)) => report.responded += 1,
            Ok(HandlerOutcome::Duplicate) => report.duplicates += 1,
            Ok(HandlerOutcome::Ignored) => report.ignored += 1,
            Err(error) => {
                report.failed += 1;
                warn!(
                    event_name = "ingress.bus.dispatch_failed",
                    topic = %topic,
                    partition = report.partition,
                    tenant_id = %envelope.tenant_id,
                    message_id = %envelope.message_id.as_str(),
                    error = %error,
                    "envelope processing failed; continuing consumer loop"
                );
            }
        }
    }

    report
}

/// Evicts expired dedup entries every `interval` until shutdown.
pub fn spawn_dedup_sweeper(
    dedup: Arc<dyn DedupStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => match dedup.evict_expired().await {
                    Ok(0) => {}
                    Ok(evicted) => debug!(
                        event_name = "ingress.dedup.evicted",
                        evicted,
                        "expired dedup entries removed"
                    ),
                    Err(error) => warn!(
                        event_name = "ingress.dedup.evict_failed",
                        error = %error,
                        "dedup eviction failed"
                    ),
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}
