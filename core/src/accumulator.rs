use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{BridgeError, SourceError};
use crate::record::{OutputRecord, ValueFormat};
use crate::source::BrokerConnection;
use crate::subscription::SubscriptionManager;
use crate::telemetry::TaskMetrics;
use crate::topic::NamingPolicy;

/// Drains live subscriptions into bounded batches of output records.
#[derive(Debug)]
pub struct BatchAccumulator {
    naming_policy: NamingPolicy,
    value_format: ValueFormat,
    collisions: NameCollisions,
    /// Unrecoverable error held back so the records already gathered are not lost.
    deferred_error: Option<SourceError>,
    metrics: TaskMetrics,
}

impl BatchAccumulator {
    pub fn new(naming_policy: NamingPolicy, value_format: ValueFormat) -> Self {
        Self {
            naming_policy,
            value_format,
            collisions: NameCollisions::default(),
            deferred_error: None,
            metrics: TaskMetrics::default(),
        }
    }

    /// Collects up to `max_messages` records.
    ///
    /// Stops early when a receive waits `max_wait` without a message or when
    /// `shutdown` is cancelled, so the batch may be empty. Messages that cannot
    /// be converted are logged, acknowledged and left out of the batch. An
    /// unrecoverable consumer error is returned immediately when the batch is
    /// still empty, otherwise on the next call.
    pub async fn drain<N: BrokerConnection>(
        &mut self,
        manager: &mut SubscriptionManager<N>,
        max_messages: usize,
        max_wait: Duration,
        shutdown: &CancellationToken,
    ) -> Result<Vec<OutputRecord>, BridgeError> {
        if let Some(e) = self.deferred_error.take() {
            return Err(e.into());
        }

        manager.begin_cycle();
        let mut batch = Vec::with_capacity(max_messages.min(1024));

        while batch.len() < max_messages {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested, ending batch early");
                    break;
                }
                received = manager.receive(max_wait) => received,
            };

            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    self.metrics.receive_errors += manager.take_transient_errors() + 1;
                    if batch.is_empty() {
                        return Err(e.into());
                    }
                    warn!(error = %e, "Consumer failed mid-batch, returning partial batch");
                    self.deferred_error = Some(e);
                    break;
                }
            };

            match OutputRecord::from_raw(&delivery.message, self.naming_policy, self.value_format) {
                Ok(record) => {
                    if self.naming_policy == NamingPolicy::NameOnly
                        && self.collisions.observe(&record.topic, &record.source_partition)
                    {
                        self.metrics.naming_collisions += 1;
                    }
                    batch.push(record);
                }
                Err(e) => {
                    warn!(
                        topic = %delivery.message.topic,
                        id = %delivery.message.message_id,
                        error = %e,
                        "Skipping message that could not be converted"
                    );
                    self.metrics.messages_skipped += 1;
                }
            }

            if let Err(e) = manager.acknowledge(&delivery).await {
                warn!(
                    topic = %delivery.message.topic,
                    id = %delivery.message.message_id,
                    error = %e,
                    "Failed to acknowledge message"
                );
                self.metrics.ack_failures += 1;
            }
        }

        self.metrics.receive_errors += manager.take_transient_errors();
        self.metrics.record_batch(batch.len());
        if !batch.is_empty() {
            info!("Consumed batch of {} messages", batch.len());
        }

        Ok(batch)
    }

    pub fn metrics(&self) -> &TaskMetrics {
        &self.metrics
    }
}

/// Tracks which qualified topic first produced each `NameOnly` record topic.
#[derive(Debug, Default)]
struct NameCollisions {
    owners: HashMap<String, String>,
    reported: HashSet<(String, String)>,
}

impl NameCollisions {
    /// Returns true the first time `qualified` is seen sharing `name` with another topic.
    fn observe(&mut self, name: &str, qualified: &str) -> bool {
        let owner = self
            .owners
            .entry(name.to_string())
            .or_insert_with(|| qualified.to_string());
        if owner == qualified {
            return false;
        }

        let pair = (owner.clone(), qualified.to_string());
        if !self.reported.insert(pair) {
            return false;
        }
        warn!(
            name,
            first = %owner,
            other = qualified,
            "Distinct topics resolve to the same record topic under NameOnly naming"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::{MemoryBroker, MemoryConnection, MemoryMessage, ReceiveFault};
    use crate::source::{BrokerConnector, InitialPosition, SubscribeOptions, SubscriptionTarget};

    const WAIT: Duration = Duration::from_millis(20);

    async fn manager(broker: &MemoryBroker, topics: &[&str]) -> SubscriptionManager<MemoryConnection> {
        let connection = broker.connect("memory://local", None).await.unwrap();
        let options = SubscribeOptions {
            subscription_name: "sub".to_string(),
            consumer_name: "consumer".to_string(),
            initial_position: InitialPosition::Earliest,
        };
        let target = SubscriptionTarget::NamedSet(topics.iter().map(|t| t.to_string()).collect());
        let mut manager = SubscriptionManager::new();
        manager.start(connection, &[target], &options).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_batch_is_capped() {
        let broker = MemoryBroker::new();
        for i in 0..7 {
            broker.publish("orders", format!("{i}"));
        }
        let mut manager = manager(&broker, &["orders"]).await;
        let mut accumulator = BatchAccumulator::new(NamingPolicy::NameOnly, ValueFormat::Bytes);
        let token = CancellationToken::new();

        let batch = accumulator.drain(&mut manager, 5, WAIT, &token).await.unwrap();
        assert_eq!(batch.len(), 5);
        let batch = accumulator.drain(&mut manager, 5, WAIT, &token).await.unwrap();
        assert_eq!(batch.len(), 2);
        let batch = accumulator.drain(&mut manager, 5, WAIT, &token).await.unwrap();
        assert!(batch.is_empty());

        let metrics = accumulator.metrics();
        assert_eq!(metrics.records_polled, 7);
        assert_eq!(metrics.batches_processed, 3);
        assert_eq!(metrics.empty_batches, 1);
        assert_eq!(broker.acknowledged("orders"), 7);
    }

    #[tokio::test]
    async fn test_malformed_messages_are_skipped() {
        let broker = MemoryBroker::new();
        broker.publish("orders", r#"{"id": 1}"#);
        broker.publish("orders", "not json");
        broker.publish("orders", r#"{"id": 2}"#);
        let mut manager = manager(&broker, &["orders"]).await;
        let mut accumulator = BatchAccumulator::new(NamingPolicy::NameOnly, ValueFormat::Json);

        let batch = accumulator
            .drain(&mut manager, 10, WAIT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(accumulator.metrics().messages_skipped, 1);
        assert_eq!(broker.acknowledged("orders"), 3);
    }

    #[tokio::test]
    async fn test_cancelled_drain_returns_promptly() {
        let broker = MemoryBroker::new();
        let mut manager = manager(&broker, &["orders"]).await;
        let mut accumulator = BatchAccumulator::new(NamingPolicy::NameOnly, ValueFormat::Bytes);
        let token = CancellationToken::new();
        token.cancel();

        let started = tokio::time::Instant::now();
        let batch = accumulator
            .drain(&mut manager, 10, Duration::from_secs(30), &token)
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_transient_errors_degrade_the_batch() {
        let broker = MemoryBroker::new();
        broker.publish("a", "a0");
        broker.publish("b", "b0");
        broker.inject_receive_error("a", ReceiveFault::Transient);
        let mut manager = manager(&broker, &["a", "b"]).await;
        let mut accumulator = BatchAccumulator::new(NamingPolicy::NameOnly, ValueFormat::Bytes);
        let token = CancellationToken::new();

        let batch = accumulator.drain(&mut manager, 10, WAIT, &token).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].topic, "b");
        assert_eq!(accumulator.metrics().receive_errors, 1);

        let batch = accumulator.drain(&mut manager, 10, WAIT, &token).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].topic, "a");
    }

    #[tokio::test]
    async fn test_unrecoverable_error_after_records_is_deferred() {
        let broker = MemoryBroker::new();
        broker.publish("a", "a0");
        let mut manager = manager(&broker, &["a", "b"]).await;
        let mut accumulator = BatchAccumulator::new(NamingPolicy::NameOnly, ValueFormat::Bytes);
        let token = CancellationToken::new();

        // Rotation starts at `a`, so a0 comes first and the next receive starts at `b`.
        broker.inject_receive_error("b", ReceiveFault::Unrecoverable);
        let batch = accumulator.drain(&mut manager, 10, WAIT, &token).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].topic, "a");
        assert_eq!(broker.acknowledged("a"), 1);

        let err = accumulator.drain(&mut manager, 10, WAIT, &token).await.unwrap_err();
        assert!(matches!(err, BridgeError::Source(SourceError::Unrecoverable(_))));
        assert!(accumulator.drain(&mut manager, 10, WAIT, &token).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_failure_keeps_the_record() {
        let broker = MemoryBroker::new();
        for i in 0..3 {
            broker.publish("orders", format!("{i}"));
        }
        broker.inject_ack_error("orders");
        let mut manager = manager(&broker, &["orders"]).await;
        let mut accumulator = BatchAccumulator::new(NamingPolicy::NameOnly, ValueFormat::Bytes);

        let batch = accumulator
            .drain(&mut manager, 10, WAIT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(accumulator.metrics().ack_failures, 1);
        assert_eq!(accumulator.metrics().records_polled, 3);
        assert_eq!(broker.acknowledged("orders"), 2);
    }

    #[tokio::test]
    async fn test_name_only_collisions_are_flagged_not_merged() {
        let broker = MemoryBroker::new();
        broker.publish_message("persistent://acme/eu/orders", MemoryMessage::new("eu"));
        broker.publish_message("persistent://acme/us/orders", MemoryMessage::new("us"));
        broker.publish_message("persistent://acme/us/orders", MemoryMessage::new("us2"));
        let mut manager = manager(
            &broker,
            &["persistent://acme/eu/orders", "persistent://acme/us/orders"],
        )
        .await;
        let mut accumulator = BatchAccumulator::new(NamingPolicy::NameOnly, ValueFormat::Bytes);

        let batch = accumulator
            .drain(&mut manager, 10, WAIT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|record| record.topic == "orders"));
        let sources: HashSet<&str> = batch.iter().map(|r| r.source_partition.as_str()).collect();
        assert_eq!(sources.len(), 2);
        assert_eq!(accumulator.metrics().naming_collisions, 1);
    }

    #[test]
    fn test_name_collisions_reported_once_per_pair() {
        let mut collisions = NameCollisions::default();
        assert!(!collisions.observe("orders", "persistent://a/x/orders"));
        assert!(!collisions.observe("orders", "persistent://a/x/orders"));
        assert!(collisions.observe("orders", "persistent://a/y/orders"));
        assert!(!collisions.observe("orders", "persistent://a/y/orders"));
        assert!(collisions.observe("orders", "persistent://a/z/orders"));
    }
}
