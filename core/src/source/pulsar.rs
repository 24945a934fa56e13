//! Broker traits backed by an Apache Pulsar cluster.

use futures::StreamExt;
use pulsar::consumer::InitialPosition as PulsarInitialPosition;
use pulsar::proto::MessageIdData;
use pulsar::{Consumer, ConsumerOptions, Pulsar, SubType, TokioExecutor};
use regex::Regex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::SourceError;
use crate::source::{
    AckHandle, BrokerConnection, BrokerConnector, BrokerConsumer, InitialPosition, RawMessage,
    SubscribeOptions, TopicSelector,
};

const PULSAR_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_NAMESPACE: &str = "public/default";

/// A topic named explicitly and also matched by the pattern gets two
/// consumers on one subscription. Failover keeps one of them active per
/// topic, so each message is delivered once and in order.
const SUBSCRIPTION_TYPE: SubType = SubType::Failover;

type PulsarConsumer = Consumer<Vec<u8>, TokioExecutor>;

/// Connects to Pulsar with the tokio executor.
#[derive(Debug, Clone, Default)]
pub struct PulsarConnector;

impl BrokerConnector for PulsarConnector {
    type Connection = PulsarConnection;

    async fn connect(
        &self,
        service_url: &str,
        admin_url: Option<&str>,
    ) -> Result<PulsarConnection, SourceError> {
        let client = tokio::time::timeout(
            PULSAR_CONNECT_TIMEOUT,
            Pulsar::builder(service_url, TokioExecutor).build(),
        )
        .await
        .map_err(|_| SourceError::connection(format!("timed out connecting to {service_url}")))?
        .map_err(SourceError::connection)?;

        if let Some(admin_url) = admin_url {
            check_admin(admin_url).await?;
        }

        info!(service_url, "Connected to Pulsar");
        Ok(PulsarConnection { client })
    }
}

/// Any HTTP response counts as reachable; only transport failures are errors.
async fn check_admin(admin_url: &str) -> Result<(), SourceError> {
    let endpoint = format!("{}/admin/v2/clusters", admin_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(PULSAR_CONNECT_TIMEOUT)
        .build()
        .map_err(SourceError::connection)?;
    let response = client
        .get(&endpoint)
        .send()
        .await
        .map_err(SourceError::connection)?;
    debug!(endpoint, status = %response.status(), "Admin endpoint reachable");
    Ok(())
}

pub struct PulsarConnection {
    client: Pulsar<TokioExecutor>,
}

impl BrokerConnection for PulsarConnection {
    type Consumer = PulsarTopicConsumer;

    async fn subscribe(
        &self,
        selector: &TopicSelector,
        options: &SubscribeOptions,
    ) -> Result<PulsarTopicConsumer, SourceError> {
        let initial_position = match options.initial_position {
            InitialPosition::Earliest => PulsarInitialPosition::Earliest,
            InitialPosition::Latest => PulsarInitialPosition::Latest,
        };

        let builder = self.client.consumer();
        let builder = match selector {
            TopicSelector::Topic(name) => builder.with_topic(name),
            TopicSelector::Pattern(regex) => builder
                .with_topic_regex(regex.clone())
                .with_lookup_namespace(pattern_namespace(regex)),
        };

        let consumer: PulsarConsumer = builder
            .with_subscription(&options.subscription_name)
            .with_subscription_type(SUBSCRIPTION_TYPE)
            .with_consumer_name(&options.consumer_name)
            .with_options(ConsumerOptions {
                initial_position,
                ..Default::default()
            })
            .build()
            .await
            .map_err(SourceError::connection)?;

        Ok(PulsarTopicConsumer {
            consumer: Some(consumer),
            pending: HashMap::new(),
            next_handle: 0,
        })
    }
}

/// `tenant/namespace` of a qualified topic pattern, as used for topic lookup.
fn pattern_namespace(regex: &Regex) -> String {
    let pattern = regex.as_str().trim_start_matches("^(?:");
    pattern
        .split_once("://")
        .map(|(_, path)| path.splitn(3, '/').take(2).collect::<Vec<_>>())
        .filter(|segments| segments.len() == 2 && segments.iter().all(|s| !s.is_empty()))
        .map(|segments| segments.join("/"))
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
}

pub struct PulsarTopicConsumer {
    consumer: Option<PulsarConsumer>,
    pending: HashMap<AckHandle, (String, MessageIdData)>,
    next_handle: u64,
}

impl BrokerConsumer for PulsarTopicConsumer {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<RawMessage>, SourceError> {
        let Some(consumer) = self.consumer.as_mut() else {
            return Err(SourceError::unrecoverable("consumer is closed"));
        };

        let message = match tokio::time::timeout(timeout, consumer.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => return Err(SourceError::unrecoverable("consumer stream ended")),
            Ok(Some(Err(e))) => return Err(SourceError::transient(e)),
            Ok(Some(Ok(message))) => message,
        };

        let id = message.message_id().clone();
        let metadata = &message.payload.metadata;
        let handle = AckHandle(self.next_handle);
        self.next_handle += 1;

        let raw = RawMessage {
            topic: message.topic.clone(),
            payload: message.payload.data.clone(),
            key: metadata.partition_key.clone(),
            properties: metadata
                .properties
                .iter()
                .map(|kv| (kv.key.clone(), kv.value.clone()))
                .collect(),
            publish_time: metadata.publish_time,
            event_time: metadata.event_time.filter(|&t| t > 0),
            message_id: format!(
                "{}:{}:{}",
                id.ledger_id,
                id.entry_id,
                id.partition.unwrap_or(-1)
            ),
            ack: handle,
        };
        self.pending.insert(handle, (message.topic.clone(), id));
        Ok(Some(raw))
    }

    async fn ack(&mut self, handle: AckHandle) -> Result<(), SourceError> {
        let Some(consumer) = self.consumer.as_mut() else {
            return Err(SourceError::unrecoverable("consumer is closed"));
        };
        let (topic, id) = self
            .pending
            .remove(&handle)
            .ok_or_else(|| SourceError::transient(format!("unknown ack handle {}", handle.0)))?;
        consumer
            .ack_with_id(&topic, id)
            .await
            .map_err(SourceError::transient)
    }

    async fn close(&mut self) {
        if let Some(mut consumer) = self.consumer.take() {
            if let Err(e) = consumer.close().await {
                debug!(error = %e, "Error closing Pulsar consumer");
            }
        }
        self.pending.clear();
    }
}
