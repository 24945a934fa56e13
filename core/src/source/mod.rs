pub mod memory;
#[cfg(feature = "pulsar")]
pub mod pulsar;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::SourceError;

/// A message received from the broker, before topic resolution.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Topic the broker delivered the message on, possibly a partition sub-topic.
    pub topic: String,
    /// raw payload of the message
    pub payload: Vec<u8>,
    pub key: Option<String>,
    /// Message properties set by the producer.
    pub properties: HashMap<String, String>,
    /// Broker publish time, milliseconds since the epoch.
    pub publish_time: u64,
    /// Producer-assigned event time, milliseconds since the epoch.
    pub event_time: Option<u64>,
    /// Broker-assigned position, rendered for use as a source offset.
    pub message_id: String,
    /// Handle passed back to [`BrokerConsumer::ack`].
    pub ack: AckHandle,
}

/// An opaque handle used to acknowledge a message on the consumer that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckHandle(pub u64);

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum InitialPosition {
    /// Oldest retained message.
    Earliest,
    /// Only messages published after the subscription exists.
    #[default]
    Latest,
}

impl FromStr for InitialPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(InitialPosition::Earliest),
            "latest" => Ok(InitialPosition::Latest),
            _ => Err("expected Earliest or Latest".to_string()),
        }
    }
}

/// What the task is configured to consume.
#[derive(Debug, Clone)]
pub enum SubscriptionTarget {
    SingleTopic(String),
    NamedSet(Vec<String>),
    Pattern(Regex),
}

impl SubscriptionTarget {
    /// One selector per consumer the target needs.
    pub fn selectors(&self) -> Vec<TopicSelector> {
        match self {
            SubscriptionTarget::SingleTopic(name) => vec![TopicSelector::Topic(name.clone())],
            SubscriptionTarget::NamedSet(names) => names
                .iter()
                .map(|name| TopicSelector::Topic(name.clone()))
                .collect(),
            SubscriptionTarget::Pattern(regex) => vec![TopicSelector::Pattern(regex.clone())],
        }
    }
}

/// The binding of a single broker consumer.
#[derive(Debug, Clone)]
pub enum TopicSelector {
    Topic(String),
    /// Resolved by the broker against fully-qualified topic names.
    Pattern(Regex),
}

impl fmt::Display for TopicSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicSelector::Topic(name) => write!(f, "topic {name}"),
            TopicSelector::Pattern(regex) => write!(f, "pattern {}", regex.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub subscription_name: String,
    pub consumer_name: String,
    pub initial_position: InitialPosition,
}

/// Establishes connections to a broker.
///
/// Each task owns its connector; shared client pools are expressed by
/// injecting a connector that hands out reference-counted connections.
pub trait BrokerConnector: Send + Sync {
    type Connection: BrokerConnection;

    fn connect(
        &self,
        service_url: &str,
        admin_url: Option<&str>,
    ) -> impl Future<Output = Result<Self::Connection, SourceError>> + Send;
}

pub trait BrokerConnection: Send + Sync {
    type Consumer: BrokerConsumer;

    /// Creates one consumer bound to `selector`.
    fn subscribe(
        &self,
        selector: &TopicSelector,
        options: &SubscribeOptions,
    ) -> impl Future<Output = Result<Self::Consumer, SourceError>> + Send;
}

pub trait BrokerConsumer: Send {
    /// Waits up to `timeout` for the next message.
    ///
    /// `Ok(None)` means nothing arrived in time. `SourceError::Transient`
    /// is a failure of this call only; `SourceError::Unrecoverable` means the
    /// consumer can no longer be used.
    fn receive(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<RawMessage>, SourceError>> + Send;

    /// Marks a received message as processed.
    fn ack(&mut self, handle: AckHandle) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Releases broker-side resources. Safe to call more than once.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
