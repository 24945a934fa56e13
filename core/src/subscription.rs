//! Ownership of the broker consumers behind a task.
//!
//! A single topic, a set of named topics and a topic pattern all reduce to a
//! list of consumers; callers only ever see one merged stream of deliveries.

use futures::future::{BoxFuture, select_all};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::SourceError;
use crate::source::{
    BrokerConnection, BrokerConsumer, RawMessage, SubscribeOptions, SubscriptionTarget,
    TopicSelector,
};

/// A received message and the subscription it must be acknowledged on.
#[derive(Debug)]
pub struct Delivery {
    pub subscription: usize,
    pub message: RawMessage,
}

struct Subscription<C> {
    selector: TopicSelector,
    consumer: C,
}

pub struct SubscriptionManager<N: BrokerConnection> {
    connection: Option<N>,
    subscriptions: Vec<Subscription<N::Consumer>>,
    /// Subscription polled first by the next receive.
    next: usize,
    /// Subscriptions skipped for the rest of the current drain cycle.
    degraded: HashSet<usize>,
    transient_errors: usize,
}

impl<N: BrokerConnection> Default for SubscriptionManager<N> {
    fn default() -> Self {
        Self {
            connection: None,
            subscriptions: Vec::new(),
            next: 0,
            degraded: HashSet::new(),
            transient_errors: 0,
        }
    }
}

impl<N: BrokerConnection> SubscriptionManager<N> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates one consumer per distinct topic name or pattern in `targets`.
    ///
    /// Any failure closes the consumers created so far and leaves the manager empty.
    pub async fn start(
        &mut self,
        connection: N,
        targets: &[SubscriptionTarget],
        options: &SubscribeOptions,
    ) -> Result<(), SourceError> {
        self.stop().await;

        let mut seen = HashSet::new();
        let selectors: Vec<TopicSelector> = targets
            .iter()
            .flat_map(SubscriptionTarget::selectors)
            .filter(|selector| seen.insert(selector.to_string()))
            .collect();

        for selector in selectors {
            match connection.subscribe(&selector, options).await {
                Ok(consumer) => {
                    info!(%selector, subscription = %options.subscription_name, "Subscribed");
                    self.subscriptions.push(Subscription { selector, consumer });
                }
                Err(e) => {
                    warn!(%selector, error = %e, "Failed to subscribe, releasing consumers");
                    self.connection = Some(connection);
                    self.stop().await;
                    return Err(e);
                }
            }
        }

        self.connection = Some(connection);
        Ok(())
    }

    /// Clears the set of subscriptions skipped after transient failures.
    pub fn begin_cycle(&mut self) {
        self.degraded.clear();
    }

    /// Returns the next message from any live subscription, waiting up to `timeout`.
    ///
    /// Subscriptions are raced against each other, starting from a rotating
    /// position so no topic starves the others. A transient failure skips
    /// that subscription until the next [`begin_cycle`](Self::begin_cycle);
    /// an unrecoverable one is returned to the caller.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>, SourceError> {
        loop {
            let count = self.subscriptions.len();
            if count == 0 {
                return Ok(None);
            }

            let start = self.next % count;
            let degraded = &self.degraded;
            let (head, tail) = self.subscriptions.split_at_mut(start);
            let pending: Vec<_> = tail
                .iter_mut()
                .chain(head.iter_mut())
                .enumerate()
                .map(|(offset, sub)| ((start + offset) % count, sub))
                .filter(|(index, _)| !degraded.contains(index))
                .map(|(index, sub)| receive_from(index, &mut sub.consumer, timeout))
                .collect();

            if pending.is_empty() {
                return Ok(None);
            }

            let ((index, result), _, _) = select_all(pending).await;
            match result {
                Ok(Some(message)) => {
                    debug!(subscription = index, topic = %message.topic, id = %message.message_id, "Received message");
                    self.next = (index + 1) % count;
                    return Ok(Some(Delivery {
                        subscription: index,
                        message,
                    }));
                }
                Ok(None) => return Ok(None),
                Err(SourceError::Unrecoverable(e)) => {
                    return Err(SourceError::Unrecoverable(e));
                }
                Err(e) => {
                    warn!(
                        selector = %self.subscriptions[index].selector,
                        error = %e,
                        "Receive failed, skipping subscription for this cycle"
                    );
                    self.transient_errors += 1;
                    self.degraded.insert(index);
                }
            }
        }
    }

    /// Acknowledges a delivery on the subscription that produced it.
    pub async fn acknowledge(&mut self, delivery: &Delivery) -> Result<(), SourceError> {
        match self.subscriptions.get_mut(delivery.subscription) {
            Some(sub) => sub.consumer.ack(delivery.message.ack).await,
            None => Err(SourceError::unrecoverable(format!(
                "subscription {} is not live",
                delivery.subscription
            ))),
        }
    }

    /// Closes every consumer and drops the connection. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        if !self.subscriptions.is_empty() {
            info!(count = self.subscriptions.len(), "Closing subscriptions");
        }
        for mut sub in self.subscriptions.drain(..) {
            sub.consumer.close().await;
            debug!(selector = %sub.selector, "Closed consumer");
        }
        self.connection = None;
        self.degraded.clear();
        self.next = 0;
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn live_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn selectors(&self) -> impl Iterator<Item = &TopicSelector> {
        self.subscriptions.iter().map(|sub| &sub.selector)
    }

    /// Transient receive failures since the last call.
    pub fn take_transient_errors(&mut self) -> usize {
        std::mem::take(&mut self.transient_errors)
    }
}

fn receive_from<C: BrokerConsumer>(
    index: usize,
    consumer: &mut C,
    timeout: Duration,
) -> BoxFuture<'_, (usize, Result<Option<RawMessage>, SourceError>)> {
    Box::pin(async move { (index, consumer.receive(timeout).await) })
}
