//! In-process broker implementing the broker traits.
//!
//! Used for local runs (`service.url = memory://...`) and by the test-suite.
//! Topics are keyed by their fully-qualified name; a partitioned topic is
//! stored as `<topic>-partition-<i>` sub-topics and publishes to it are spread
//! round-robin across partitions.
//!
//! Read positions belong to the subscription, not to the consumer: consumers
//! subscribed under the same name share one cursor per topic, and the cursor
//! outlives them. A consumer attaching to a cursor nobody else holds resumes
//! at the first unacknowledged entry.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::SourceError;
use crate::source::{
    AckHandle, BrokerConnection, BrokerConnector, BrokerConsumer, InitialPosition, RawMessage,
    SubscribeOptions, TopicSelector,
};
use crate::topic;

/// A message to publish on a [`MemoryBroker`] topic.
#[derive(Debug, Clone, Default)]
pub struct MemoryMessage {
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub properties: HashMap<String, String>,
    pub event_time: Option<u64>,
}

impl MemoryMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_event_time(mut self, millis: u64) -> Self {
        self.event_time = Some(millis);
        self
    }
}

/// Failure returned by the next `receive` of a consumer bound to a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveFault {
    Transient,
    Unrecoverable,
}

#[derive(Debug)]
struct StoredMessage {
    message: MemoryMessage,
    publish_time: u64,
}

#[derive(Debug)]
struct TopicLog {
    ledger_id: u64,
    partition: Option<i32>,
    messages: Vec<StoredMessage>,
    acked: usize,
}

/// Position of one subscription on one leaf topic.
#[derive(Debug, Default)]
struct SubscriptionCursor {
    /// Next entry to dispatch.
    read: usize,
    /// Every entry below this one is acknowledged.
    mark_delete: usize,
    /// Acknowledged entries at or above `mark_delete`.
    acked: BTreeSet<usize>,
    consumers: HashSet<u64>,
}

impl SubscriptionCursor {
    fn starting_at(entry: usize) -> Self {
        Self {
            read: entry,
            mark_delete: entry,
            ..Default::default()
        }
    }

    /// Returns false if `entry` was already acknowledged.
    fn ack(&mut self, entry: usize) -> bool {
        if entry < self.mark_delete || !self.acked.insert(entry) {
            return false;
        }
        while self.acked.remove(&self.mark_delete) {
            self.mark_delete += 1;
        }
        true
    }

    /// Claims the next unacknowledged entry below `available`.
    fn dispatch(&mut self, available: usize) -> Option<usize> {
        while self.acked.contains(&self.read) {
            self.read += 1;
        }
        if self.read >= available {
            return None;
        }
        self.read += 1;
        Some(self.read - 1)
    }
}

type CursorKey = (String, String);

fn cursor_key(subscription: &str, leaf: &str) -> CursorKey {
    (subscription.to_string(), leaf.to_string())
}

#[derive(Debug)]
struct BrokerState {
    available: bool,
    /// Leaf topics: plain topics and partition sub-topics.
    topics: BTreeMap<String, TopicLog>,
    /// Logical topic name -> partition count.
    partitioned: HashMap<String, usize>,
    publish_cursor: HashMap<String, usize>,
    faults: HashMap<String, VecDeque<ReceiveFault>>,
    ack_faults: HashMap<String, usize>,
    /// (subscription name, leaf topic) -> cursor.
    cursors: HashMap<CursorKey, SubscriptionCursor>,
    next_ledger_id: u64,
    next_consumer_id: u64,
    live_consumers: HashSet<u64>,
    closed_consumers: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            available: true,
            topics: BTreeMap::new(),
            partitioned: HashMap::new(),
            publish_cursor: HashMap::new(),
            faults: HashMap::new(),
            ack_faults: HashMap::new(),
            cursors: HashMap::new(),
            next_ledger_id: 0,
            next_consumer_id: 0,
            live_consumers: HashSet::new(),
            closed_consumers: 0,
        }
    }
}

impl BrokerState {
    fn ensure_leaf(&mut self, name: &str, partition: Option<i32>) -> &mut TopicLog {
        let next_ledger_id = &mut self.next_ledger_id;
        self.topics.entry(name.to_string()).or_insert_with(|| {
            let ledger_id = *next_ledger_id;
            *next_ledger_id += 1;
            TopicLog {
                ledger_id,
                partition,
                messages: Vec::new(),
                acked: 0,
            }
        })
    }

    /// Leaf topics behind a logical topic, creating it on first use.
    fn leaves_of(&mut self, logical: &str) -> Vec<String> {
        match self.partitioned.get(logical) {
            Some(&partitions) => (0..partitions)
                .map(|i| topic::partition_name(logical, i))
                .collect(),
            None => {
                self.ensure_leaf(logical, None);
                vec![logical.to_string()]
            }
        }
    }

    fn matching_leaves(&self, selector: &TopicSelector) -> Vec<String> {
        match selector {
            TopicSelector::Topic(name) => {
                let logical = topic::fully_qualified(name);
                match self.partitioned.get(&logical) {
                    Some(&partitions) => (0..partitions)
                        .map(|i| topic::partition_name(&logical, i))
                        .collect(),
                    None if self.topics.contains_key(&logical) => vec![logical],
                    None => Vec::new(),
                }
            }
            TopicSelector::Pattern(regex) => self
                .topics
                .keys()
                .filter(|leaf| regex.is_match(topic::logical_topic(leaf).0))
                .cloned()
                .collect(),
        }
    }

    /// Attaches `consumer` to the cursor of `subscription` on `leaf`,
    /// creating the cursor at `start` if the subscription never read `leaf`.
    fn attach(&mut self, subscription: &str, leaf: &str, consumer: u64, start: usize) {
        let cursor = self
            .cursors
            .entry(cursor_key(subscription, leaf))
            .or_insert_with(|| SubscriptionCursor::starting_at(start));
        if cursor.consumers.is_empty() {
            cursor.read = cursor.mark_delete;
        }
        cursor.consumers.insert(consumer);
    }

    fn detach(&mut self, subscription: &str, leaves: &BTreeSet<String>, consumer: u64) {
        for leaf in leaves {
            if let Some(cursor) = self.cursors.get_mut(&cursor_key(subscription, leaf)) {
                cursor.consumers.remove(&consumer);
            }
        }
    }

    fn take_ack_fault(&mut self, leaf: &str) -> bool {
        match self.ack_faults.get_mut(topic::logical_topic(leaf).0) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }

    fn take_fault(&mut self, leaves: &[String]) -> Option<ReceiveFault> {
        for leaf in leaves {
            let logical = topic::logical_topic(leaf).0;
            if let Some(queue) = self.faults.get_mut(logical) {
                if let Some(fault) = queue.pop_front() {
                    return Some(fault);
                }
            }
        }
        None
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // The state stays consistent across a panicking holder, so poisoning is ignored.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, name: &str) {
        let logical = topic::fully_qualified(name);
        let mut state = self.inner.lock();
        state.leaves_of(&logical);
    }

    pub fn create_partitioned_topic(&self, name: &str, partitions: usize) {
        if partitions == 0 {
            return self.create_topic(name);
        }
        let logical = topic::fully_qualified(name);
        let mut state = self.inner.lock();
        state.partitioned.insert(logical.clone(), partitions);
        for i in 0..partitions {
            state.ensure_leaf(&topic::partition_name(&logical, i), Some(i as i32));
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Publishes `payload` on topic `name`, returning the assigned message id.
    pub fn publish(&self, name: &str, payload: impl Into<Vec<u8>>) -> String {
        self.publish_message(name, MemoryMessage::new(payload))
    }

    pub fn publish_message(&self, name: &str, message: MemoryMessage) -> String {
        let logical = topic::fully_qualified(name);
        let mut state = self.inner.lock();
        let leaves = state.leaves_of(&logical);
        let cursor = state.publish_cursor.entry(logical).or_insert(0);
        let leaf = leaves[*cursor % leaves.len()].clone();
        *cursor += 1;

        let partition = topic::logical_topic(&leaf).1;
        let log = state.ensure_leaf(&leaf, partition);
        log.messages.push(StoredMessage {
            message,
            publish_time: Utc::now().timestamp_millis() as u64,
        });
        let id = message_id(log, log.messages.len() - 1);
        drop(state);

        self.inner.notify.notify_waiters();
        id
    }

    /// Makes subsequent connects and subscribes fail with a connection error.
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    /// Queues a failure for the next receive on a consumer bound to topic `name`.
    pub fn inject_receive_error(&self, name: &str, fault: ReceiveFault) {
        let logical = topic::fully_qualified(name);
        self.inner
            .lock()
            .faults
            .entry(logical)
            .or_default()
            .push_back(fault);
        self.inner.notify.notify_waiters();
    }

    /// Makes the next acknowledgment of a message from topic `name` fail.
    ///
    /// The message stays unacknowledged on its subscription.
    pub fn inject_ack_error(&self, name: &str) {
        let logical = topic::fully_qualified(name);
        *self.inner.lock().ack_faults.entry(logical).or_insert(0) += 1;
    }

    /// Number of acknowledged messages on topic `name`, summed over its partitions.
    pub fn acknowledged(&self, name: &str) -> usize {
        let logical = topic::fully_qualified(name);
        self.inner
            .lock()
            .topics
            .iter()
            .filter(|(leaf, _)| topic::logical_topic(leaf).0 == logical)
            .map(|(_, log)| log.acked)
            .sum()
    }

    pub fn live_consumers(&self) -> usize {
        self.inner.lock().live_consumers.len()
    }

    /// Total consumers closed over the broker's lifetime.
    pub fn closed_consumers(&self) -> usize {
        self.inner.lock().closed_consumers
    }
}

fn message_id(log: &TopicLog, entry: usize) -> String {
    format!(
        "{}:{}:{}",
        log.ledger_id,
        entry,
        log.partition.unwrap_or(-1)
    )
}

impl BrokerConnector for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(
        &self,
        service_url: &str,
        _admin_url: Option<&str>,
    ) -> Result<MemoryConnection, SourceError> {
        if !service_url.starts_with("memory://") {
            return Err(SourceError::connection(format!(
                "unsupported service url {service_url}"
            )));
        }
        if !self.inner.lock().available {
            return Err(SourceError::connection(format!(
                "broker at {service_url} is unavailable"
            )));
        }
        Ok(MemoryConnection {
            inner: Arc::clone(&self.inner),
        })
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    inner: Arc<Inner>,
}

impl BrokerConnection for MemoryConnection {
    type Consumer = MemoryConsumer;

    async fn subscribe(
        &self,
        selector: &TopicSelector,
        options: &SubscribeOptions,
    ) -> Result<MemoryConsumer, SourceError> {
        let mut state = self.inner.lock();
        if !state.available {
            return Err(SourceError::connection("broker is unavailable"));
        }

        // Named topics are created on first subscribe.
        if let TopicSelector::Topic(name) = selector {
            state.leaves_of(&topic::fully_qualified(name));
        }

        let id = state.next_consumer_id;
        state.next_consumer_id += 1;
        state.live_consumers.insert(id);

        let leaves: BTreeSet<String> = state.matching_leaves(selector).into_iter().collect();
        for leaf in &leaves {
            let start = match options.initial_position {
                InitialPosition::Earliest => 0,
                InitialPosition::Latest => state.topics[leaf].messages.len(),
            };
            state.attach(&options.subscription_name, leaf, id, start);
        }
        debug!(
            consumer = id,
            subscription = %options.subscription_name,
            %selector,
            leaves = leaves.len(),
            "memory consumer created"
        );

        Ok(MemoryConsumer {
            id,
            inner: Arc::clone(&self.inner),
            subscription: options.subscription_name.clone(),
            selector: selector.clone(),
            leaves,
            pending: HashMap::new(),
            next_handle: 0,
            next_leaf: 0,
            closed: false,
        })
    }
}

#[derive(Debug)]
pub struct MemoryConsumer {
    id: u64,
    inner: Arc<Inner>,
    subscription: String,
    selector: TopicSelector,
    /// Leaf topics this consumer is attached to.
    leaves: BTreeSet<String>,
    /// Handle -> (leaf topic, entry).
    pending: HashMap<AckHandle, (String, usize)>,
    next_handle: u64,
    next_leaf: usize,
    closed: bool,
}

impl MemoryConsumer {
    fn try_next(&mut self) -> Result<Option<RawMessage>, SourceError> {
        let mut state = self.inner.lock();

        // Topics that appear after subscribing are read from their first entry.
        for leaf in state.matching_leaves(&self.selector) {
            if self.leaves.insert(leaf.clone()) {
                state.attach(&self.subscription, &leaf, self.id, 0);
            }
        }

        let leaves: Vec<String> = self.leaves.iter().cloned().collect();
        if let Some(fault) = state.take_fault(&leaves) {
            return Err(match fault {
                ReceiveFault::Transient => SourceError::transient("injected transient receive failure"),
                ReceiveFault::Unrecoverable => {
                    SourceError::unrecoverable("injected consumer failure")
                }
            });
        }

        for step in 0..leaves.len() {
            let leaf = &leaves[(self.next_leaf + step) % leaves.len()];
            let BrokerState { topics, cursors, .. } = &mut *state;
            let (Some(log), Some(cursor)) = (
                topics.get(leaf),
                cursors.get_mut(&cursor_key(&self.subscription, leaf)),
            ) else {
                continue;
            };
            let Some(entry) = cursor.dispatch(log.messages.len()) else {
                continue;
            };
            let stored = &log.messages[entry];

            let handle = AckHandle(self.next_handle);
            self.next_handle += 1;
            self.pending.insert(handle, (leaf.clone(), entry));
            self.next_leaf = (self.next_leaf + step + 1) % leaves.len();

            return Ok(Some(RawMessage {
                topic: leaf.clone(),
                payload: stored.message.payload.clone(),
                key: stored.message.key.clone(),
                properties: stored.message.properties.clone(),
                publish_time: stored.publish_time,
                event_time: stored.message.event_time,
                message_id: message_id(log, entry),
                ack: handle,
            }));
        }

        Ok(None)
    }
}

impl BrokerConsumer for MemoryConsumer {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<RawMessage>, SourceError> {
        if self.closed {
            return Err(SourceError::unrecoverable("consumer is closed"));
        }

        let deadline = Instant::now() + timeout;
        let inner = Arc::clone(&self.inner);
        loop {
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_next()? {
                return Ok(Some(message));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, handle: AckHandle) -> Result<(), SourceError> {
        if self.closed {
            return Err(SourceError::unrecoverable("consumer is closed"));
        }
        let (leaf, entry) = self
            .pending
            .remove(&handle)
            .ok_or_else(|| SourceError::transient(format!("unknown ack handle {}", handle.0)))?;

        let mut state = self.inner.lock();
        if state.take_ack_fault(&leaf) {
            return Err(SourceError::transient("injected acknowledgment failure"));
        }
        let newly_acked = state
            .cursors
            .get_mut(&cursor_key(&self.subscription, &leaf))
            .is_some_and(|cursor| cursor.ack(entry));
        if newly_acked {
            if let Some(log) = state.topics.get_mut(&leaf) {
                log.acked += 1;
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending.clear();
        let mut state = self.inner.lock();
        state.detach(&self.subscription, &self.leaves, self.id);
        state.live_consumers.remove(&self.id);
        state.closed_consumers += 1;
    }
}
