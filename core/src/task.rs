use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::accumulator::BatchAccumulator;
use crate::config::BridgeConfig;
use crate::errors::{self, BridgeError};
use crate::record::OutputRecord;
use crate::source::{BrokerConnector, SubscribeOptions};
use crate::subscription::SubscriptionManager;
use crate::telemetry::TaskMetrics;

/// Build identifier reported by [`SourceTask::version`].
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Stopped,
    Starting,
    Started,
}

impl TaskState {
    fn as_str(self) -> &'static str {
        match self {
            TaskState::Stopped => "stopped",
            TaskState::Starting => "starting",
            TaskState::Started => "started",
        }
    }
}

/// The source task driven by a host scheduler: `start`, repeated `poll`, `stop`.
///
/// `poll` must not be called concurrently with itself. To interrupt an
/// in-flight `poll` from elsewhere, cancel the token from
/// [`shutdown_handle`](Self::shutdown_handle); the poll returns what it has
/// gathered and `stop` can then release the consumers.
pub struct SourceTask<K: BrokerConnector> {
    connector: K,
    state: TaskState,
    config: Option<BridgeConfig>,
    subscriptions: SubscriptionManager<K::Connection>,
    accumulator: Option<BatchAccumulator>,
    shutdown: CancellationToken,
}

impl<K: BrokerConnector> SourceTask<K> {
    pub fn new(connector: K) -> Self {
        Self {
            connector,
            state: TaskState::Stopped,
            config: None,
            subscriptions: SubscriptionManager::new(),
            accumulator: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Parses `props`, connects and subscribes.
    ///
    /// On failure everything created so far is released and the task stays
    /// stopped. Starting a task that is not stopped is an illegal-state error.
    pub async fn start(&mut self, props: &HashMap<String, String>) -> errors::Result<()> {
        if self.state != TaskState::Stopped {
            return Err(BridgeError::illegal_state("start", self.state.as_str()));
        }

        self.state = TaskState::Starting;
        match self.try_start(props).await {
            Ok(()) => {
                self.state = TaskState::Started;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to start source task");
                self.subscriptions.stop().await;
                self.config = None;
                self.state = TaskState::Stopped;
                Err(e)
            }
        }
    }

    async fn try_start(&mut self, props: &HashMap<String, String>) -> errors::Result<()> {
        let config = BridgeConfig::from_map(props)?;
        info!(
            service_url = %config.service_url,
            targets = config.targets.len(),
            position = ?config.initial_position,
            naming = %config.naming_policy,
            "Starting source task"
        );

        let connection = self
            .connector
            .connect(&config.service_url, config.admin_url.as_deref())
            .await?;

        let options = SubscribeOptions {
            subscription_name: config.subscription_name.clone(),
            consumer_name: format!("{}-{}", config.subscription_name, std::process::id()),
            initial_position: config.initial_position,
        };
        self.subscriptions
            .start(connection, &config.targets, &options)
            .await?;

        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }
        self.accumulator = Some(BatchAccumulator::new(
            config.naming_policy,
            config.value_format,
        ));
        info!(
            subscriptions = self.subscriptions.live_count(),
            "Source task started"
        );
        self.config = Some(config);
        Ok(())
    }

    /// Returns the next batch of records, possibly empty.
    pub async fn poll(&mut self) -> errors::Result<Vec<OutputRecord>> {
        if self.state != TaskState::Started {
            return Err(BridgeError::illegal_state("poll", self.state.as_str()));
        }
        let (Some(config), Some(accumulator)) = (&self.config, &mut self.accumulator) else {
            return Err(BridgeError::illegal_state("poll", "unconfigured"));
        };

        accumulator
            .drain(
                &mut self.subscriptions,
                config.batch_max_messages,
                config.receive_timeout,
                &self.shutdown,
            )
            .await
    }

    /// Releases all consumers. Valid in any state and never fails.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        self.subscriptions.stop().await;
        if self.state != TaskState::Stopped {
            info!("Source task stopped");
        }
        self.config = None;
        self.state = TaskState::Stopped;
    }

    /// Token that interrupts an in-flight `poll` when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Counters of the current, or most recent, run.
    pub fn metrics(&self) -> TaskMetrics {
        self.accumulator
            .as_ref()
            .map(|accumulator| accumulator.metrics().clone())
            .unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.live_count()
    }
}
