use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bridge_core=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Counters kept by a source task across polls.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct TaskMetrics {
    pub records_polled: usize,
    pub messages_skipped: usize,
    pub receive_errors: usize,
    pub ack_failures: usize,
    pub naming_collisions: usize,
    pub batches_processed: usize,
    pub empty_batches: usize,
    pub avg_batch_size: f64,
}

impl TaskMetrics {
    pub(crate) fn record_batch(&mut self, size: usize) {
        self.batches_processed += 1;
        self.records_polled += size;
        if size == 0 {
            self.empty_batches += 1;
        }
        self.avg_batch_size = self.records_polled as f64 / self.batches_processed as f64;
    }
}
