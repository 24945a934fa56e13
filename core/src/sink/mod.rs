#[cfg(feature = "kafka")]
pub mod kafka;

use std::future::Future;

use crate::errors::SinkError;
use crate::record::OutputRecord;

/// The `Sink` trait defines the contract for the downstream record pipeline.
/// It takes batches returned by `SourceTask::poll` and delivers them.
pub trait Sink: Send + Sync {
    /// Delivers `records` in order, returning once every record is accepted.
    fn write(&self, records: &[OutputRecord]) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Waits for buffered records to be delivered. Called on shutdown.
    fn flush(&self) -> impl Future<Output = Result<(), SinkError>> + Send;
}
