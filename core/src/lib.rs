pub mod accumulator;
pub mod config;
pub mod errors;
pub mod record;
pub mod sink;
pub mod source;
pub mod subscription;
pub mod task;
pub mod telemetry;
pub mod topic;

pub use config::BridgeConfig;
pub use errors::{BridgeError, Result};
pub use record::{OutputRecord, RecordValue};
pub use task::{SourceTask, TaskState, VERSION};
pub use topic::NamingPolicy;
