use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Source(#[from] SourceError),

    #[error("Illegal state: cannot {operation} while {state}")]
    IllegalState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to connect or communicate with the broker: {source}")]
    Connection {
        #[source]
        source: BoxError,
    },

    #[error("A transient error occurred, the operation can be retried: {source}")]
    Transient {
        #[source]
        source: BoxError,
    },

    #[error("Unrecoverable error from the broker: {0}")]
    Unrecoverable(#[source] BoxError),
}

impl SourceError {
    pub fn connection(source: impl Into<BoxError>) -> Self {
        SourceError::Connection {
            source: source.into(),
        }
    }

    pub fn transient(source: impl Into<BoxError>) -> Self {
        SourceError::Transient {
            source: source.into(),
        }
    }

    pub fn unrecoverable(source: impl Into<BoxError>) -> Self {
        SourceError::Unrecoverable(source.into())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Malformed topic identifier {topic:?}: {reason}")]
    MalformedTopic { topic: String, reason: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: BoxError,
    },
}

impl ConfigError {
    pub(crate) fn invalid_value(key: &str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed_topic(topic: &str, reason: impl Into<String>) -> Self {
        ConfigError::MalformedTopic {
            topic: topic.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to create producer: {reason}")]
    ProducerCreation { reason: String },

    #[error("Failed to deliver record to topic {topic}: {reason}")]
    Delivery { topic: String, reason: String },

    #[error("Failed to flush producer: {reason}")]
    Flush { reason: String },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    Json { reason: String },

    #[error("YAML serialization failed: {reason}")]
    Yaml { reason: String },

    #[error("Payload is not valid UTF-8: {reason}")]
    Utf8 { reason: String },
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(SerializationError::Json {
            reason: err.to_string(),
        })
    }
}

impl From<serde_yaml::Error> for BridgeError {
    fn from(err: serde_yaml::Error) -> Self {
        BridgeError::Serialization(SerializationError::Yaml {
            reason: err.to_string(),
        })
    }
}

impl BridgeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Source(SourceError::Transient { .. }) => true,
            BridgeError::Source(SourceError::Connection { .. }) => true,
            BridgeError::Source(SourceError::Unrecoverable(_)) => false,
            BridgeError::Sink(SinkError::Delivery { .. }) => true,
            BridgeError::Sink(SinkError::Flush { .. }) => true,
            BridgeError::Sink(SinkError::ProducerCreation { .. }) => false,
            BridgeError::Config(_) => false,
            BridgeError::IllegalState { .. } => false,
            BridgeError::Serialization(_) => false,
            _ => true,
        }
    }

    pub fn should_skip_message(&self) -> bool {
        matches!(
            self,
            BridgeError::Serialization(_) | BridgeError::Config(ConfigError::MalformedTopic { .. })
        )
    }

    pub fn get_retry_delay_ms(&self) -> u64 {
        match self {
            BridgeError::Source(_) => 1000,
            BridgeError::Sink(_) => 2000,
            _ => 5000,
        }
    }

    pub(crate) fn illegal_state(operation: &'static str, state: &'static str) -> Self {
        BridgeError::IllegalState { operation, state }
    }
}
