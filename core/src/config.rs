use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::record::ValueFormat;
use crate::source::{InitialPosition, SubscriptionTarget};
use crate::topic::{self, NamingPolicy};

pub const SERVICE_URL_CONFIG: &str = "service.url";
pub const SERVICE_HTTP_URL_CONFIG: &str = "service.http.url";
pub const TOPIC_NAMES_CONFIG: &str = "topic.names";
pub const TOPIC_PATTERN_CONFIG: &str = "topic.pattern";
pub const BATCH_MAX_NUM_MESSAGES_CONFIG: &str = "batch.max.num.messages";
pub const BATCH_RECEIVE_TIMEOUT_MS_CONFIG: &str = "batch.receive.timeout.ms";
pub const SUBSCRIPTION_NAME_CONFIG: &str = "subscription.name";
pub const SUBSCRIPTION_INITIAL_POSITION_CONFIG: &str = "subscription.initial.position";
pub const TOPIC_NAMING_STRATEGY_CONFIG: &str = "topic.naming.strategy";
pub const MESSAGE_FORMAT_CONFIG: &str = "message.format";

pub const DEFAULT_BATCH_MAX_NUM_MESSAGES: usize = 100;
pub const DEFAULT_BATCH_RECEIVE_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_SUBSCRIPTION_NAME: &str = "pulsar-bridge";

/// Validated settings of a source task.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub service_url: String,
    pub admin_url: Option<String>,
    pub targets: Vec<SubscriptionTarget>,
    pub batch_max_messages: usize,
    pub receive_timeout: Duration,
    pub subscription_name: String,
    pub initial_position: InitialPosition,
    pub naming_policy: NamingPolicy,
    pub value_format: ValueFormat,
}

impl BridgeConfig {
    /// Parses the string properties a host scheduler passes to `start`.
    pub fn from_map(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let service_url = required(props, SERVICE_URL_CONFIG)?;
        let admin_url = optional(props, SERVICE_HTTP_URL_CONFIG).map(str::to_string);

        let mut targets = Vec::new();
        if let Some(names) = optional(props, TOPIC_NAMES_CONFIG) {
            let names = parse_topic_names(names)?;
            match names.len() {
                0 => {}
                1 => targets.push(SubscriptionTarget::SingleTopic(names[0].clone())),
                _ => targets.push(SubscriptionTarget::NamedSet(names)),
            }
        }
        if let Some(pattern) = optional(props, TOPIC_PATTERN_CONFIG) {
            targets.push(SubscriptionTarget::Pattern(parse_topic_pattern(pattern)?));
        }
        if targets.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: format!(
                    "at least one of {TOPIC_NAMES_CONFIG} or {TOPIC_PATTERN_CONFIG} must be set"
                ),
            });
        }

        let batch_max_messages = parse_or(
            props,
            BATCH_MAX_NUM_MESSAGES_CONFIG,
            DEFAULT_BATCH_MAX_NUM_MESSAGES,
        )?;
        if batch_max_messages == 0 {
            return Err(ConfigError::invalid_value(
                BATCH_MAX_NUM_MESSAGES_CONFIG,
                "0",
                "must be positive",
            ));
        }

        let receive_timeout_ms = parse_or(
            props,
            BATCH_RECEIVE_TIMEOUT_MS_CONFIG,
            DEFAULT_BATCH_RECEIVE_TIMEOUT_MS,
        )?;
        if receive_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                BATCH_RECEIVE_TIMEOUT_MS_CONFIG,
                "0",
                "must be positive",
            ));
        }

        let subscription_name = optional(props, SUBSCRIPTION_NAME_CONFIG)
            .unwrap_or(DEFAULT_SUBSCRIPTION_NAME)
            .to_string();

        Ok(Self {
            service_url: service_url.to_string(),
            admin_url,
            targets,
            batch_max_messages,
            receive_timeout: Duration::from_millis(receive_timeout_ms),
            subscription_name,
            initial_position: parse_or(
                props,
                SUBSCRIPTION_INITIAL_POSITION_CONFIG,
                InitialPosition::default(),
            )?,
            naming_policy: parse_or(props, TOPIC_NAMING_STRATEGY_CONFIG, NamingPolicy::default())?,
            value_format: parse_or(props, MESSAGE_FORMAT_CONFIG, ValueFormat::default())?,
        })
    }
}

/// Trimmed value of `key`, treating blank values as unset.
fn optional<'a>(props: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    props
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn required<'a>(props: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ConfigError> {
    optional(props, key).ok_or_else(|| ConfigError::MissingField {
        field: key.to_string(),
    })
}

fn parse_or<T>(props: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match optional(props, key) {
        Some(value) => value
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid_value(key, value, e.to_string())),
        None => Ok(default),
    }
}

/// Comma-separated topic names; blank entries are dropped and names that
/// qualify to the same topic collapse into one.
fn parse_topic_names(raw: &str) -> Result<Vec<String>, ConfigError> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        topic::terminal_name(name)?;
        if seen.insert(topic::fully_qualified(name)) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Compiles a topic pattern that must match a whole fully-qualified topic name.
fn parse_topic_pattern(raw: &str) -> Result<Regex, ConfigError> {
    let qualified = topic::fully_qualified(raw);
    Regex::new(&format!("^(?:{qualified})$"))
        .map_err(|e| ConfigError::invalid_value(TOPIC_PATTERN_CONFIG, raw, e.to_string()))
}

/// Settings of the container runner: the task properties plus the sink.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    pub task: HashMap<String, String>,
    pub sink: KafkaSinkOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaSinkOptions {
    pub bootstrap_servers: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub message_timeout_ms: Option<u32>,
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<RunnerConfig> {
    match config_path {
        Some(path) => RunnerConfig::from_file(path),
        None => RunnerConfig::from_env(),
    }
}

impl RunnerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RunnerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config_str = std::env::var("BRIDGE_CONFIG")
            .map_err(|_| anyhow::anyhow!("BRIDGE_CONFIG environment variable not set"))?;
        let config: RunnerConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sink.bootstrap_servers.is_empty() {
            return Err(anyhow::anyhow!("Kafka bootstrap servers cannot be empty"));
        }
        BridgeConfig::from_map(&self.task)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_map(&props(&[
            (SERVICE_URL_CONFIG, "pulsar://localhost:6650"),
            (TOPIC_NAMES_CONFIG, "orders"),
        ]))
        .unwrap();

        assert_eq!(config.service_url, "pulsar://localhost:6650");
        assert_eq!(config.admin_url, None);
        assert_eq!(config.batch_max_messages, DEFAULT_BATCH_MAX_NUM_MESSAGES);
        assert_eq!(config.receive_timeout, Duration::from_millis(1000));
        assert_eq!(config.subscription_name, DEFAULT_SUBSCRIPTION_NAME);
        assert_eq!(config.initial_position, InitialPosition::Latest);
        assert_eq!(config.naming_policy, NamingPolicy::NameOnly);
        assert_eq!(config.value_format, ValueFormat::Bytes);
        assert!(matches!(
            config.targets.as_slice(),
            [SubscriptionTarget::SingleTopic(name)] if name == "orders"
        ));
    }

    #[test]
    fn test_names_and_pattern_combine() {
        let config = BridgeConfig::from_map(&props(&[
            (SERVICE_URL_CONFIG, "pulsar://localhost:6650"),
            (SERVICE_HTTP_URL_CONFIG, "http://localhost:8080"),
            (TOPIC_NAMES_CONFIG, "a, b,,persistent://public/default/a, c"),
            (TOPIC_PATTERN_CONFIG, "metrics-.*"),
            (SUBSCRIPTION_INITIAL_POSITION_CONFIG, "Earliest"),
            (TOPIC_NAMING_STRATEGY_CONFIG, "FullyQualified"),
            (BATCH_MAX_NUM_MESSAGES_CONFIG, "15"),
        ]))
        .unwrap();

        assert_eq!(config.admin_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.batch_max_messages, 15);
        assert_eq!(config.initial_position, InitialPosition::Earliest);
        assert_eq!(config.naming_policy, NamingPolicy::FullyQualified);
        assert_eq!(config.targets.len(), 2);
        match &config.targets[0] {
            SubscriptionTarget::NamedSet(names) => assert_eq!(names, &["a", "b", "c"]),
            other => panic!("unexpected target {other:?}"),
        }
        match &config.targets[1] {
            SubscriptionTarget::Pattern(regex) => {
                assert!(regex.is_match("persistent://public/default/metrics-cpu"));
                assert!(!regex.is_match("persistent://public/default/logs"));
                assert!(!regex.is_match("persistent://acme/default/metrics-cpu"));
            }
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_requires_topics() {
        let err = BridgeConfig::from_map(&props(&[
            (SERVICE_URL_CONFIG, "pulsar://localhost:6650"),
            (TOPIC_NAMES_CONFIG, " , "),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed { .. }));
    }

    #[test]
    fn test_requires_service_url() {
        let err = BridgeConfig::from_map(&props(&[(TOPIC_NAMES_CONFIG, "orders")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field } if field == SERVICE_URL_CONFIG));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let base = [
            (SERVICE_URL_CONFIG, "pulsar://localhost:6650"),
            (TOPIC_NAMES_CONFIG, "orders"),
        ];
        for (key, value) in [
            (BATCH_MAX_NUM_MESSAGES_CONFIG, "0"),
            (BATCH_MAX_NUM_MESSAGES_CONFIG, "many"),
            (BATCH_RECEIVE_TIMEOUT_MS_CONFIG, "0"),
            (SUBSCRIPTION_INITIAL_POSITION_CONFIG, "Beginning"),
            (TOPIC_NAMING_STRATEGY_CONFIG, "ShortName"),
            (MESSAGE_FORMAT_CONFIG, "avro"),
            (TOPIC_PATTERN_CONFIG, "metrics-(["),
        ] {
            let mut map = props(&base);
            map.insert(key.to_string(), value.to_string());
            let err = BridgeConfig::from_map(&map).unwrap_err();
            assert!(
                matches!(&err, ConfigError::InvalidValue { key: k, .. } if k == key),
                "{key}={value} gave {err}"
            );
        }
    }

    #[test]
    fn test_rejects_malformed_topic_names() {
        let err = BridgeConfig::from_map(&props(&[
            (SERVICE_URL_CONFIG, "pulsar://localhost:6650"),
            (TOPIC_NAMES_CONFIG, "orders,persistent://public/orders"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MalformedTopic { .. }));
    }

    #[test]
    fn test_runner_config_from_file() {
        let yaml = r#"
task:
  service.url: pulsar://localhost:6650
  topic.names: orders,payments
  subscription.initial.position: Earliest
sink:
  bootstrap_servers: localhost:9092
  security_protocol: PLAINTEXT
  sasl_mechanisms: null
  sasl_username: null
  sasl_password: null
  ssl_ca_location: null
  message_timeout_ms: 5000
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = RunnerConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.sink.bootstrap_servers, "localhost:9092");
        assert_eq!(config.sink.message_timeout_ms, Some(5000));
        assert_eq!(config.task[TOPIC_NAMES_CONFIG], "orders,payments");
        config.validate().unwrap();
    }
}
