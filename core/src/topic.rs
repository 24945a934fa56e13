//! Topic identity: mapping broker topic identifiers to record topic names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigError;

/// Domain, tenant and namespace applied to short topic names.
pub const DEFAULT_TOPIC_PREFIX: &str = "persistent://public/default/";

const PARTITION_SUFFIX: &str = "-partition-";
const DOMAINS: [&str; 2] = ["persistent", "non-persistent"];

/// Controls whether output record topic names keep their namespace qualification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum NamingPolicy {
    /// Only the terminal topic segment, e.g. `orders`.
    #[default]
    NameOnly,
    /// The identifier as the broker reports it, e.g. `persistent://public/default/orders`.
    FullyQualified,
}

impl FromStr for NamingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nameonly" => Ok(NamingPolicy::NameOnly),
            "fullyqualified" => Ok(NamingPolicy::FullyQualified),
            _ => Err("expected NameOnly or FullyQualified".to_string()),
        }
    }
}

impl fmt::Display for NamingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamingPolicy::NameOnly => f.write_str("NameOnly"),
            NamingPolicy::FullyQualified => f.write_str("FullyQualified"),
        }
    }
}

/// Resolves `raw_topic` to the topic name exposed on output records.
///
/// Pure: the result depends only on the two arguments. Names without a
/// `domain://` prefix are either a bare topic or `tenant/namespace/topic`;
/// qualified names must carry a known domain and three or four non-empty
/// path segments.
pub fn resolve(raw_topic: &str, policy: NamingPolicy) -> Result<String, ConfigError> {
    let name = terminal_name(raw_topic)?;
    Ok(match policy {
        NamingPolicy::NameOnly => name.to_string(),
        NamingPolicy::FullyQualified => raw_topic.to_string(),
    })
}

/// Returns the last segment of a topic identifier after validating its shape.
pub fn terminal_name(raw_topic: &str) -> Result<&str, ConfigError> {
    if raw_topic.trim().is_empty() {
        return Err(ConfigError::malformed_topic(raw_topic, "topic is empty"));
    }

    let Some((domain, path)) = raw_topic.split_once("://") else {
        // `tenant/namespace/topic` without a domain is a persistent topic.
        return match raw_topic.split('/').collect::<Vec<_>>()[..] {
            [name] => Ok(name),
            [tenant, namespace, name]
                if !tenant.is_empty() && !namespace.is_empty() && !name.is_empty() =>
            {
                Ok(name)
            }
            _ => Err(ConfigError::malformed_topic(
                raw_topic,
                "expected topic or tenant/namespace/topic",
            )),
        };
    };

    if !DOMAINS.contains(&domain) {
        return Err(ConfigError::malformed_topic(
            raw_topic,
            format!("unknown topic domain {domain:?}"),
        ));
    }

    let segments: Vec<&str> = path.split('/').collect();
    if !(3..=4).contains(&segments.len()) {
        return Err(ConfigError::malformed_topic(
            raw_topic,
            "expected tenant/namespace/topic",
        ));
    }
    if segments.iter().any(|s| s.is_empty()) {
        return Err(ConfigError::malformed_topic(raw_topic, "empty path segment"));
    }

    Ok(segments[segments.len() - 1])
}

/// Qualifies a topic name: short names get the default tenant and namespace,
/// `tenant/namespace/topic` gets the persistent domain.
pub fn fully_qualified(topic: &str) -> String {
    if topic.contains("://") {
        topic.to_string()
    } else if topic.contains('/') {
        format!("persistent://{topic}")
    } else {
        format!("{DEFAULT_TOPIC_PREFIX}{topic}")
    }
}

/// Splits a partition sub-topic into its logical topic and partition index.
///
/// `persistent://public/default/orders-partition-3` becomes
/// (`persistent://public/default/orders`, `Some(3)`). Anything else is
/// returned unchanged with no partition.
pub fn logical_topic(raw_topic: &str) -> (&str, Option<i32>) {
    if let Some(idx) = raw_topic.rfind(PARTITION_SUFFIX) {
        let digits = &raw_topic[idx + PARTITION_SUFFIX.len()..];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(partition) = digits.parse::<i32>() {
                return (&raw_topic[..idx], Some(partition));
            }
        }
    }
    (raw_topic, None)
}

/// Name of the `index`-th partition of a partitioned topic.
pub fn partition_name(topic: &str, index: usize) -> String {
    format!("{topic}{PARTITION_SUFFIX}{index}")
}
