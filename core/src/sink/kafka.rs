use rdkafka::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::KafkaSinkOptions;
use crate::errors::SinkError;
use crate::record::OutputRecord;
use crate::sink::Sink;

const DEFAULT_MESSAGE_TIMEOUT_MS: u32 = 5000;

/// Produces output records to Kafka, one Kafka topic per resolved record topic.
pub struct KafkaSink {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl KafkaSink {
    pub fn new(options: &KafkaSinkOptions) -> Result<Self, SinkError> {
        let message_timeout_ms = options
            .message_timeout_ms
            .unwrap_or(DEFAULT_MESSAGE_TIMEOUT_MS);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &options.bootstrap_servers)
            .set("message.timeout.ms", message_timeout_ms.to_string());

        if let Some(security_protocol) = &options.security_protocol {
            client_config.set("security.protocol", security_protocol);
        }

        if let Some(sasl_mechanisms) = &options.sasl_mechanisms {
            client_config.set("sasl.mechanisms", sasl_mechanisms);
        }

        if let Some(sasl_username) = &options.sasl_username {
            client_config.set("sasl.username", sasl_username);
        }

        if let Some(sasl_password) = &options.sasl_password {
            client_config.set("sasl.password", sasl_password);
        }

        if let Some(ssl_ca_location) = &options.ssl_ca_location {
            client_config.set("ssl.ca.location", ssl_ca_location);
        }

        let producer: FutureProducer =
            client_config
                .create()
                .map_err(|e| SinkError::ProducerCreation {
                    reason: e.to_string(),
                })?;

        info!(bootstrap_servers = %options.bootstrap_servers, "Created Kafka producer");
        Ok(Self {
            producer,
            delivery_timeout: Duration::from_millis(u64::from(message_timeout_ms)),
        })
    }
}

impl Sink for KafkaSink {
    async fn write(&self, records: &[OutputRecord]) -> Result<(), SinkError> {
        for record in records {
            let payload = record.value.to_bytes().map_err(|e| SinkError::Delivery {
                topic: record.topic.clone(),
                reason: e.to_string(),
            })?;

            let mut headers = OwnedHeaders::new();
            for (key, value) in &record.headers {
                headers = headers.insert(Header {
                    key,
                    value: Some(value.as_str()),
                });
            }

            let mut kafka_record = FutureRecord::<str, Vec<u8>>::to(&record.topic)
                .payload(&payload)
                .headers(headers);
            if let Some(key) = &record.key {
                kafka_record = kafka_record.key(key.as_str());
            }
            if let Some(timestamp) = record.timestamp {
                kafka_record = kafka_record.timestamp(timestamp.timestamp_millis());
            }

            let (partition, offset) = self
                .producer
                .send(kafka_record, self.delivery_timeout)
                .await
                .map_err(|(e, _)| SinkError::Delivery {
                    topic: record.topic.clone(),
                    reason: e.to_string(),
                })?;
            debug!(
                topic = %record.topic,
                partition,
                offset,
                source_offset = %record.source_offset,
                "Delivered record"
            );
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.producer
            .flush(self.delivery_timeout)
            .map_err(|e| SinkError::Flush {
                reason: e.to_string(),
            })
    }
}
