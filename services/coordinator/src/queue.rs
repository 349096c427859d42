use crate::config::QueueConfig;
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors from the work queue
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("failed to create queue producer: {0}")]
    Creation(String),

    #[error("failed to publish {fingerprint} to {topic}: {message}")]
    Publish {
        topic: String,
        fingerprint: String,
        message: String,
    },
}

/// Queue priority, expressed as two physically separate FIFO topics.
///
/// The matching worker drains the high-priority topic first; that draining
/// policy lives entirely on the consumer side. This is the only type that
/// knows priority exists, and `QueuePublisher` implementations are the only
/// place it resolves to a concrete topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Selfie matching: a user is actively waiting on the result
    High,
    /// Event photo indexing: background work
    Low,
}

/// Producer side of the work queue pair. The coordinator only ever appends;
/// consumption belongs to the external matching worker.
#[async_trait]
pub trait QueuePublisher: Send + Sync + 'static {
    /// Append a fingerprint to the queue of the given priority, waiting for
    /// broker acknowledgement.
    async fn publish(&self, priority: Priority, fingerprint: &Fingerprint)
        -> Result<(), QueueError>;
}

/// Kafka-backed queue publisher: one topic per priority, messages keyed by
/// fingerprint for stable partitioning.
pub struct KafkaQueuePublisher {
    producer: FutureProducer,
    selfie_topic: String,
    event_photo_topic: String,
    delivery_timeout: Duration,
}

impl KafkaQueuePublisher {
    /// Create a new publisher from queue configuration
    pub fn new(config: &QueueConfig) -> Result<Self, QueueError> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("message.timeout.ms", config.request_timeout_ms.to_string())
            .set("enable.idempotence", "true")
            .set("acks", "all");

        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| QueueError::Creation(e.to_string()))?;

        info!(
            selfie_topic = %config.selfie_topic,
            event_photo_topic = %config.event_photo_topic,
            "Queue producer created"
        );

        Ok(Self {
            producer,
            selfie_topic: config.selfie_topic.clone(),
            event_photo_topic: config.event_photo_topic.clone(),
            delivery_timeout: config.request_timeout(),
        })
    }

    fn topic(&self, priority: Priority) -> &str {
        match priority {
            Priority::High => &self.selfie_topic,
            Priority::Low => &self.event_photo_topic,
        }
    }
}

#[async_trait]
impl QueuePublisher for KafkaQueuePublisher {
    #[instrument(skip(self), fields(fingerprint = %fingerprint))]
    async fn publish(
        &self,
        priority: Priority,
        fingerprint: &Fingerprint,
    ) -> Result<(), QueueError> {
        let topic = self.topic(priority);
        let payload = fingerprint.encode();

        let record = FutureRecord::to(topic).key(&payload).payload(&payload);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await
            .map_err(|(e, _)| QueueError::Publish {
                topic: topic.to_string(),
                fingerprint: payload.clone(),
                message: e.to_string(),
            })?;

        debug!(
            topic = %topic,
            partition = partition,
            offset = offset,
            "Fingerprint enqueued"
        );

        Ok(())
    }
}
