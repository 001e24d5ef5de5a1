//! Kafka consumer feeding storage events into the pipeline.
//!
//! Offsets are committed manually. A successfully processed event is
//! committed, and so is a malformed one (it can never succeed, so leaving it
//! uncommitted would wedge the partition). Detection and persistence
//! failures leave the offset uncommitted so the event is redelivered.

use crate::config::KafkaConfig;
use crate::pipeline::{AnalysisPipeline, PipelineError};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("failed to create Kafka consumer: {0}")]
    Create(#[source] KafkaError),

    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: KafkaError,
    },
}

pub struct StorageEventConsumer {
    consumer: StreamConsumer,
    pipeline: Arc<AnalysisPipeline>,
}

impl StorageEventConsumer {
    pub fn new(config: &KafkaConfig, pipeline: Arc<AnalysisPipeline>) -> Result<Self, ConsumerError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");

            if let Some(ca_location) = &config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }

            if let (Some(username), Some(password)) =
                (&config.sasl_username, &config.sasl_password)
            {
                client_config
                    .set("sasl.mechanism", "PLAIN")
                    .set("sasl.username", username)
                    .set("sasl.password", password);
            }
        }

        let consumer: StreamConsumer = client_config.create().map_err(ConsumerError::Create)?;

        consumer
            .subscribe(&[&config.storage_events_topic])
            .map_err(|e| ConsumerError::Subscribe {
                topic: config.storage_events_topic.clone(),
                source: e,
            })?;

        info!(
            topic = %config.storage_events_topic,
            group = %config.consumer_group,
            "Subscribed to storage events"
        );

        Ok(Self { consumer, pipeline })
    }

    /// Consume and process storage events until the task is aborted.
    #[instrument(skip(self))]
    pub async fn run(&self) {
        info!("Starting storage event consumer");

        let mut stream = self.consumer.stream();

        while let Some(message_result) = stream.next().await {
            match message_result {
                Ok(message) => self.handle_message(&message).await,
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                }
            }
        }
    }

    async fn handle_message(&self, message: &BorrowedMessage<'_>) {
        debug!(
            partition = message.partition(),
            offset = message.offset(),
            "Received storage event"
        );

        let payload = message.payload().unwrap_or_default();

        match self.pipeline.process(payload).await {
            Ok(_) => {
                metrics::counter!("analysis.events.processed").increment(1);
                self.commit(message);
            }
            Err(PipelineError::MalformedEvent(e)) => {
                warn!(
                    error = %e,
                    partition = message.partition(),
                    offset = message.offset(),
                    "Discarding malformed storage event"
                );
                metrics::counter!("analysis.events.malformed").increment(1);
                self.commit(message);
            }
            Err(e) => {
                error!(
                    error = %e,
                    partition = message.partition(),
                    offset = message.offset(),
                    "Failed to process storage event, leaving offset uncommitted"
                );
                metrics::counter!("analysis.events.failed").increment(1);
            }
        }
    }

    fn commit(&self, message: &BorrowedMessage<'_>) {
        if let Err(e) = self.consumer.commit_message(message, CommitMode::Async) {
            warn!(error = %e, "Failed to commit offset");
        }
    }
}
