//! Kafka broker (cargo feature `kafka`)
//!
//! Consumes with a consumer group from a topic list or a subscription
//! pattern. Offsets are auto-committed, so negative acknowledgements cannot
//! requeue; they are logged and failures rely on the dead-letter topic.

use async_trait::async_trait;
use pipeline_common::DeadLetter;
use pipeline_core::{Acknowledge, Broker, BrokerPolicy, ConnectorConfig, ConnectorError, Delivery, DeliveryHandler};
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct KafkaOptions {
    host: String,
    port: u16,
    topic_names: Vec<String>,
    subscription_pattern: Option<String>,
    consumer_group: String,
    #[serde(flatten)]
    policy: BrokerPolicy,
}

impl Default for KafkaOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9092,
            topic_names: Vec::new(),
            subscription_pattern: None,
            consumer_group: "pipeline".to_string(),
            policy: BrokerPolicy::default(),
        }
    }
}

impl KafkaOptions {
    fn bootstrap_servers(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Topics to subscribe to; rdkafka treats a leading `^` as a regex
    fn subscriptions(&self) -> Vec<String> {
        match &self.subscription_pattern {
            Some(pattern) if pattern.starts_with('^') => vec![pattern.clone()],
            Some(pattern) => vec![format!("^{pattern}")],
            None => self.topic_names.clone(),
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.bootstrap_servers())
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest");
        config
    }
}

fn kafka_error(e: rdkafka::error::KafkaError) -> ConnectorError {
    ConnectorError::Connection(e.to_string())
}

pub struct KafkaBroker {
    options: KafkaOptions,
    producer: FutureProducer,
}

impl KafkaBroker {
    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let options: KafkaOptions = config.options()?;
        if options.subscriptions().is_empty() {
            return Err(ConnectorError::InvalidConfig(
                "kafka needs topic_names or subscription_pattern".to_string(),
            ));
        }
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", options.bootstrap_servers())
            .create()
            .map_err(kafka_error)?;
        Ok(Self { options, producer })
    }
}

struct KafkaAcker {
    topic: String,
    offset: i64,
}

#[async_trait]
impl Acknowledge for KafkaAcker {
    async fn ack(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), ConnectorError> {
        if requeue {
            warn!(
                "Kafka cannot requeue {}@{}; offset is committed",
                self.topic, self.offset
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    fn kind(&self) -> &str {
        "kafka"
    }

    async fn test_connectivity(&self) -> bool {
        let config = self.options.client_config();
        tokio::task::spawn_blocking(move || {
            let consumer: BaseConsumer = match config.create() {
                Ok(consumer) => consumer,
                Err(e) => {
                    debug!("Could not create Kafka client: {}", e);
                    return false;
                }
            };
            match consumer.fetch_metadata(None, Duration::from_secs(5)) {
                Ok(_) => true,
                Err(e) => {
                    debug!("Connection test failed: {}", e);
                    false
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    async fn start_listener(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        stop: CancellationToken,
    ) -> Result<(), ConnectorError> {
        let consumer: StreamConsumer = self.options.client_config().create().map_err(kafka_error)?;
        let subscriptions = self.options.subscriptions();
        let refs: Vec<&str> = subscriptions.iter().map(String::as_str).collect();
        consumer.subscribe(&refs).map_err(kafka_error)?;
        info!("Listening for messages from Kafka on {:?}", subscriptions);

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                received = consumer.recv() => match received {
                    Ok(message) => {
                        debug!(
                            "Received message: {} (topic), {} (partition), {} (offset)",
                            message.topic(), message.partition(), message.offset()
                        );
                        let delivery = Delivery {
                            body: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                            routing_key: Some(message.topic().to_string()),
                            redelivered: false,
                            acker: Box::new(KafkaAcker {
                                topic: message.topic().to_string(),
                                offset: message.offset(),
                            }),
                        };
                        let handler = handler.clone();
                        tasks.spawn(async move { handler.handle(delivery).await });
                    }
                    Err(e) => {
                        warn!("Kafka receive error: {}", e);
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = tokio::time::sleep(self.options.policy.retry_interval()) => {}
                        }
                    }
                },
            }
        }

        while tasks.join_next().await.is_some() {}
        consumer.unsubscribe();
        info!("Finished consuming from Kafka");
        Ok(())
    }

    async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), ConnectorError> {
        let payload = serde_json::to_vec(letter).map_err(|e| ConnectorError::Other(e.to_string()))?;
        self.producer
            .send(
                FutureRecord::to(&self.options.policy.dead_letter_exchange)
                    .key(&letter.plugin)
                    .payload(&payload),
                Duration::from_secs(5),
            )
            .await
            .map_err(|(e, _)| kafka_error(e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriptions() {
        let options: KafkaOptions = ConnectorConfig::new("kafka")
            .with_option("subscription_pattern", "media-.*")
            .options()
            .unwrap();
        assert_eq!(options.subscriptions(), vec!["^media-.*".to_string()]);
        assert_eq!(options.bootstrap_servers(), "localhost:9092");

        let options: KafkaOptions = ConnectorConfig::new("kafka")
            .with_option("topic_names", vec!["a", "b"])
            .options()
            .unwrap();
        assert_eq!(options.subscriptions(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_requires_topics() {
        assert!(matches!(
            KafkaBroker::from_config(&ConnectorConfig::new("kafka")),
            Err(ConnectorError::InvalidConfig(_))
        ));
    }
}
