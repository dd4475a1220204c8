//! RabbitMQ broker over AMQP 0.9.1
//!
//! Without `exchange_name` the listener consumes straight from `queue_name`.
//! With it, the exchange is declared (`exchange_type`, default fanout) and the
//! queue is bound to it. Dead letters go to a durable direct exchange, routed
//! by plugin name so one plugin's failures can be replayed on their own.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use pipeline_common::DeadLetter;
use pipeline_core::{
    Acknowledge, Broker, BrokerPolicy, ConnectorConfig, ConnectorError, Delivery, DeliveryHandler,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RabbitMqOptions {
    host: String,
    port: u16,
    user: String,
    password: String,
    vhost: String,
    #[serde(alias = "routing_key")]
    queue_name: String,
    exchange_name: Option<String>,
    exchange_type: String,
    durable: bool,
    #[serde(flatten)]
    policy: BrokerPolicy,
}

impl Default for RabbitMqOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            queue_name: "pipeline".to_string(),
            exchange_name: None,
            exchange_type: "fanout".to_string(),
            durable: false,
            policy: BrokerPolicy::default(),
        }
    }
}

impl RabbitMqOptions {
    fn uri(&self) -> String {
        let vhost = if self.vhost == "/" { "%2f" } else { self.vhost.trim_start_matches('/') };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }

    fn exchange_kind(&self) -> ExchangeKind {
        match self.exchange_type.as_str() {
            "fanout" => ExchangeKind::Fanout,
            "direct" => ExchangeKind::Direct,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            other => ExchangeKind::Custom(other.to_string()),
        }
    }
}

fn amqp_error(e: lapin::Error) -> ConnectorError {
    ConnectorError::Connection(e.to_string())
}

pub struct RabbitMqBroker {
    options: RabbitMqOptions,
    /// Connection kept for dead-letter publishing, opened on first use
    publisher: Mutex<Option<(Connection, Channel)>>,
}

impl RabbitMqBroker {
    pub fn from_config(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let options: RabbitMqOptions = config.options()?;
        if options.queue_name.is_empty() {
            return Err(ConnectorError::InvalidConfig("rabbitmq queue_name is empty".to_string()));
        }
        Ok(Self {
            options,
            publisher: Mutex::new(None),
        })
    }

    async fn connect(&self) -> Result<Connection, ConnectorError> {
        Connection::connect(&self.options.uri(), ConnectionProperties::default())
            .await
            .map_err(amqp_error)
    }

    /// Declare the topology and consume until `stop` or a connection error
    async fn consume(&self, handler: &Arc<dyn DeliveryHandler>, stop: &CancellationToken) -> Result<(), ConnectorError> {
        let options = &self.options;
        let connection = self.connect().await?;
        let channel = connection.create_channel().await.map_err(amqp_error)?;
        channel
            .basic_qos(options.policy.prefetch, BasicQosOptions::default())
            .await
            .map_err(amqp_error)?;

        let queue = channel
            .queue_declare(
                &options.queue_name,
                QueueDeclareOptions {
                    durable: options.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(amqp_error)?;

        if let Some(exchange) = &options.exchange_name {
            debug!("Declaring exchange {} as {}", exchange, options.exchange_type);
            channel
                .exchange_declare(
                    exchange,
                    options.exchange_kind(),
                    ExchangeDeclareOptions {
                        durable: options.durable,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(amqp_error)?;
            channel
                .queue_bind(
                    queue.name().as_str(),
                    exchange,
                    &options.queue_name,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(amqp_error)?;
        }

        let mut consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "pipeline",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(amqp_error)?;
        info!("Consuming from queue {}", queue.name());

        let mut tasks = JoinSet::new();
        let result = loop {
            tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => {
                        let handler = handler.clone();
                        let delivery = Delivery {
                            body: delivery.data,
                            routing_key: Some(delivery.routing_key.as_str().to_string()),
                            redelivered: delivery.redelivered,
                            acker: Box::new(RabbitMqAcker(delivery.acker)),
                        };
                        tasks.spawn(async move { handler.handle(delivery).await });
                    }
                    Some(Err(e)) => break Err(amqp_error(e)),
                    None => break Err(ConnectorError::Connection("consumer stream ended".to_string())),
                },
            }
        };

        if result.is_ok() {
            let _ = channel
                .basic_cancel(consumer.tag().as_str(), BasicCancelOptions::default())
                .await;
        }
        // In-flight deliveries still need the channel to settle
        while tasks.join_next().await.is_some() {}
        let _ = connection.close(200, "shutdown").await;
        result
    }

    async fn publisher_channel(&self) -> Result<Channel, ConnectorError> {
        let mut slot = self.publisher.lock().await;
        if let Some((connection, channel)) = slot.as_ref() {
            if connection.status().connected() && channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let connection = self.connect().await?;
        let channel = connection.create_channel().await.map_err(amqp_error)?;
        channel
            .exchange_declare(
                &self.options.policy.dead_letter_exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(amqp_error)?;
        *slot = Some((connection, channel.clone()));
        Ok(channel)
    }
}

struct RabbitMqAcker(lapin::acker::Acker);

#[async_trait]
impl Acknowledge for RabbitMqAcker {
    async fn ack(&self) -> Result<(), ConnectorError> {
        self.0.ack(BasicAckOptions::default()).await.map_err(amqp_error)
    }

    async fn nack(&self, requeue: bool) -> Result<(), ConnectorError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(amqp_error)
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    fn kind(&self) -> &str {
        "rabbitmq"
    }

    async fn test_connectivity(&self) -> bool {
        debug!(
            "Testing connection to RabbitMQ on {}:{}",
            self.options.host, self.options.port
        );
        match self.connect().await {
            Ok(connection) => {
                let _ = connection.close(200, "connectivity test").await;
                true
            }
            Err(e) => {
                debug!("Connection test failed: {}", e);
                false
            }
        }
    }

    async fn start_listener(
        &self,
        handler: Arc<dyn DeliveryHandler>,
        stop: CancellationToken,
    ) -> Result<(), ConnectorError> {
        while !stop.is_cancelled() {
            match self.consume(&handler, &stop).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        "Lost connection to broker: {}; reconnecting in {}s",
                        e, self.options.policy.retry_interval
                    );
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(self.options.policy.retry_interval()) => {}
                    }
                }
            }
        }
        info!("Finished consuming from RabbitMQ");
        Ok(())
    }

    async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), ConnectorError> {
        let payload = serde_json::to_vec(letter).map_err(|e| ConnectorError::Other(e.to_string()))?;
        let channel = self.publisher_channel().await?;
        channel
            .basic_publish(
                &self.options.policy.dead_letter_exchange,
                &letter.plugin,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await
            .map_err(amqp_error)?
            .await
            .map_err(amqp_error)?;
        debug!(
            "Published dead letter for {} to {}/{}",
            letter.message_id, self.options.policy.dead_letter_exchange, letter.plugin
        );
        Ok(())
    }
}
