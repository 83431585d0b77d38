//! AMQP broker adapter.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use relay_queue::{Broker, Connector, Delivery, DeliveryStream, HeaderValue, Headers, QueueError};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CONSUMER_TAG: &str = "relay-runtime";
const PERSISTENT: u8 = 2;

pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, QueueError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                QueueError::Connection(format!(
                    "{}. Check the URL scheme and port (amqp://:5672 or amqps://:5671)",
                    e
                ))
            })?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))?;

        info!("Connected to AMQP broker");
        Ok(Arc::new(AmqpBroker {
            connection,
            channel,
        }))
    }
}

struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), QueueError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), QueueError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn DeliveryStream>, QueueError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))?;
        Ok(Box::new(AmqpStream { consumer }))
    }

    async fn publish(&self, queue: &str, body: Vec<u8>, headers: Headers) -> Result<(), QueueError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_headers(to_field_table(&headers));

        self.channel
            .basic_publish("", queue, BasicPublishOptions::default(), &body, properties)
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?;
        debug!("Published {} bytes to {}", body.len(), queue);
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.channel.status().connected() {
            self.channel
                .close(200, "OK")
                .await
                .map_err(|e| QueueError::Channel(e.to_string()))?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "OK")
                .await
                .map_err(|e| QueueError::Connection(e.to_string()))?;
        }
        Ok(())
    }
}

struct AmqpStream {
    consumer: lapin::Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpStream {
    async fn next(&mut self) -> Option<Result<Box<dyn Delivery>, QueueError>> {
        let delivery = self.consumer.next().await?;
        Some(
            delivery
                .map(|delivery| {
                    let headers = from_field_table(delivery.properties.headers().as_ref());
                    Box::new(AmqpDelivery { delivery, headers }) as Box<dyn Delivery>
                })
                .map_err(|e| QueueError::Channel(e.to_string())),
        )
    }
}

struct AmqpDelivery {
    delivery: lapin::message::Delivery,
    headers: Headers,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.delivery.data
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    async fn ack(&self) -> Result<(), QueueError> {
        self.delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Settle(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.delivery
            .acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| QueueError::Settle(e.to_string()))
    }
}

fn from_field_table(table: Option<&FieldTable>) -> Headers {
    let mut headers = Headers::new();
    let Some(table) = table else {
        return headers;
    };

    for (key, value) in table.inner() {
        let converted = match value {
            AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
            AMQPValue::ShortShortInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::ShortShortUInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::ShortInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::ShortUInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::LongInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::LongUInt(n) => HeaderValue::Int(i64::from(*n)),
            AMQPValue::LongLongInt(n) => HeaderValue::Int(*n),
            AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_string()),
            AMQPValue::LongString(s) => {
                HeaderValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned())
            }
            other => {
                warn!("Dropping unsupported header {}: {:?}", key.as_str(), other);
                continue;
            }
        };
        headers.insert(key.as_str().to_string(), converted);
    }
    headers
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            HeaderValue::Int(n) => AMQPValue::LongLongInt(*n),
            HeaderValue::Str(s) => AMQPValue::LongString(LongString::from(s.as_str())),
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        };
        table.insert(ShortString::from(key.as_str()), value);
    }
    table
}
