use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::{
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    acker::Acker,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind as LapinExchangeKind,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::{
    redact_uri, Acknowledger, BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream,
    QueueState,
};
use crate::config::{ExchangeConfig, OptionValue, QueueConfig};
use crate::error::{Result, StageError};
use crate::types::{ExchangeKind, MessageProperties, OutgoingMessage};

const REPLY_SUCCESS: u16 = 200;

/// AMQP 0-9-1 connector backed by `lapin`
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector {
    connection_name: Option<String>,
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for the connection in the broker's management UI
    pub fn with_connection_name<T: Into<String>>(mut self, name: T) -> Self {
        self.connection_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    #[instrument(skip_all, fields(uri = %redact_uri(uri)))]
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(LongString::from(name.clone()));
        }

        let connection = Connection::connect(uri, properties)
            .await
            .map_err(|e| StageError::Connection(format!("{}: {}", redact_uri(uri), e)))?;

        debug!("AMQP connection established");
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(AmqpChannel { inner: channel, confirms: AtomicBool::new(false) }))
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner.close(REPLY_SUCCESS, "Bye").await?;
        Ok(())
    }
}

struct AmqpChannel {
    inner: Channel,
    confirms: AtomicBool,
}

fn exchange_kind(kind: ExchangeKind) -> LapinExchangeKind {
    match kind {
        ExchangeKind::Direct => LapinExchangeKind::Direct,
        ExchangeKind::Fanout => LapinExchangeKind::Fanout,
        ExchangeKind::Headers => LapinExchangeKind::Headers,
        ExchangeKind::Topic => LapinExchangeKind::Topic,
    }
}

/// Option keys were normalized to `_`; broker arguments such as
/// `x-max-length` use `-`.
fn field_table(arguments: &BTreeMap<String, OptionValue>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        let key = if key.starts_with("x_") { key.replace('_', "-") } else { key.clone() };
        let value = match value {
            OptionValue::Bool(b) => AMQPValue::Boolean(*b),
            OptionValue::String(s) => match s.parse::<i64>() {
                Ok(n) => AMQPValue::LongLongInt(n),
                Err(_) => AMQPValue::LongString(LongString::from(s.clone())),
            },
        };
        table.insert(ShortString::from(key), value);
    }
    table
}

fn properties(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: properties.content_type().as_ref().map(|s| s.as_str().to_string()),
        content_encoding: properties.content_encoding().as_ref().map(|s| s.as_str().to_string()),
    }
}

fn delivery(delivery: LapinDelivery, ack: bool) -> Delivery {
    let acker: Option<Box<dyn Acknowledger>> = if ack {
        Some(Box::new(AmqpAcker { inner: delivery.acker.clone() }))
    } else {
        None
    };
    let props = properties(&delivery.properties);
    Delivery::new(
        delivery.delivery_tag,
        delivery.redelivered,
        Bytes::from(delivery.data),
        props,
        acker,
    )
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.inner.basic_qos(count, BasicQosOptions::default()).await?;
        Ok(())
    }

    async fn enable_publisher_confirms(&self) -> Result<()> {
        self.inner.confirm_select(ConfirmSelectOptions::default()).await?;
        self.confirms.store(true, Ordering::Release);
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &ExchangeConfig) -> Result<()> {
        let options = ExchangeDeclareOptions {
            passive: exchange.passive,
            durable: exchange.durable,
            auto_delete: exchange.auto_delete,
            internal: exchange.internal,
            nowait: false,
        };
        self.inner
            .exchange_declare(&exchange.name, exchange_kind(exchange.kind), options, field_table(&exchange.arguments))
            .await
            .map_err(|e| StageError::Declaration(format!("exchange '{}': {}", exchange.name, e)))
    }

    async fn declare_queue(&self, queue: &QueueConfig) -> Result<QueueState> {
        let options = QueueDeclareOptions {
            passive: queue.passive,
            durable: queue.durable,
            exclusive: queue.exclusive,
            auto_delete: queue.auto_delete,
            nowait: false,
        };
        let declared = self
            .inner
            .queue_declare(&queue.name, options, field_table(&queue.arguments))
            .await
            .map_err(|e| StageError::Declaration(format!("queue '{}': {}", queue.name, e)))?;

        Ok(QueueState {
            name: declared.name().as_str().to_string(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32> {
        let options = QueueDeclareOptions { passive: true, ..Default::default() };
        let declared = self
            .inner
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map_err(|e| StageError::Declaration(format!("queue '{}': {}", queue, e)))?;
        Ok(declared.message_count())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| {
                StageError::Declaration(format!(
                    "bind '{}' to '{}' with '{}': {}",
                    queue, exchange, routing_key, e
                ))
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, ack: bool) -> Result<Box<dyn DeliveryStream>> {
        let options = BasicConsumeOptions { no_ack: !ack, ..Default::default() };
        let consumer = self
            .inner
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await?;
        Ok(Box::new(AmqpDeliveries { consumer, ack }))
    }

    async fn get(&self, queue: &str, ack: bool) -> Result<Option<Delivery>> {
        let message = self
            .inner
            .basic_get(queue, BasicGetOptions { no_ack: !ack })
            .await?;
        Ok(message.map(|m| delivery(m.delivery, ack)))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: OutgoingMessage) -> Result<bool> {
        let confirms = self.confirms.load(Ordering::Acquire);

        let mut props = BasicProperties::default();
        if let Some(content_type) = message.properties.content_type {
            props = props.with_content_type(ShortString::from(content_type));
        }
        if let Some(content_encoding) = message.properties.content_encoding {
            props = props.with_content_encoding(ShortString::from(content_encoding));
        }

        // Mandatory makes unroutable messages come back with the confirm
        let options = BasicPublishOptions { mandatory: confirms, ..Default::default() };
        let confirm = self
            .inner
            .basic_publish(exchange, routing_key, options, &message.body, props)
            .await?;

        Ok(match confirm.await? {
            Confirmation::NotRequested | Confirmation::Ack(None) => true,
            Confirmation::Ack(Some(returned)) => {
                warn!("Message returned by broker: {:?}", returned.reply_text);
                false
            }
            Confirmation::Nack(_) => false,
        })
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner.close(REPLY_SUCCESS, "Bye").await?;
        Ok(())
    }
}

struct AmqpDeliveries {
    consumer: Consumer,
    ack: bool,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveries {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        let ack = self.ack;
        self.consumer
            .next()
            .await
            .map(|result| result.map(|d| delivery(d, ack)).map_err(StageError::from))
    }
}

struct AmqpAcker {
    inner: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.inner.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.inner.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}
