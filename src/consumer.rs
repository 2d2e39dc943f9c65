//! Consumer stage: broker messages in, pipeline items out.
//!
//! Upstream items are re-emitted unchanged first. Only then does the stage
//! connect, declare and bind its queue and start yielding decoded messages.
//! A delivery is acknowledged when the downstream asks for the next item, so
//! a message whose item was never fully handed over goes back to the queue
//! when the stage is dropped.
//!
//! Termination:
//! - [`Termination::Limit`]: stop after `limit` messages, or after the queue
//!   depth observed at start when no limit is configured (0 reads forever)
//! - [`Termination::Idle`] with [`IdleMonitor::Deadline`]: stop once the
//!   delivery feed stays silent for the grace period
//! - [`Termination::Idle`] with [`IdleMonitor::Shadow`]: pull with `get` on
//!   the primary channel and, when it comes back empty, probe a mirror
//!   channel on a second connection once per second until the grace period
//!   runs out
//!
//! An upstream error, or the broker cancelling the consumer, ends the stage
//! with that error.

use futures::StreamExt;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::codec::{FormatCodec, Payload};
use crate::config::{ConsumerConfig, IdleMonitor, StageOptions, Termination, SHADOW_POLL_INTERVAL};
use crate::connection::{AmqpConnector, BrokerChannel, Connector, Delivery, DeliveryStream, Session};
use crate::error::{Result, StageError};
use crate::stage::{ItemStream, Stage};
use crate::types::{Item, QueueName};

const STAGE: &str = "consumer";

/// Reads items from an AMQP queue
pub struct ConsumerStage {
    config: ConsumerConfig,
    connector: Arc<dyn Connector>,
    codec: Arc<FormatCodec>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConsumerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerStage")
            .field("config", &self.config)
            .field("codec", &self.codec)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ConsumerStage {
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            connector: Arc::new(AmqpConnector::new().with_connection_name("rustmq-amqp consumer")),
            codec: Arc::new(FormatCodec::with_builtins()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_options(options: &StageOptions) -> Result<Self> {
        Ok(Self::new(ConsumerConfig::from_options(options)?))
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_codec(mut self, codec: FormatCodec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Cancelling the token stops consumption cleanly
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Splice the stage after `previous`
    pub fn run(self, previous: ItemStream) -> ItemStream {
        let run = ConsumerRun {
            stage: self,
            upstream: Some(previous),
            session: Session::new(STAGE),
            source: None,
            pending: None,
            received: 0,
            limit: None,
            done: false,
        };

        futures::stream::unfold(run, |mut run| async move {
            let next = run.next().await;
            next.map(|item| (item, run))
        })
        .boxed()
    }
}

impl Stage for ConsumerStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn run(self: Box<Self>, previous: ItemStream) -> ItemStream {
        ConsumerStage::run(*self, previous)
    }
}

enum Source {
    /// Live delivery feed; `idle` bounds the wait for each delivery
    Feed {
        feed: Box<dyn DeliveryStream>,
        idle: Option<Duration>,
    },
    Shadow {
        primary: Arc<dyn BrokerChannel>,
        mirror: Arc<dyn BrokerChannel>,
        queue: QueueName,
        grace: Duration,
    },
}

enum Received {
    Delivery(Delivery),
    Idle,
    Cancelled,
    Closed,
}

struct ConsumerRun {
    stage: ConsumerStage,
    upstream: Option<ItemStream>,
    session: Session,
    source: Option<Source>,
    /// Delivered message whose item is with the downstream
    pending: Option<Delivery>,
    received: u64,
    limit: Option<u64>,
    done: bool,
}

impl ConsumerRun {
    async fn next(&mut self) -> Option<Result<Item>> {
        if self.done {
            return None;
        }

        if let Some(upstream) = self.upstream.as_mut() {
            match upstream.next().await {
                Some(Ok(item)) => return Some(Ok(item)),
                Some(Err(e)) => return self.fail(e).await,
                None => self.upstream = None,
            }
        }

        if let Some(mut delivery) = self.pending.take() {
            if let Err(e) = delivery.ack().await {
                let context = format!("acknowledging message {}", self.received);
                return self.fail(e.in_stage(STAGE, context)).await;
            }
        }

        if self.stage.cancel.is_cancelled() {
            return self.stop().await;
        }

        if let Some(limit) = self.limit {
            if self.received >= limit {
                info!("Consumed {} of {} messages, stopping", self.received, limit);
                return self.finish().await;
            }
        }

        if self.source.is_none() {
            if let Err(e) = self.start().await {
                let context = format!("setting up queue '{}'", self.stage.config.queue.name);
                return self.fail(e.in_stage(STAGE, context)).await;
            }
        }

        debug!("Waiting for a new message...");
        let mut delivery = match self.receive().await {
            Ok(Received::Delivery(delivery)) => delivery,
            Ok(Received::Idle) => {
                info!("No message within the idle grace period, stopping");
                return self.finish().await;
            }
            Ok(Received::Cancelled) => return self.stop().await,
            Ok(Received::Closed) => {
                let error = StageError::Broker(format!(
                    "consumer on queue '{}' was cancelled by the broker",
                    self.stage.config.queue.name
                ));
                let context = format!("waiting for message {}", self.received + 1);
                return self.fail(error.in_stage(STAGE, context)).await;
            }
            Err(e) => {
                let context = format!("waiting for message {}", self.received + 1);
                return self.fail(e.in_stage(STAGE, context)).await;
            }
        };

        self.received += 1;
        info!("Received a new message ({}). Processing...", self.received);

        let item = self
            .stage
            .codec
            .decode(&delivery.body, &delivery.properties)
            .and_then(|payload| to_item(payload, self.stage.config.key.as_deref()));

        match item {
            Ok(item) => {
                self.pending = Some(delivery);
                Some(Ok(item))
            }
            Err(e) => {
                // Leave the message to the broker to redeliver
                if let Err(reject) = delivery.reject(true).await {
                    debug!("Failed to return message {}: {}", self.received, reject);
                }
                let context = format!(
                    "decoding message {} (delivery tag {})",
                    self.received, delivery.delivery_tag
                );
                self.fail(e.in_stage(STAGE, context)).await
            }
        }
    }

    async fn start(&mut self) -> Result<()> {
        let config = &self.stage.config;
        let connection = self.session.connect(self.stage.connector.as_ref(), &config.amqp_uri).await?;
        let channel = self.session.open_channel(&connection).await?;

        if config.exchange.auto_declare {
            channel.declare_exchange(&config.exchange).await?;
            debug!("Declared exchange '{}'", config.exchange.name);
        }

        let queue = if config.queue.auto_declare {
            let state = channel.declare_queue(&config.queue).await?;
            debug!("Declared queue '{}' holding {} messages", state.name, state.message_count);
            state.name
        } else {
            config.queue.name.clone()
        };

        channel.bind_queue(&queue, &config.exchange.name, &config.routing_key).await?;
        info!(
            "Bound queue '{}' to exchange '{}' with '{}'",
            queue, config.exchange.name, config.routing_key
        );

        let consumer_tag = config
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("rustmq-amqp-{}", Uuid::new_v4()));

        let source = match config.termination {
            Termination::Limit { limit } => {
                let limit = match limit {
                    Some(limit) => Some(limit),
                    None => {
                        let depth = channel.queue_depth(&queue).await?;
                        (depth > 0).then_some(u64::from(depth))
                    }
                };
                match limit {
                    Some(limit) => info!("Consuming at most {} messages from '{}'", limit, queue),
                    None => info!("Consuming from '{}' until stopped", queue),
                }
                self.limit = limit;

                if config.ack {
                    channel.set_prefetch(config.prefetch).await?;
                }
                let feed = channel.consume(&queue, &consumer_tag, config.ack).await?;
                Source::Feed { feed, idle: None }
            }
            Termination::Idle { grace, monitor: IdleMonitor::Deadline } => {
                info!("Consuming from '{}' until idle for {:?}", queue, grace);
                if config.ack {
                    channel.set_prefetch(config.prefetch).await?;
                }
                let feed = channel.consume(&queue, &consumer_tag, config.ack).await?;
                Source::Feed { feed, idle: Some(grace) }
            }
            Termination::Idle { grace, monitor: IdleMonitor::Shadow } => {
                info!("Consuming from '{}' with a shadow monitor, grace {:?}", queue, grace);
                let mirror_connection = self.session.connect(self.stage.connector.as_ref(), &config.amqp_uri).await?;
                let mirror = self.session.open_channel(&mirror_connection).await?;
                Source::Shadow { primary: channel, mirror, queue, grace }
            }
        };

        self.source = Some(source);
        Ok(())
    }

    async fn receive(&mut self) -> Result<Received> {
        let cancel = self.stage.cancel.clone();
        let ack = self.stage.config.ack;

        match self.source.as_mut() {
            None => Ok(Received::Closed),
            Some(Source::Feed { feed, idle }) => {
                let wait = async {
                    match idle {
                        Some(grace) => tokio::time::timeout(*grace, feed.next_delivery()).await.ok(),
                        None => Some(feed.next_delivery().await),
                    }
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Ok(Received::Cancelled),
                    received = wait => match received {
                        None => Ok(Received::Idle),
                        Some(None) => Ok(Received::Closed),
                        Some(Some(delivery)) => delivery.map(Received::Delivery),
                    },
                }
            }
            Some(Source::Shadow { primary, mirror, queue, grace }) => loop {
                if let Some(delivery) = primary.get(queue, ack).await? {
                    return Ok(Received::Delivery(delivery));
                }

                let mut waited = Duration::ZERO;
                loop {
                    if waited >= *grace {
                        return Ok(Received::Idle);
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(Received::Cancelled),
                        _ = tokio::time::sleep(SHADOW_POLL_INTERVAL) => {}
                    }
                    waited += SHADOW_POLL_INTERVAL;

                    let depth = mirror.queue_depth(queue).await?;
                    if depth > 0 {
                        debug!("Mirror reports {} messages after {:?}", depth, waited);
                        break;
                    }
                }
            },
        }
    }

    async fn stop(&mut self) -> Option<Result<Item>> {
        info!("Consumer stopped. Exiting...");
        self.finish().await
    }

    async fn finish(&mut self) -> Option<Result<Item>> {
        self.done = true;
        self.source = None;
        self.session.release().await;
        None
    }

    async fn fail(&mut self, error: StageError) -> Option<Result<Item>> {
        error!("{}", error);
        self.done = true;
        self.source = None;
        self.session.release().await;
        Some(Err(error))
    }
}

/// Turn a decoded payload into an item, wrapping it under `key` if given
fn to_item(payload: Payload, key: Option<&str>) -> Result<Item> {
    let Some(key) = key else {
        return match payload {
            Payload::Value(value) => Item::from_value(value),
            Payload::Document(document) => Ok(Item::Document(document)),
            Payload::Archive(bytes) => Ok(Item::Archive(bytes)),
            Payload::Raw(bytes) => Ok(Item::Bytes(bytes)),
        };
    };

    let value = match payload {
        Payload::Value(value) => value,
        Payload::Document(document) => {
            Value::String(String::from_utf8_lossy(&document.to_bytes()).into_owned())
        }
        other => {
            return Err(StageError::TypeMismatch {
                expected: "map or document",
                found: other.kind_name(),
            })
        }
    };

    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Ok(Item::Map(map))
}

#[cfg(test)]
mod tests;
