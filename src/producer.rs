//! Producer stage: pipeline items in, broker messages out.
//!
//! Every upstream item is tested against the stage's [`Predicate`]; accepted
//! items are encoded and published, and every item is re-emitted unchanged
//! either way. With publisher confirms enabled an unroutable message is a
//! fatal [`StageError::NoRoute`].

use futures::StreamExt;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::codec::{FormatCodec, Payload};
use crate::condition::{Always, FieldCondition, Predicate};
use crate::config::{ProducerConfig, Projection, StageOptions};
use crate::connection::{AmqpConnector, BrokerChannel, Connector, Session};
use crate::error::{Result, StageError};
use crate::stage::{ItemStream, Stage};
use crate::types::Item;

const STAGE: &str = "producer";

/// Publishes items to an AMQP exchange
pub struct ProducerStage {
    config: ProducerConfig,
    connector: Arc<dyn Connector>,
    codec: Arc<FormatCodec>,
    predicate: Arc<dyn Predicate>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ProducerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerStage")
            .field("config", &self.config)
            .field("codec", &self.codec)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ProducerStage {
    /// Build a stage; a configured `condition` expression becomes the predicate
    pub fn new(config: ProducerConfig) -> Result<Self> {
        let predicate: Arc<dyn Predicate> = match &config.condition {
            Some(expression) => Arc::new(FieldCondition::parse(expression)?),
            None => Arc::new(Always),
        };

        Ok(Self {
            config,
            connector: Arc::new(AmqpConnector::new().with_connection_name("rustmq-amqp producer")),
            codec: Arc::new(FormatCodec::with_builtins()),
            predicate,
            cancel: CancellationToken::new(),
        })
    }

    pub fn from_options(options: &StageOptions) -> Result<Self> {
        Self::new(ProducerConfig::from_options(options)?)
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_codec(mut self, codec: FormatCodec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Replace the predicate deciding which items get published
    pub fn with_predicate<P: Predicate + 'static>(mut self, predicate: P) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Splice the stage after `previous`
    pub fn run(self, previous: ItemStream) -> ItemStream {
        let run = ProducerRun {
            stage: self,
            upstream: previous,
            session: Session::new(STAGE),
            channel: None,
            seen: 0,
            published: 0,
            done: false,
        };

        futures::stream::unfold(run, |mut run| async move {
            let next = run.next().await;
            next.map(|item| (item, run))
        })
        .boxed()
    }
}

impl Stage for ProducerStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn run(self: Box<Self>, previous: ItemStream) -> ItemStream {
        ProducerStage::run(*self, previous)
    }
}

struct ProducerRun {
    stage: ProducerStage,
    upstream: ItemStream,
    session: Session,
    channel: Option<Arc<dyn BrokerChannel>>,
    seen: u64,
    published: u64,
    done: bool,
}

impl ProducerRun {
    async fn next(&mut self) -> Option<Result<Item>> {
        if self.done {
            return None;
        }

        if self.stage.cancel.is_cancelled() {
            info!("Producer stopped after publishing {} of {} items", self.published, self.seen);
            return self.finish().await;
        }

        if self.channel.is_none() {
            if let Err(e) = self.start().await {
                let context = format!("connecting to exchange '{}'", self.stage.config.exchange.name);
                return self.fail(e.in_stage(STAGE, context)).await;
            }
        }
        let Some(channel) = self.channel.clone() else {
            return self.finish().await;
        };

        let cancel = self.stage.cancel.clone();
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Producer stopped after publishing {} of {} items", self.published, self.seen);
                return self.finish().await;
            }
            next = self.upstream.next() => next,
        };

        let item = match next {
            Some(Ok(item)) => item,
            Some(Err(e)) => return self.fail(e).await,
            None => {
                info!("Published {} of {} items", self.published, self.seen);
                return self.finish().await;
            }
        };
        self.seen += 1;

        if !self.stage.predicate.test(&item) {
            debug!("Item {} rejected by condition, passing through", self.seen);
            return Some(Ok(item));
        }

        if let Err(e) = publish(&self.stage, channel.as_ref(), &item).await {
            let config = &self.stage.config;
            let context = format!(
                "publishing {} item {} to '{}' with routing key '{}'",
                item.kind(),
                self.seen,
                config.exchange.name,
                config.routing_key
            );
            return self.fail(e.in_stage(STAGE, context)).await;
        }
        self.published += 1;
        debug!("Published item {} ({})", self.seen, item.kind());

        Some(Ok(item))
    }

    async fn start(&mut self) -> Result<()> {
        let config = &self.stage.config;
        let connection = self.session.connect(self.stage.connector.as_ref(), &config.amqp_uri).await?;
        let channel = self.session.open_channel(&connection).await?;

        if config.publisher_confirms {
            channel.enable_publisher_confirms().await?;
            debug!("Publisher confirms enabled");
        }

        if config.exchange.auto_declare {
            channel.declare_exchange(&config.exchange).await?;
            debug!("Declared exchange '{}'", config.exchange.name);
        }

        if let Some(queue) = &config.queue {
            let name = if queue.auto_declare {
                channel.declare_queue(queue).await?.name
            } else {
                queue.name.clone()
            };
            channel.bind_queue(&name, &config.exchange.name, &config.routing_key).await?;
            info!(
                "Bound queue '{}' to exchange '{}' with '{}'",
                name, config.exchange.name, config.routing_key
            );
        }

        self.channel = Some(channel);
        Ok(())
    }

    async fn finish(&mut self) -> Option<Result<Item>> {
        self.done = true;
        self.channel = None;
        self.session.release().await;
        None
    }

    async fn fail(&mut self, error: StageError) -> Option<Result<Item>> {
        error!("{}", error);
        self.done = true;
        self.channel = None;
        self.session.release().await;
        Some(Err(error))
    }
}

async fn publish(stage: &ProducerStage, channel: &dyn BrokerChannel, item: &Item) -> Result<()> {
    let config = &stage.config;
    let payload = payload(item, &config.projection)?;
    let message = stage.codec.encode(&payload, &config.serializer)?;

    let routed = channel.publish(&config.exchange.name, &config.routing_key, message).await?;
    if !routed {
        return Err(StageError::NoRoute {
            exchange: config.exchange.name.clone(),
            routing_key: config.routing_key.clone(),
        });
    }
    Ok(())
}

/// Resolve what gets encoded for an item. Projection only applies to maps;
/// documents, archives and raw bytes are published whole.
fn payload(item: &Item, projection: &Projection) -> Result<Payload> {
    Ok(match item {
        Item::Map(map) => Payload::Value(project(map, projection)?),
        Item::Document(document) => Payload::Document(document.clone()),
        Item::Archive(bytes) => Payload::Archive(bytes.clone()),
        Item::Bytes(bytes) => Payload::Raw(bytes.clone()),
    })
}

fn project(map: &Map<String, Value>, projection: &Projection) -> Result<Value> {
    match projection {
        Projection::Whole => Ok(Value::Object(map.clone())),
        Projection::Key(key) => map
            .get(key)
            .cloned()
            .ok_or_else(|| StageError::MissingField(key.clone())),
        Projection::Keys(keys) => {
            let mut projected = Map::new();
            for key in keys {
                let value = map.get(key).ok_or_else(|| StageError::MissingField(key.clone()))?;
                projected.insert(key.clone(), value.clone());
            }
            Ok(Value::Object(projected))
        }
        Projection::FieldNames(Some(names)) => Ok(Value::Object(
            names
                .iter()
                .filter_map(|name| map.get(name).map(|value| (name.clone(), value.clone())))
                .collect(),
        )),
        Projection::FieldNames(None) => Ok(Value::Object(
            map.iter()
                .filter(|(name, _)| !name.starts_with('_'))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        )),
    }
}
