//! Broker connection seam and scoped resource management.
//!
//! Stages talk to the broker only through [`Connector`], [`BrokerConnection`]
//! and [`BrokerChannel`]. Everything a stage acquires goes onto a [`Session`]
//! stack and is released in reverse acquisition order, either explicitly via
//! [`Session::release`] or, if the stage is dropped mid-flight, from `Drop`.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ExchangeConfig, QueueConfig};
use crate::error::Result;
use crate::types::{MessageProperties, OutgoingMessage};

mod amqp;
mod memory;

pub use amqp::AmqpConnector;
pub use memory::{MemoryBroker, PublishedMessage};

/// Opens physical connections to a broker
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>>;
}

/// One physical broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a logical channel multiplexed over this connection
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

/// Broker-side state of a queue after a declare
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueState {
    /// Actual queue name; server-generated when an empty name was declared
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// One logical channel
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Bound the number of unacknowledged deliveries in flight
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Switch to confirm mode; every publish then waits for broker ack/nack
    async fn enable_publisher_confirms(&self) -> Result<()>;

    async fn declare_exchange(&self, exchange: &ExchangeConfig) -> Result<()>;

    async fn declare_queue(&self, queue: &QueueConfig) -> Result<QueueState>;

    /// Ready message count of an existing queue, without consuming
    async fn queue_depth(&self, queue: &str) -> Result<u32>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Start a live delivery feed. With `ack == false` the broker considers
    /// messages settled on delivery.
    async fn consume(&self, queue: &str, consumer_tag: &str, ack: bool) -> Result<Box<dyn DeliveryStream>>;

    /// Pull a single message if one is ready
    async fn get(&self, queue: &str, ack: bool) -> Result<Option<Delivery>>;

    /// Publish a message. Returns `false` when confirms are enabled and the
    /// broker nacked or returned the message as unroutable.
    async fn publish(&self, exchange: &str, routing_key: &str, message: OutgoingMessage) -> Result<bool>;

    async fn close(&self) -> Result<()>;
}

/// Ordered feed of deliveries from a consumer
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery; `None` once the consumer was cancelled by the broker
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;
}

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A broker-delivered message
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Bytes,
    pub properties: MessageProperties,
    acker: Option<Box<dyn Acknowledger>>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .field("properties", &self.properties)
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        redelivered: bool,
        body: Bytes,
        properties: MessageProperties,
        acker: Option<Box<dyn Acknowledger>>,
    ) -> Self {
        Self { delivery_tag, redelivered, body, properties, acker }
    }

    /// Acknowledge the delivery. No-op for deliveries taken without ack.
    pub async fn ack(&mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    pub async fn reject(&mut self, requeue: bool) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.reject(requeue).await,
            None => Ok(()),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.acker.is_none()
    }
}

enum Resource {
    Connection(Arc<dyn BrokerConnection>),
    Channel(Arc<dyn BrokerChannel>),
}

impl Resource {
    async fn release(self, owner: &str) {
        let (kind, result) = match self {
            Resource::Channel(channel) => ("channel", channel.close().await),
            Resource::Connection(connection) => ("connection", connection.close().await),
        };
        match result {
            Ok(()) => debug!("{}: released {}", owner, kind),
            Err(e) => warn!("{}: failed to release {}: {}", owner, kind, e),
        }
    }
}

/// Stack of broker resources acquired by one stage invocation
pub struct Session {
    owner: &'static str,
    resources: Vec<Resource>,
}

impl Session {
    pub fn new(owner: &'static str) -> Self {
        Self { owner, resources: Vec::new() }
    }

    pub async fn connect(&mut self, connector: &dyn Connector, uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        info!("{}: connecting to {}", self.owner, redact_uri(uri));
        let connection = connector.connect(uri).await?;
        self.resources.push(Resource::Connection(connection.clone()));
        Ok(connection)
    }

    pub async fn open_channel(&mut self, connection: &Arc<dyn BrokerConnection>) -> Result<Arc<dyn BrokerChannel>> {
        let channel = connection.open_channel().await?;
        self.resources.push(Resource::Channel(channel.clone()));
        Ok(channel)
    }

    /// Release everything in reverse acquisition order. Never fails; release
    /// errors are logged.
    pub async fn release(&mut self) {
        while let Some(resource) = self.resources.pop() {
            resource.release(self.owner).await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.resources.is_empty() {
            return;
        }

        let owner = self.owner;
        let mut resources = std::mem::take(&mut self.resources);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("{}: releasing {} broker resources after drop", owner, resources.len());
                handle.spawn(async move {
                    while let Some(resource) = resources.pop() {
                        resource.release(owner).await;
                    }
                });
            }
            Err(_) => warn!(
                "{}: dropped outside a runtime, {} broker resources left to the broker to reap",
                owner,
                resources.len()
            ),
        }
    }
}

/// Hide the password component of an AMQP URI for logging
pub fn redact_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let (authority, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    match authority.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{}://{}:***@{}{}", scheme, user, host, path)
        }
        None => uri.to_string(),
    }
}
