//! In-process broker with AMQP 0-9-1 routing semantics.
//!
//! Supports the default, direct, fanout and topic exchanges (`*` matches one
//! word, `#` zero or more), per-channel prefetch, acknowledgments with
//! requeue on channel close, passive declares and publisher confirms with
//! mandatory-style unroutable detection. `durable`, `auto_delete` and
//! `exclusive` are accepted but not enforced.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use super::{
    Acknowledger, BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream, QueueState,
};
use crate::config::{ExchangeConfig, QueueConfig};
use crate::error::{Result, StageError};
use crate::types::{ExchangeKind, MessageProperties, OutgoingMessage};

/// Record of every publish that reached the broker
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutgoingMessage,
    pub routed: bool,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Bytes,
    properties: MessageProperties,
    redelivered: bool,
}

#[derive(Default)]
struct QueueData {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, (u64, StoredMessage)>,
    acked: u64,
    notify: Arc<Notify>,
}

struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

struct ChannelData {
    connection: u64,
    prefetch: Option<u16>,
    in_flight: usize,
    confirms: bool,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueData>,
    bindings: Vec<Binding>,
    connections: HashSet<u64>,
    channels: HashMap<u64, ChannelData>,
    published: Vec<PublishedMessage>,
    unavailable: Option<String>,
    next_id: u64,
    connections_opened: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn queue(&self, name: &str) -> Result<&QueueData> {
        self.queues
            .get(name)
            .ok_or_else(|| StageError::Declaration(format!("NOT_FOUND - no queue '{}'", name)))
    }

    fn channel(&mut self, id: u64) -> Result<&mut ChannelData> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| StageError::Broker(format!("channel {} is closed", id)))
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        let kind = self.exchanges.get(exchange).ok_or_else(|| {
            StageError::Broker(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let mut queues: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind {
                ExchangeKind::Direct => binding.pattern == routing_key,
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Topic => topic_matches(&binding.pattern, routing_key),
            };
            if matched && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        Ok(queues)
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        if let Some(data) = self.queues.get_mut(queue) {
            data.ready.push_back(message);
            data.notify.notify_waiters();
        }
    }

    fn close_channel(&mut self, id: u64) {
        if self.channels.remove(&id).is_none() {
            return;
        }

        for data in self.queues.values_mut() {
            let mut returned: Vec<(u64, StoredMessage)> = data
                .unacked
                .iter()
                .filter(|(_, (channel, _))| *channel == id)
                .map(|(tag, (_, message))| (*tag, message.clone()))
                .collect();
            if returned.is_empty() {
                continue;
            }
            returned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            for (tag, mut message) in returned {
                data.unacked.remove(&tag);
                message.redelivered = true;
                data.ready.push_front(message);
            }
        }

        // Wake consumers so they observe the closed channel
        for data in self.queues.values() {
            data.notify.notify_waiters();
        }
    }

    fn take_ready(&mut self, queue: &str, channel_id: u64, ack: bool, respect_prefetch: bool) -> Result<Option<Delivery>> {
        let tag = self.next_id();
        let State { queues, channels, .. } = self;

        let channel = channels
            .get_mut(&channel_id)
            .ok_or_else(|| StageError::Broker(format!("channel {} is closed", channel_id)))?;
        if ack && respect_prefetch {
            if let Some(limit) = channel.prefetch {
                if channel.in_flight >= limit as usize {
                    return Ok(None);
                }
            }
        }

        let data = queues
            .get_mut(queue)
            .ok_or_else(|| StageError::Broker(format!("NOT_FOUND - no queue '{}'", queue)))?;
        let Some(message) = data.ready.pop_front() else {
            return Ok(None);
        };

        if ack {
            data.unacked.insert(tag, (channel_id, message.clone()));
            channel.in_flight += 1;
        } else {
            data.acked += 1;
        }

        // The acker is attached by the caller, which owns a broker handle
        Ok(Some(Delivery::new(tag, message.redelivered, message.body, message.properties, None)))
    }
}

/// `*` matches exactly one dot-separated word, `#` zero or more
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() { Vec::new() } else { routing_key.split('.').collect() };
    matches(&pattern, &key)
}

/// In-process broker; clones share state
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("connections", &state.connections.len())
            .field("channels", &state.channels.len())
            .finish()
    }
}

impl MemoryBroker {
    /// A broker with the standard pre-declared exchanges
    pub fn new() -> Self {
        let mut state = State::default();
        for (name, kind) in [
            ("", ExchangeKind::Direct),
            ("amq.direct", ExchangeKind::Direct),
            ("amq.fanout", ExchangeKind::Fanout),
            ("amq.headers", ExchangeKind::Headers),
            ("amq.topic", ExchangeKind::Topic),
        ] {
            state.exchanges.insert(name.to_string(), kind);
        }
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Refuse new connections with the given reason, or accept them again
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.state.lock().unavailable = reason.map(str::to_string);
    }

    pub fn declare_queue(&self, name: &str) {
        self.state.lock().queues.entry(name.to_string()).or_default();
    }

    /// Delete a queue with its bindings; consumers on it see their feed end
    pub fn delete_queue(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        let Some(data) = state.queues.remove(name) else {
            return false;
        };
        state.bindings.retain(|b| b.queue != name);
        data.notify.notify_waiters();
        true
    }

    pub fn bind(&self, queue: &str, exchange: &str, pattern: &str) {
        let mut state = self.state.lock();
        state.queues.entry(queue.to_string()).or_default();
        state.bindings.push(Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        });
    }

    /// Publish from outside any channel; returns the number of queues reached
    pub fn inject(&self, exchange: &str, routing_key: &str, message: OutgoingMessage) -> Result<usize> {
        let mut state = self.state.lock();
        let queues = state.route(exchange, routing_key)?;
        for queue in &queues {
            state.enqueue(
                queue,
                StoredMessage { body: message.body.clone(), properties: message.properties.clone(), redelivered: false },
            );
        }
        Ok(queues.len())
    }

    /// Put a message straight onto a queue, creating it if needed
    pub fn enqueue(&self, queue: &str, message: OutgoingMessage) {
        let mut state = self.state.lock();
        state.queues.entry(queue.to_string()).or_default();
        state.enqueue(
            queue,
            StoredMessage { body: message.body, properties: message.properties, redelivered: false },
        );
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.state.lock().exchanges.get(exchange).copied()
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, pattern: &str) -> bool {
        self.state
            .lock()
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern)
    }

    /// Ready (undelivered) messages
    pub fn depth(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Delivered but not yet acknowledged
    pub fn unacked(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Settled deliveries (acked, or taken without ack)
    pub fn acked(&self, queue: &str) -> u64 {
        self.state.lock().queues.get(queue).map_or(0, |q| q.acked)
    }

    /// Bodies waiting in a queue, in delivery order
    pub fn queued_bodies(&self, queue: &str) -> Vec<Bytes> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Drain the publish record. Long-lived embedders call this to keep it bounded.
    pub fn take_published(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut self.state.lock().published)
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Connections ever opened
    pub fn connections_opened(&self) -> u64 {
        self.state.lock().connections_opened
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.unavailable {
            return Err(StageError::Connection(reason.clone()));
        }
        if !(uri.starts_with("amqp://") || uri.starts_with("amqps://")) {
            return Err(StageError::Connection(format!("unsupported broker URI scheme: {}", uri)));
        }

        let id = state.next_id();
        state.connections.insert(id);
        state.connections_opened += 1;
        debug!("memory broker: connection {} opened", id);
        Ok(Arc::new(MemoryConnection { broker: self.clone(), id }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.state.lock();
        if !state.connections.contains(&self.id) {
            return Err(StageError::Broker(format!("connection {} is closed", self.id)));
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelData { connection: self.id, prefetch: None, in_flight: 0, confirms: false },
        );
        Ok(Arc::new(MemoryChannel { broker: self.broker.clone(), id }))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state.lock();
        if !state.connections.remove(&self.id) {
            return Ok(());
        }

        let channels: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.connection == self.id)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            state.close_channel(channel);
        }
        debug!("memory broker: connection {} closed", self.id);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.channel(self.id)?.prefetch = (count > 0).then_some(count);
        Ok(())
    }

    async fn enable_publisher_confirms(&self) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.channel(self.id)?.confirms = true;
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &ExchangeConfig) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.channel(self.id)?;

        match state.exchanges.get(&exchange.name) {
            Some(kind) if *kind != exchange.kind => Err(StageError::Declaration(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                exchange.name,
                exchange.kind.as_str(),
                kind.as_str()
            ))),
            Some(_) => Ok(()),
            None if exchange.passive => Err(StageError::Declaration(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange.name
            ))),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueConfig) -> Result<QueueState> {
        let mut state = self.broker.state.lock();
        state.channel(self.id)?;

        let name = if queue.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            queue.name.clone()
        };

        if queue.passive {
            state.queue(&name)?;
        }
        let data = state.queues.entry(name.clone()).or_default();

        Ok(QueueState { name, message_count: data.ready.len() as u32, consumer_count: 0 })
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32> {
        let mut state = self.broker.state.lock();
        state.channel(self.id)?;
        Ok(state.queue(queue)?.ready.len() as u32)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.state.lock();
        state.channel(self.id)?;

        if !state.exchanges.contains_key(exchange) {
            return Err(StageError::Declaration(format!("NOT_FOUND - no exchange '{}'", exchange)));
        }
        state.queue(queue)?;

        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == routing_key);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str, ack: bool) -> Result<Box<dyn DeliveryStream>> {
        let mut state = self.broker.state.lock();
        state.channel(self.id)?;
        state.queue(queue).map_err(|e| StageError::Broker(e.to_string()))?;

        Ok(Box::new(MemoryDeliveries {
            broker: self.broker.clone(),
            channel: self.id,
            queue: queue.to_string(),
            ack,
        }))
    }

    async fn get(&self, queue: &str, ack: bool) -> Result<Option<Delivery>> {
        let delivery = self.broker.state.lock().take_ready(queue, self.id, ack, false)?;
        Ok(delivery.map(|d| self.broker.attach_acker(d, self.id, queue, ack)))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: OutgoingMessage) -> Result<bool> {
        let mut state = self.broker.state.lock();
        let confirms = state.channel(self.id)?.confirms;
        let queues = state.route(exchange, routing_key)?;

        for queue in &queues {
            state.enqueue(
                queue,
                StoredMessage {
                    body: message.body.clone(),
                    properties: message.properties.clone(),
                    redelivered: false,
                },
            );
        }

        let routed = !queues.is_empty();
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message,
            routed,
        });

        Ok(routed || !confirms)
    }

    async fn close(&self) -> Result<()> {
        self.broker.state.lock().close_channel(self.id);
        Ok(())
    }
}

impl MemoryBroker {
    fn attach_acker(&self, delivery: Delivery, channel: u64, queue: &str, ack: bool) -> Delivery {
        if !ack {
            return delivery;
        }
        let acker = MemoryAcker {
            broker: self.clone(),
            channel,
            queue: queue.to_string(),
            tag: delivery.delivery_tag,
        };
        Delivery::new(
            delivery.delivery_tag,
            delivery.redelivered,
            delivery.body,
            delivery.properties,
            Some(Box::new(acker)),
        )
    }
}

struct MemoryDeliveries {
    broker: MemoryBroker,
    channel: u64,
    queue: String,
    ack: bool,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveries {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        loop {
            let notify = {
                let state = self.broker.state.lock();
                if !state.channels.contains_key(&self.channel) {
                    return None;
                }
                match state.queues.get(&self.queue) {
                    Some(data) => data.notify.clone(),
                    None => return None,
                }
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let taken = self.broker.state.lock().take_ready(&self.queue, self.channel, self.ack, true);
            match taken {
                Ok(Some(delivery)) => {
                    return Some(Ok(self.broker.attach_acker(delivery, self.channel, &self.queue, self.ack)))
                }
                Ok(None) => {}
                Err(_) => return None,
            }

            notified.await;
        }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    channel: u64,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<()> {
        let mut state = self.broker.state.lock();
        let State { queues, channels, .. } = &mut *state;

        let channel = channels
            .get_mut(&self.channel)
            .ok_or_else(|| StageError::Broker(format!("channel {} is closed", self.channel)))?;
        let data = queues
            .get_mut(&self.queue)
            .ok_or_else(|| StageError::Broker(format!("NOT_FOUND - no queue '{}'", self.queue)))?;
        let (_, mut message) = data.unacked.remove(&self.tag).ok_or_else(|| {
            StageError::Broker(format!("PRECONDITION_FAILED - unknown delivery tag {}", self.tag))
        })?;

        channel.in_flight = channel.in_flight.saturating_sub(1);
        match requeue {
            None => data.acked += 1,
            Some(true) => {
                message.redelivered = true;
                data.ready.push_front(message);
            }
            Some(false) => {}
        }
        data.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(None)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("*", "orders"));
        assert!(!topic_matches("*", "orders.created"));
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("orders.#", "orders.eu.created"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "invoices.created"));
        assert!(!topic_matches("*.created", "invoices.updated"));
    }

    #[test]
    fn test_inject_routes_through_bindings() {
        let broker = MemoryBroker::new();
        broker.bind("orders", "amq.topic", "orders.*");
        broker.bind("audit", "amq.topic", "#");

        let message = OutgoingMessage { body: Bytes::from_static(b"{}"), properties: MessageProperties::default() };
        assert_eq!(broker.inject("amq.topic", "orders.created", message.clone()).unwrap(), 2);
        assert_eq!(broker.inject("amq.topic", "invoices.created", message.clone()).unwrap(), 1);
        assert_eq!(broker.inject("", "orders", message.clone()).unwrap(), 1);
        assert!(broker.inject("missing", "x", message).is_err());

        assert_eq!(broker.depth("orders"), 2);
        assert_eq!(broker.depth("audit"), 2);
    }
}
