//! RustMQ AMQP stages
//!
//! Consumer and producer stages bridging item pipelines to an AMQP 0-9-1 broker.

pub mod codec;
pub mod condition;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod producer;
pub mod stage;
pub mod types;

pub use codec::{Format, FormatCodec, Payload};
pub use condition::{Always, FieldCondition, Predicate};
pub use config::{
    ConsumerConfig, ExchangeConfig, IdleMonitor, OptionValue, ProducerConfig, Projection,
    QueueConfig, ResourceOptions, StageOptions, Termination,
};
pub use connection::{AmqpConnector, Connector, MemoryBroker};
pub use consumer::ConsumerStage;
pub use error::{Result, StageError};
pub use producer::ProducerStage;
pub use stage::{ItemStream, Stage};
pub use types::*;
