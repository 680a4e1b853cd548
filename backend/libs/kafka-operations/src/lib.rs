//! # Kafka CRUD operation messaging
//!
//! Building blocks for services that replicate data over Kafka with a small
//! CRUD envelope:
//!
//! ```json
//! { "operation": "Insert" | "Update" | "Delete", "dto": { ... } }
//! ```
//!
//! ## Components
//!
//! - [`envelope`]: the wire envelope, its validation rules and JSON codec
//! - [`handler`]: decode, validate and route a record to insert/update/delete,
//!   optionally mapping the message DTO to a domain DTO first
//! - [`consumer::ConsumerService`]: creates missing topics, then consumes and
//!   dispatches every record to a fresh handler on its own task
//! - [`producer::PeriodicProducer`]: runs a produce batch on a single-shot
//!   timer that is rearmed only after the previous batch completed
//! - [`producer::SignalDrivenProducer`]: runs a produce batch on start and
//!   again each time an external subscription signals new work
//! - [`transport`]: producer, consumer and topic admin traits with an
//!   in-memory broker and, behind the `kafka` feature, rdkafka clients
//!
//! ## Consuming
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use kafka_operations::consumer::ConsumerService;
//! use kafka_operations::handler::{OperationHandler, OperationMessageHandler, TopicHandlerRegistry};
//! use kafka_operations::transport::memory::InMemoryBroker;
//! use serde::Deserialize;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Deserialize)]
//! struct ProductDto {
//!     id: u64,
//!     name: String,
//! }
//!
//! #[derive(Clone)]
//! struct ProductStore;
//!
//! #[async_trait]
//! impl OperationHandler<ProductDto> for ProductStore {
//!     async fn insert(&self, dto: ProductDto, _cancel: &CancellationToken) -> anyhow::Result<()> {
//!         println!("insert {} {}", dto.id, dto.name);
//!         Ok(())
//!     }
//!
//!     async fn update(&self, dto: ProductDto, _cancel: &CancellationToken) -> anyhow::Result<()> {
//!         println!("update {}", dto.id);
//!         Ok(())
//!     }
//!
//!     async fn delete(&self, dto: ProductDto, _cancel: &CancellationToken) -> anyhow::Result<()> {
//!         println!("delete {}", dto.id);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new();
//! let registry = TopicHandlerRegistry::new().register("products", || {
//!     OperationMessageHandler::<ProductDto, _>::new(ProductStore)
//! });
//!
//! let service = ConsumerService::new(
//!     Arc::new(broker.clone()),
//!     Arc::new(broker),
//!     Arc::new(registry),
//!     vec!["products".to_string()],
//! );
//!
//! let cancel = CancellationToken::new();
//! service.run(cancel).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error handling
//!
//! - blank or undecodable payloads are logged and discarded
//! - decoded but invalid envelopes fail with [`HandlerError::Validation`]
//! - insert/update/delete errors propagate from the handler; the consumer and
//!   the schedulers log and count them and keep going
//! - fatal transport errors end [`consumer::ConsumerService::run`]

pub mod config;
pub mod consumer;
pub mod envelope;
mod error;
pub mod handler;
pub mod metrics;
pub mod producer;
pub mod telemetry;
pub mod transport;

pub use envelope::{OperationKind, OperationMessage};
pub use error::{
    ConfigError, HandlerError, HandlerResult, MappingError, MessageError, ServiceError,
    ServiceResult, TransportError, TransportResult,
};
