//! Error types for the kafka-operations library.

use std::any::Any;
use std::time::Duration;

use thiserror::Error;

use crate::envelope::OperationKind;

/// Result type alias for message dispatch.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type alias for the consumer and producer services.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// A decoded `OperationMessage` that is structurally parseable but invalid.
///
/// Every variant names the offending field through [`MessageError::field`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// `operation` is missing, empty or whitespace
    #[error("The operation property cannot be empty")]
    BlankOperation,

    /// `operation` is not one of Insert, Update, Delete
    #[error("The operation property contains an invalid value '{0}'")]
    UnknownOperation(String),

    /// `dto` is missing or null
    #[error("The dto property ({dto_type}) cannot be null")]
    MissingDto { dto_type: &'static str },
}

impl MessageError {
    /// Name of the envelope field that failed validation.
    pub fn field(&self) -> &'static str {
        match self {
            MessageError::BlankOperation | MessageError::UnknownOperation(_) => "operation",
            MessageError::MissingDto { .. } => "dto",
        }
    }
}

/// Failure of the message DTO to domain DTO mapping stage.
#[derive(Error, Debug)]
#[error("Failed to map {source_type} to {target_type}: {cause}")]
pub struct MappingError {
    pub source_type: &'static str,
    pub target_type: &'static str,
    #[source]
    pub cause: anyhow::Error,
}

/// Errors surfaced to the caller of a message handler.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Envelope decoded but failed validation
    #[error("Invalid operation message: {0}")]
    Validation(#[from] MessageError),

    /// DTO mapping failed before the operation ran
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Insert/Update/Delete returned an error
    #[error("{operation} operation failed: {source}")]
    Operation {
        operation: OperationKind,
        #[source]
        source: anyhow::Error,
    },

    /// No handler registered for the record's topic
    #[error("No message handler registered for topic '{0}'")]
    UnknownTopic(String),

    /// The handler task panicked
    #[error("Message handler for topic '{topic}' panicked: {message}")]
    Panicked { topic: String, message: String },
}

/// Errors reported by the transport collaborators.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Kafka client error
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Topic does not exist
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    /// Topic creation raced with another creator
    #[error("Topic already exists: {0}")]
    TopicAlreadyExists(String),

    /// Topic creation was rejected by the broker
    #[error("Failed to create topic '{topic}': {reason}")]
    CreateTopicFailed { topic: String, reason: String },

    /// The operation was cancelled before completion
    #[error("Operation cancelled")]
    Cancelled,

    /// The transport can no longer be used
    #[error("Transport closed: {0}")]
    Closed(String),

    /// Generic error with context
    #[error("Transport error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Errors raised by the consumer and producer services.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Topic bootstrap or consume loop failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// `start` was called on a service that is already running
    #[error("Service '{0}' already started")]
    AlreadyStarted(String),

    /// The in-flight cycle did not complete before the stop deadline
    #[error("Service '{service}' did not stop within {deadline:?}")]
    StopTimedOut { service: String, deadline: Duration },
}

/// Configuration loading or validation failed.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Source could not be read or deserialized
    #[error("Configuration error: {0}")]
    Load(#[from] config::ConfigError),

    /// Values failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

/// Readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_error_fields() {
        assert_eq!(MessageError::BlankOperation.field(), "operation");
        assert_eq!(
            MessageError::UnknownOperation("Upsert".to_string()).field(),
            "operation"
        );
        assert_eq!(MessageError::MissingDto { dto_type: "User" }.field(), "dto");
    }

    #[test]
    fn test_message_error_display() {
        let err = MessageError::UnknownOperation("Upsert".to_string());
        assert_eq!(
            err.to_string(),
            "The operation property contains an invalid value 'Upsert'"
        );
    }

    #[test]
    fn test_panic_message() {
        let static_payload: Box<dyn Any + Send> = Box::new("static");
        let owned_payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other_payload: Box<dyn Any + Send> = Box::new(42u8);

        assert_eq!(panic_message(&*static_payload), "static");
        assert_eq!(panic_message(&*owned_payload), "owned");
        assert_eq!(panic_message(&*other_payload), "unknown panic payload");
    }
}
