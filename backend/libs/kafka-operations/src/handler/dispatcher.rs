use std::any::type_name;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DispatchOutcome, DtoMapper, MappedOperationHandler, MessageHandler, OperationHandler};
use crate::envelope::{OperationKind, OperationMessage};
use crate::error::{HandlerError, HandlerResult, MappingError};

/// Decodes `OperationMessage<D>` payloads and routes them to an
/// [`OperationHandler<D>`].
///
/// - blank payloads are logged and discarded
/// - payloads that fail to decode are logged and discarded
/// - decoded but invalid envelopes fail with [`HandlerError::Validation`]
/// - errors from insert/update/delete propagate to the caller
pub struct OperationMessageHandler<D, H> {
    handler: H,
    _dto: PhantomData<fn() -> D>,
}

impl<D, H> OperationMessageHandler<D, H>
where
    D: DeserializeOwned + Send + 'static,
    H: OperationHandler<D>,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _dto: PhantomData,
        }
    }

    /// The wrapped operation handler.
    pub fn inner(&self) -> &H {
        &self.handler
    }

    async fn execute(
        &self,
        operation: OperationKind,
        dto: D,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        match operation {
            OperationKind::Insert => self.handler.insert(dto, cancel).await,
            OperationKind::Update => self.handler.update(dto, cancel).await,
            OperationKind::Delete => self.handler.delete(dto, cancel).await,
        }
    }
}

impl<S, T, M, H> OperationMessageHandler<S, MappedOperationHandler<S, T, M, H>>
where
    S: DeserializeOwned + Send + 'static,
    T: Send + 'static,
    M: DtoMapper<S, T>,
    H: OperationHandler<T>,
{
    /// Dispatcher that maps each message DTO `S` to a domain DTO `T` before
    /// calling `handler`.
    pub fn with_mapper(mapper: M, handler: H) -> Self {
        Self::new(MappedOperationHandler::new(mapper, handler))
    }
}

#[async_trait]
impl<D, H> MessageHandler for OperationMessageHandler<D, H>
where
    D: DeserializeOwned + Send + 'static,
    H: OperationHandler<D>,
{
    async fn on_message_received(
        &self,
        key: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> HandlerResult<DispatchOutcome> {
        let dto_type = type_name::<D>();

        if message.trim().is_empty() {
            error!(key = %key, "OperationMessage is empty or whitespace, discarding");
            return Ok(DispatchOutcome::DiscardedBlank);
        }

        debug!(key = %key, dto_type, payload = %message, "Decoding OperationMessage");

        let decoded = match OperationMessage::<D>::decode(message) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(
                    key = %key,
                    dto_type,
                    error = %e,
                    "Failed to deserialize OperationMessage, discarding"
                );
                return Ok(DispatchOutcome::DiscardedMalformed);
            }
        };

        let (operation, dto) = decoded.validate().map_err(|e| {
            warn!(key = %key, field = e.field(), error = %e, "Invalid OperationMessage");
            HandlerError::Validation(e)
        })?;

        info!(key = %key, operation = %operation, dto_type, "Executing operation");

        self.execute(operation, dto, cancel)
            .await
            .map_err(|source| operation_error(operation, source))?;

        info!(key = %key, operation = %operation, "Operation completed successfully");

        Ok(DispatchOutcome::Executed(operation))
    }
}

fn operation_error(operation: OperationKind, source: anyhow::Error) -> HandlerError {
    match source.downcast::<MappingError>() {
        Ok(mapping) => HandlerError::Mapping(mapping),
        Err(source) => HandlerError::Operation { operation, source },
    }
}
