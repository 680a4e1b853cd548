use std::any::type_name;
use std::marker::PhantomData;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::OperationHandler;
use crate::envelope::OperationKind;
use crate::error::MappingError;

/// Pure conversion from a message DTO `S` to a domain DTO `T`.
///
/// Any `Fn(S) -> anyhow::Result<T>` closure is a mapper.
pub trait DtoMapper<S, T>: Send + Sync {
    fn map(&self, source: S) -> anyhow::Result<T>;
}

impl<S, T, F> DtoMapper<S, T> for F
where
    F: Fn(S) -> anyhow::Result<T> + Send + Sync,
{
    fn map(&self, source: S) -> anyhow::Result<T> {
        self(source)
    }
}

/// [`OperationHandler<S>`] that maps every DTO to `T` and forwards the same
/// operation to an [`OperationHandler<T>`].
///
/// The mapping performs no validation. A mapping failure is returned as a
/// [`MappingError`] and the inner handler is not called.
pub struct MappedOperationHandler<S, T, M, H> {
    mapper: M,
    handler: H,
    _types: PhantomData<fn(S) -> T>,
}

impl<S, T, M, H> MappedOperationHandler<S, T, M, H>
where
    S: Send + 'static,
    T: Send + 'static,
    M: DtoMapper<S, T>,
    H: OperationHandler<T>,
{
    pub fn new(mapper: M, handler: H) -> Self {
        Self {
            mapper,
            handler,
            _types: PhantomData,
        }
    }

    /// The domain handler.
    pub fn inner(&self) -> &H {
        &self.handler
    }

    fn map_dto(&self, source: S, operation: OperationKind) -> Result<T, MappingError> {
        let source_type = type_name::<S>();
        let target_type = type_name::<T>();

        info!(
            source_type,
            target_type,
            operation = %operation,
            "Mapping message DTO to domain DTO"
        );

        self.mapper.map(source).map_err(|cause| MappingError {
            source_type,
            target_type,
            cause,
        })
    }
}

#[async_trait]
impl<S, T, M, H> OperationHandler<S> for MappedOperationHandler<S, T, M, H>
where
    S: Send + 'static,
    T: Send + 'static,
    M: DtoMapper<S, T>,
    H: OperationHandler<T>,
{
    async fn insert(&self, dto: S, cancel: &CancellationToken) -> anyhow::Result<()> {
        let domain = self.map_dto(dto, OperationKind::Insert)?;
        self.handler.insert(domain, cancel).await
    }

    async fn update(&self, dto: S, cancel: &CancellationToken) -> anyhow::Result<()> {
        let domain = self.map_dto(dto, OperationKind::Update)?;
        self.handler.update(domain, cancel).await
    }

    async fn delete(&self, dto: S, cancel: &CancellationToken) -> anyhow::Result<()> {
        let domain = self.map_dto(dto, OperationKind::Delete)?;
        self.handler.delete(domain, cancel).await
    }
}
