//! Wire envelope for CRUD operation messages.
//!
//! Every record produced or consumed by this library carries a JSON body of the
//! form:
//!
//! ```json
//! { "operation": "Insert", "dto": { "id": 42, "name": "Alice" } }
//! ```
//!
//! `operation` is one of `Insert`, `Update`, `Delete` (case-sensitive) and `dto`
//! is an arbitrary object deserialized into the handler's DTO type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MessageError;

/// Operation requested by an [`OperationMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    /// All known operations.
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Insert,
        OperationKind::Update,
        OperationKind::Delete,
    ];

    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "Insert",
            OperationKind::Update => "Update",
            OperationKind::Delete => "Delete",
        }
    }

    /// Check if `value` names a known operation.
    pub fn is_valid(value: &str) -> bool {
        value.parse::<OperationKind>().is_ok()
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Insert" => Ok(OperationKind::Insert),
            "Update" => Ok(OperationKind::Update),
            "Delete" => Ok(OperationKind::Delete),
            other if other.trim().is_empty() => Err(MessageError::BlankOperation),
            other => Err(MessageError::UnknownOperation(other.to_string())),
        }
    }
}

/// Operation message as it travels on the wire.
///
/// Both fields accept `null` or may be absent at decode time so that a
/// parseable but incomplete message reaches [`OperationMessage::check_message`]
/// and fails with a typed [`MessageError`] instead of a decode error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMessage<D> {
    /// Operation to execute (`Insert`, `Update` or `Delete`)
    #[serde(default, alias = "Operation")]
    pub operation: Option<String>,

    /// DTO to process
    #[serde(alias = "Dto")]
    pub dto: Option<D>,
}

impl<D> OperationMessage<D> {
    /// Build a valid message for `operation` carrying `dto`.
    pub fn new(operation: OperationKind, dto: D) -> Self {
        Self {
            operation: Some(operation.as_str().to_string()),
            dto: Some(dto),
        }
    }

    /// Check that the message is correctly populated.
    ///
    /// Rules are applied in order and the first failure is returned:
    /// 1. `operation` is not blank
    /// 2. `operation` is a known [`OperationKind`]
    /// 3. `dto` is present
    pub fn check_message(&self) -> Result<(), MessageError> {
        self.operation_kind()?;
        if self.dto.is_none() {
            return Err(MessageError::MissingDto {
                dto_type: std::any::type_name::<D>(),
            });
        }
        Ok(())
    }

    /// Validate the message and split it into its typed parts.
    pub fn validate(self) -> Result<(OperationKind, D), MessageError> {
        let operation = self.operation_kind()?;
        match self.dto {
            Some(dto) => Ok((operation, dto)),
            None => Err(MessageError::MissingDto {
                dto_type: std::any::type_name::<D>(),
            }),
        }
    }

    fn operation_kind(&self) -> Result<OperationKind, MessageError> {
        match self.operation.as_deref() {
            Some(operation) if !operation.trim().is_empty() => operation.parse(),
            _ => Err(MessageError::BlankOperation),
        }
    }
}

impl<D: Serialize> OperationMessage<D> {
    /// Serialize the message to its JSON wire form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl<D: serde::de::DeserializeOwned> OperationMessage<D> {
    /// Deserialize a message from its JSON wire form.
    ///
    /// Decoding does not validate; call [`OperationMessage::check_message`] or
    /// [`OperationMessage::validate`] afterwards.
    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}
