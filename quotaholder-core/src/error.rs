use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Represents all possible errors that can occur when interacting with quotaholder storage
#[derive(Error, Debug)]
pub enum StorageError {
    /// Errors that occur with the underlying storage backend
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A guard or lock protecting storage state could not be taken
    #[error("Lock error: {0}")]
    Lock(String),

    /// The transaction was already committed or rolled back
    #[error("Transaction closed: {0}")]
    TransactionClosed(String),

    /// Generic errors that don't fit in other categories
    #[error("Other error: {0}")]
    Other(String),

    /// Anyhow error wrapper for error context
    #[error(transparent)]
    Context(#[from] anyhow::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<String> for StorageError {
    fn from(err: String) -> Self {
        StorageError::Other(err)
    }
}

impl From<&str> for StorageError {
    fn from(err: &str) -> Self {
        StorageError::Other(err.to_string())
    }
}

/// Application-level failures reported to ledger callers.
///
/// None of these are fatal to the serving process. Every ledger call runs in
/// one storage transaction, and any of these errors rolls that transaction back.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Malformed or non-canonical input
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// An internal invariant was violated; never a client mistake
    #[error("Corrupted state: {0}")]
    Corrupted(String),

    /// Capability key mismatch
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Referenced entity or holding is absent
    #[error("No such entity: {0}")]
    NoEntity(String),

    /// Source holding cannot supply the requested quantity
    #[error("Not enough quantity: {0}")]
    NoQuantity(String),

    /// Target holding cannot absorb the requested quantity
    #[error("Not enough capacity: {0}")]
    NoCapacity(String),

    #[error("Export limit exceeded: {0}")]
    ExportLimit(String),

    #[error("Import limit exceeded: {0}")]
    ImportLimit(String),

    /// A physical driver failure relayed back from a controlled call
    #[error("Physical driver error: {0}")]
    Physical(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl QuotaError {
    /// The taxonomy kind of this error, as carried on the wire
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuotaError::InvalidData(_) => ErrorKind::InvalidDataError,
            QuotaError::Corrupted(_) => ErrorKind::CorruptedError,
            QuotaError::InvalidKey(_) => ErrorKind::InvalidKeyError,
            QuotaError::NoEntity(_) => ErrorKind::NoEntityError,
            QuotaError::NoQuantity(_) => ErrorKind::NoQuantityError,
            QuotaError::NoCapacity(_) => ErrorKind::NoCapacityError,
            QuotaError::ExportLimit(_) => ErrorKind::ExportLimitError,
            QuotaError::ImportLimit(_) => ErrorKind::ImportLimitError,
            QuotaError::Physical(_) => ErrorKind::PhysicalError,
            QuotaError::Storage(_) => ErrorKind::StorageError,
        }
    }

    /// Whether this error only rejects one item of a batched call.
    ///
    /// Storage failures and corruption abort the whole call instead.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            QuotaError::Corrupted(_) | QuotaError::Storage(_) | QuotaError::Physical(_)
        )
    }

    /// The message arguments carried alongside the kind
    pub fn args(&self) -> Vec<String> {
        match self {
            QuotaError::InvalidData(m)
            | QuotaError::Corrupted(m)
            | QuotaError::InvalidKey(m)
            | QuotaError::NoEntity(m)
            | QuotaError::NoQuantity(m)
            | QuotaError::NoCapacity(m)
            | QuotaError::ExportLimit(m)
            | QuotaError::ImportLimit(m)
            | QuotaError::Physical(m) => vec![m.clone()],
            QuotaError::Storage(e) => vec![e.to_string()],
        }
    }
}

/// Wire names of the error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidDataError,
    CorruptedError,
    InvalidKeyError,
    NoEntityError,
    NoQuantityError,
    NoCapacityError,
    ExportLimitError,
    ImportLimitError,
    /// The storage backend failed; not caused by the request contents
    StorageError,
    /// A physical driver failed while the controller was driving it
    PhysicalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidDataError => "InvalidDataError",
            ErrorKind::CorruptedError => "CorruptedError",
            ErrorKind::InvalidKeyError => "InvalidKeyError",
            ErrorKind::NoEntityError => "NoEntityError",
            ErrorKind::NoQuantityError => "NoQuantityError",
            ErrorKind::NoCapacityError => "NoCapacityError",
            ErrorKind::ExportLimitError => "ExportLimitError",
            ErrorKind::ImportLimitError => "ImportLimitError",
            ErrorKind::StorageError => "StorageError",
            ErrorKind::PhysicalError => "PhysicalError",
        };
        f.write_str(name)
    }
}

/// Serialized form of a failed call: `{kind, args}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub args: Vec<String>,
}

impl ErrorResponse {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            args: vec![message.into()],
        }
    }

    /// Rebuild the specific error on the client side of a call
    pub fn into_error(self) -> QuotaError {
        let message = self.args.join(": ");
        match self.kind {
            ErrorKind::InvalidDataError => QuotaError::InvalidData(message),
            ErrorKind::CorruptedError => QuotaError::Corrupted(message),
            ErrorKind::InvalidKeyError => QuotaError::InvalidKey(message),
            ErrorKind::NoEntityError => QuotaError::NoEntity(message),
            ErrorKind::NoQuantityError => QuotaError::NoQuantity(message),
            ErrorKind::NoCapacityError => QuotaError::NoCapacity(message),
            ErrorKind::ExportLimitError => QuotaError::ExportLimit(message),
            ErrorKind::ImportLimitError => QuotaError::ImportLimit(message),
            ErrorKind::StorageError => QuotaError::Storage(StorageError::Other(message)),
            ErrorKind::PhysicalError => QuotaError::Physical(message),
        }
    }
}

impl From<&QuotaError> for ErrorResponse {
    fn from(err: &QuotaError) -> Self {
        Self {
            kind: err.kind(),
            args: err.args(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.args.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_preserves_kind() {
        let err = QuotaError::NoQuantity("system.cpu".to_string());
        let response = ErrorResponse::from(&err);
        assert_eq!(response.kind, ErrorKind::NoQuantityError);
        assert_eq!(response.args, vec!["system.cpu".to_string()]);

        match response.into_error() {
            QuotaError::NoQuantity(m) => assert_eq!(m, "system.cpu"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_every_kind_survives_the_wire() {
        let kinds = [
            ErrorKind::InvalidDataError,
            ErrorKind::CorruptedError,
            ErrorKind::InvalidKeyError,
            ErrorKind::NoEntityError,
            ErrorKind::NoQuantityError,
            ErrorKind::NoCapacityError,
            ErrorKind::ExportLimitError,
            ErrorKind::ImportLimitError,
            ErrorKind::StorageError,
            ErrorKind::PhysicalError,
        ];
        for kind in kinds {
            let err = ErrorResponse::new(kind, "alice.cpu").into_error();
            assert_eq!(err.kind(), kind);
            assert_eq!(ErrorResponse::from(&err).kind, kind);
        }

        let err = ErrorResponse::new(ErrorKind::PhysicalError, "disk offline").into_error();
        assert!(matches!(err, QuotaError::Physical(ref m) if m == "disk offline"));
        assert!(!err.is_rejection());
    }

    #[test]
    fn test_error_response_wire_shape() {
        let response = ErrorResponse::new(ErrorKind::InvalidKeyError, "alice");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["kind"], "InvalidKeyError");
        assert_eq!(json["args"][0], "alice");

        let decoded: ErrorResponse = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_storage_errors_are_not_client_errors() {
        let err: QuotaError = StorageError::Database("disk full".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::StorageError);
        assert!(!err.is_rejection());
        assert!(QuotaError::InvalidKey("alice".to_string()).is_rejection());
        assert!(!QuotaError::Corrupted("holding".to_string()).is_rejection());
    }
}
