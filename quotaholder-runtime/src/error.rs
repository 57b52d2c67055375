use quotaholder_core::error::{ErrorKind, ErrorResponse, QuotaError, StorageError};
use thiserror::Error;

/// Failures of the controller saga
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The ledger refused or failed a call
    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// The physical driver failed; the row stays as it was for the next poll
    #[error("Physical driver error: {0:#}")]
    Physical(anyhow::Error),

    /// The row lock could not be read or written
    #[error("Lock error: {0}")]
    Lock(String),

    /// A physical description could not be encoded
    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<StorageError> for ControllerError {
    fn from(err: StorageError) -> Self {
        ControllerError::Quota(QuotaError::Storage(err))
    }
}

impl ControllerError {
    /// Wire form of this error
    pub fn to_response(&self) -> ErrorResponse {
        match self {
            ControllerError::Quota(err) => ErrorResponse::from(err),
            ControllerError::Physical(err) => {
                ErrorResponse::new(ErrorKind::PhysicalError, format!("{:#}", err))
            }
            ControllerError::Lock(msg) => ErrorResponse::new(ErrorKind::StorageError, msg.clone()),
            ControllerError::Codec(msg) => {
                ErrorResponse::new(ErrorKind::InvalidDataError, msg.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_kinds() {
        let err = ControllerError::from(QuotaError::NoCapacity("alice.cpu".to_string()));
        assert_eq!(err.to_response().kind, ErrorKind::NoCapacityError);

        let err = ControllerError::Physical(anyhow::anyhow!("disk offline"));
        let response = err.to_response();
        assert_eq!(response.kind, ErrorKind::PhysicalError);
        assert_eq!(response.args, vec!["disk offline".to_string()]);

        let err = ControllerError::from(StorageError::Database("locked".to_string()));
        assert_eq!(err.to_response().kind, ErrorKind::StorageError);
    }
}
