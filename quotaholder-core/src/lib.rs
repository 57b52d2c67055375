pub mod error;
pub mod id;
pub mod locks;
pub mod objects;
pub mod quota;

// Re-export the main types for convenience
pub use error::{ErrorKind, ErrorResponse, QuotaError, StorageError};
pub use id::Serial;
pub use locks::{CommissionLockGuard, ControllerLockManager, LockInfo};
pub use objects::{
    Commission, ControllerCommission, ControllerStatus, Entity, Holding, HoldingSnapshot,
    Policy, Provision, ProvisionLog, ResolutionKind,
};
pub use quota::LegKind;
