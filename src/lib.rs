pub mod config;
pub mod service;

// Re-export the main types for convenience
pub use config::{ControllerConfig, QuotaHolderConfig, StorageConfig};
pub use service::{QuotaHolderService, SharedLocks};

pub use quotaholder_core::error::{ErrorKind, ErrorResponse, QuotaError, StorageError};
pub use quotaholder_core::id::Serial;
pub use quotaholder_core::locks::{CommissionLockGuard, ControllerLockManager, LockInfo};
pub use quotaholder_core::objects::{
    ControllerCommission, ControllerStatus, Entity, Holding, Policy, ProvisionLog,
};

pub use quotaholder_ledger::{
    AddQuota, CommissionInfo, CommissionIssue, CreateEntity, EntityInfo, EntityKey,
    HoldingInfo, HoldingKey, LedgerConfig, PolicyLimits, ProvisionRequest, QuotaHolder,
    QuotaInfo, Resolution, SetEntityKey, SetHolding, SetQuota, TimelineFilter,
};

pub use quotaholder_runtime::{
    callpoint_constructor, Advance, CallSignature, Callpoint, CommissionSpec, ControlledCallpoint,
    Controller, ControllerError, Physical, QuotaholderCallpoint, ValueSchema,
};

pub use quotaholder_storage_impl::{InMemoryLockManager, InMemoryStorage, QuotaStorage};
#[cfg(feature = "sqlite")]
pub use quotaholder_storage_impl::{SqliteLockManager, SqliteStorage};
