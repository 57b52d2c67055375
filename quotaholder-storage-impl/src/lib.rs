pub mod lock_manager;
pub mod memory;
pub mod storage_traits;

#[cfg(feature = "sqlite")]
pub mod sqlite;

// Re-export the main types for convenience
pub use storage_traits::{LogCursor, QuotaStorage, Sequence, StorageTransaction};

pub use memory::InMemoryStorage;

// Re-export lock manager implementations
pub use lock_manager::InMemoryLockManager;
#[cfg(feature = "sqlite")]
pub use lock_manager::SqliteLockManager;

// Re-export the storage implementations
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
