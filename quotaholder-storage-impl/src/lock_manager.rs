use quotaholder_core::error::StorageError;
use quotaholder_core::id::Serial;
use quotaholder_core::locks::{ControllerLockManager, LockInfo};
#[cfg(feature = "sqlite")]
use sqlx::Row;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// SQL query constants to avoid repetition
#[cfg(feature = "sqlite")]
mod sql {
    pub const CREATE_LOCKS_TABLE: &str = r#"
        CREATE TABLE IF NOT EXISTS controller_locks (
            serial INTEGER PRIMARY KEY,
            owner TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            timeout_ms INTEGER
        );
    "#;

    pub const GET_LOCK: &str = r#"
        SELECT serial, owner, acquired_at, timeout_ms
        FROM controller_locks
        WHERE serial = ?
    "#;

    pub const INSERT_LOCK: &str = r#"
        INSERT OR IGNORE INTO controller_locks (serial, owner, acquired_at, timeout_ms)
        VALUES (?, ?, ?, ?)
    "#;

    pub const DELETE_LOCK: &str = r#"
        DELETE FROM controller_locks
        WHERE serial = ? AND owner = ?
    "#;

    pub const DELETE_EXPIRED_LOCK: &str = r#"
        DELETE FROM controller_locks
        WHERE serial = ? AND timeout_ms IS NOT NULL AND acquired_at + timeout_ms <= ?
    "#;

    pub const DELETE_EXPIRED_LOCKS: &str = r#"
        DELETE FROM controller_locks
        WHERE timeout_ms IS NOT NULL AND acquired_at + timeout_ms <= ?
    "#;
}

/// Helper function to get the current timestamp in milliseconds
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Process-local lock manager, for the in-memory backend and tests
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    locks: Mutex<HashMap<Serial, LockInfo>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn locks(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Serial, LockInfo>>, StorageError> {
        self.locks
            .lock()
            .map_err(|e| StorageError::Lock(format!("Failed to acquire lock: {}", e)))
    }
}

impl ControllerLockManager for InMemoryLockManager {
    type Error = StorageError;

    fn acquire_lock(
        &self,
        serial: Serial,
        owner: &str,
        timeout_ms: Option<u64>,
    ) -> Result<bool, Self::Error> {
        let now = current_time_millis();
        let mut locks = self.locks()?;
        if let Some(existing) = locks.get(&serial) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
            log::debug!(
                "taking over expired controller lock on {} from {}",
                serial,
                existing.owner
            );
        }
        locks.insert(
            serial,
            LockInfo {
                serial,
                owner: owner.to_string(),
                acquired_at: now,
                timeout_ms,
            },
        );
        Ok(true)
    }

    fn release_lock(&self, serial: Serial, owner: &str) -> Result<bool, Self::Error> {
        let mut locks = self.locks()?;
        match locks.get(&serial) {
            Some(lock) if lock.owner == owner => {
                locks.remove(&serial);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn get_lock_info(&self, serial: Serial) -> Result<Option<LockInfo>, Self::Error> {
        Ok(self.locks()?.get(&serial).cloned())
    }

    fn cleanup_expired_locks(&self) -> Result<usize, Self::Error> {
        let now = current_time_millis();
        let mut locks = self.locks()?;
        let before = locks.len();
        locks.retain(|_, lock| !lock.is_expired(now));
        Ok(before - locks.len())
    }
}

/// SQLite-based lock manager, sharing the pool of a [`crate::SqliteStorage`]
#[cfg(feature = "sqlite")]
pub struct SqliteLockManager {
    /// The SQLite pool for database connections
    pool: sqlx::SqlitePool,
    /// Shared runtime for async operations
    rt: std::sync::Arc<tokio::runtime::Runtime>,
}

#[cfg(feature = "sqlite")]
impl SqliteLockManager {
    /// Create a new SqliteLockManager with the given SQLite connection pool and runtime
    pub fn new(pool: sqlx::SqlitePool, rt: std::sync::Arc<tokio::runtime::Runtime>) -> Self {
        Self { pool, rt }
    }

    /// Initialize the database schema for locks
    pub async fn initialize(&self) -> Result<(), StorageError> {
        sqlx::query(sql::CREATE_LOCKS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Database(format!("Failed to create locks table: {}", e)))?;
        Ok(())
    }

    fn row_to_lock_info(row: sqlx::sqlite::SqliteRow) -> Result<LockInfo, StorageError> {
        let serial: i64 = row.get("serial");
        let owner: String = row.get("owner");
        let acquired_at: i64 = row.get("acquired_at");
        let timeout_ms: Option<i64> = row.get("timeout_ms");

        let serial = Serial::from_i64(serial)
            .map_err(|e| StorageError::Database(format!("Invalid lock serial: {}", e)))?;

        Ok(LockInfo {
            serial,
            owner,
            acquired_at: acquired_at as u64,
            timeout_ms: timeout_ms.map(|t| t as u64),
        })
    }

    async fn get_lock_info_internal(&self, serial: Serial) -> Result<Option<LockInfo>, StorageError> {
        let result = sqlx::query(sql::GET_LOCK)
            .bind(serial.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Database(format!("Failed to query lock: {}", e)))?;

        result.map(Self::row_to_lock_info).transpose()
    }
}

#[cfg(feature = "sqlite")]
impl ControllerLockManager for SqliteLockManager {
    type Error = StorageError;

    fn acquire_lock(
        &self,
        serial: Serial,
        owner: &str,
        timeout_ms: Option<u64>,
    ) -> Result<bool, Self::Error> {
        self.rt.block_on(async {
            let now = current_time_millis() as i64;

            // An expired lock on this serial no longer counts
            sqlx::query(sql::DELETE_EXPIRED_LOCK)
                .bind(serial.as_i64())
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    StorageError::Database(format!("Failed to clear expired lock: {}", e))
                })?;

            let inserted = sqlx::query(sql::INSERT_LOCK)
                .bind(serial.as_i64())
                .bind(owner)
                .bind(now)
                .bind(timeout_ms.map(|t| t as i64))
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    StorageError::Database(format!("Failed to insert lock record: {}", e))
                })?;

            // The primary key refuses a second holder, whoever it is
            Ok(inserted.rows_affected() == 1)
        })
    }

    fn release_lock(&self, serial: Serial, owner: &str) -> Result<bool, Self::Error> {
        self.rt.block_on(async {
            let result = sqlx::query(sql::DELETE_LOCK)
                .bind(serial.as_i64())
                .bind(owner)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    StorageError::Database(format!("Failed to delete lock record: {}", e))
                })?;

            Ok(result.rows_affected() > 0)
        })
    }

    fn get_lock_info(&self, serial: Serial) -> Result<Option<LockInfo>, Self::Error> {
        self.rt.block_on(self.get_lock_info_internal(serial))
    }

    fn cleanup_expired_locks(&self) -> Result<usize, Self::Error> {
        self.rt.block_on(async {
            let now = current_time_millis() as i64;

            let result = sqlx::query(sql::DELETE_EXPIRED_LOCKS)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    StorageError::Database(format!("Failed to cleanup expired locks: {}", e))
                })?;

            Ok(result.rows_affected() as usize)
        })
    }
}

#[cfg(feature = "sqlite")]
impl Debug for SqliteLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLockManager").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial(n: u64) -> Serial {
        Serial::new(n).unwrap()
    }

    fn exercise_exclusive_locking<M: ControllerLockManager<Error = StorageError>>(manager: &M) {
        assert!(manager.acquire_lock(serial(1), "poller-a", None).unwrap());
        // Refused to everyone while held, the holder included
        assert!(!manager.acquire_lock(serial(1), "poller-a", None).unwrap());
        assert!(!manager.acquire_lock(serial(1), "poller-b", None).unwrap());

        // Other serials are independent
        assert!(manager.acquire_lock(serial(2), "poller-b", None).unwrap());

        let info = manager.get_lock_info(serial(1)).unwrap().unwrap();
        assert_eq!(info.owner, "poller-a");

        assert!(!manager.release_lock(serial(1), "poller-b").unwrap());
        assert!(manager.release_lock(serial(1), "poller-a").unwrap());
        assert!(manager.get_lock_info(serial(1)).unwrap().is_none());
        assert!(manager.acquire_lock(serial(1), "poller-b", None).unwrap());
    }

    fn exercise_expiry<M: ControllerLockManager<Error = StorageError>>(manager: &M) {
        // A zero timeout is expired as soon as it is taken
        assert!(manager.acquire_lock(serial(7), "poller-a", Some(0)).unwrap());
        assert!(manager.acquire_lock(serial(7), "poller-b", None).unwrap());
        assert_eq!(manager.get_lock_info(serial(7)).unwrap().unwrap().owner, "poller-b");

        assert!(manager.acquire_lock(serial(8), "poller-a", Some(0)).unwrap());
        assert!(manager.acquire_lock(serial(9), "poller-a", Some(60_000)).unwrap());
        assert_eq!(manager.cleanup_expired_locks().unwrap(), 1);
        assert!(manager.get_lock_info(serial(8)).unwrap().is_none());
        assert!(manager.get_lock_info(serial(9)).unwrap().is_some());
    }

    fn exercise_sub_second_timeout<M: ControllerLockManager<Error = StorageError>>(manager: &M) {
        assert!(manager.acquire_lock(serial(4), "poller-a", Some(900)).unwrap());
        assert!(!manager.acquire_lock(serial(4), "poller-b", None).unwrap());
        assert_eq!(manager.cleanup_expired_locks().unwrap(), 0);

        let info = manager.get_lock_info(serial(4)).unwrap().unwrap();
        assert_eq!(info.owner, "poller-a");
        assert_eq!(info.timeout_ms, Some(900));
        assert!(!info.is_expired(info.acquired_at + 899));
    }

    fn exercise_concurrent_acquire<M: ControllerLockManager<Error = StorageError>>(manager: &M) {
        let winners = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    // Every thread uses the same owner name
                    if manager.acquire_lock(serial(5), "poller-a", Some(60_000)).unwrap() {
                        winners.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(winners.into_inner(), 1);
    }

    #[test]
    fn test_in_memory_exclusive_locking() {
        exercise_exclusive_locking(&InMemoryLockManager::new());
    }

    #[test]
    fn test_in_memory_expiry() {
        exercise_expiry(&InMemoryLockManager::new());
    }

    #[test]
    fn test_in_memory_sub_second_timeout() {
        exercise_sub_second_timeout(&InMemoryLockManager::new());
    }

    #[test]
    fn test_in_memory_concurrent_acquire() {
        exercise_concurrent_acquire(&InMemoryLockManager::new());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_sqlite_exclusive_locking() {
        let dir = tempfile::tempdir().unwrap();
        let storage = crate::SqliteStorage::new(dir.path().join("locks.db")).unwrap();
        exercise_exclusive_locking(&storage.lock_manager());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_sqlite_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let storage = crate::SqliteStorage::new(dir.path().join("locks.db")).unwrap();
        exercise_expiry(&storage.lock_manager());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_sqlite_sub_second_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let storage = crate::SqliteStorage::new(dir.path().join("locks.db")).unwrap();
        exercise_sub_second_timeout(&storage.lock_manager());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        use quotaholder_core::locks::CommissionLockGuard;

        let manager = InMemoryLockManager::new();
        {
            let guard = CommissionLockGuard::try_acquire(&manager, serial(3), "poller-a", None)
                .unwrap()
                .unwrap();
            assert_eq!(guard.serial(), serial(3));
            assert!(CommissionLockGuard::try_acquire(&manager, serial(3), "poller-b", None)
                .unwrap()
                .is_none());
        }
        assert!(manager.get_lock_info(serial(3)).unwrap().is_none());
    }
}
