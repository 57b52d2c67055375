use serde::{Deserialize, Serialize};

use crate::id::Serial;

/// Information about a lock held on a controller commission row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// The commission whose controller row is locked
    pub serial: Serial,

    /// Identifier of the poller or worker holding the lock
    pub owner: String,

    /// When the lock was acquired (Unix timestamp, milliseconds)
    pub acquired_at: u64,

    /// Optional timeout for the lock (in milliseconds)
    pub timeout_ms: Option<u64>,
}

impl LockInfo {
    /// Whether the lock has outlived its timeout at `now_ms` (Unix milliseconds)
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.timeout_ms {
            Some(timeout) => self.acquired_at.saturating_add(timeout) <= now_ms,
            None => false,
        }
    }
}

/// Serializes mutations of a single controller commission row across pollers.
///
/// Locks are exclusive and not re-entrant: while an unexpired lock exists on
/// a serial, every acquire is refused, including one by the holder itself.
/// A lock whose timeout has elapsed may be taken over.
pub trait ControllerLockManager: std::fmt::Debug + Send + Sync {
    /// Error type used for lock manager operations
    type Error: std::fmt::Display;

    /// Try to acquire the lock on a serial for an owner
    ///
    /// # Parameters
    /// * `serial` - The commission whose row should be locked
    /// * `owner` - The poller acquiring the lock
    /// * `timeout_ms` - Optional timeout for the lock (in milliseconds)
    ///
    /// # Returns
    /// * `Ok(true)` - Lock acquired
    /// * `Ok(false)` - An unexpired lock is already held, by any owner
    /// * `Err` - The lock state could not be read or written
    fn acquire_lock(
        &self,
        serial: Serial,
        owner: &str,
        timeout_ms: Option<u64>,
    ) -> Result<bool, Self::Error>;

    /// Release a lock held by an owner
    ///
    /// # Returns
    /// * `Ok(true)` - Lock was released
    /// * `Ok(false)` - No lock, or it belongs to a different owner
    fn release_lock(&self, serial: Serial, owner: &str) -> Result<bool, Self::Error>;

    /// Check if a serial is locked and by whom
    fn get_lock_info(&self, serial: Serial) -> Result<Option<LockInfo>, Self::Error>;

    /// Release every lock whose timeout has elapsed, returning how many were released
    fn cleanup_expired_locks(&self) -> Result<usize, Self::Error>;
}

impl<M: ControllerLockManager + ?Sized> ControllerLockManager for std::sync::Arc<M> {
    type Error = M::Error;

    fn acquire_lock(
        &self,
        serial: Serial,
        owner: &str,
        timeout_ms: Option<u64>,
    ) -> Result<bool, Self::Error> {
        (**self).acquire_lock(serial, owner, timeout_ms)
    }

    fn release_lock(&self, serial: Serial, owner: &str) -> Result<bool, Self::Error> {
        (**self).release_lock(serial, owner)
    }

    fn get_lock_info(&self, serial: Serial) -> Result<Option<LockInfo>, Self::Error> {
        (**self).get_lock_info(serial)
    }

    fn cleanup_expired_locks(&self) -> Result<usize, Self::Error> {
        (**self).cleanup_expired_locks()
    }
}

/// Guard that holds a controller row lock and releases it when dropped
#[derive(Debug)]
pub struct CommissionLockGuard<'a, M: ControllerLockManager> {
    serial: Serial,
    owner: String,
    lock_manager: &'a M,
    released: bool,
}

impl<'a, M: ControllerLockManager> CommissionLockGuard<'a, M> {
    /// Try to take the lock; `Ok(None)` when another owner holds it
    pub fn try_acquire(
        lock_manager: &'a M,
        serial: Serial,
        owner: &str,
        timeout_ms: Option<u64>,
    ) -> Result<Option<Self>, M::Error> {
        if !lock_manager.acquire_lock(serial, owner, timeout_ms)? {
            return Ok(None);
        }
        Ok(Some(Self {
            serial,
            owner: owner.to_string(),
            lock_manager,
            released: false,
        }))
    }

    /// Explicitly release the lock before the guard is dropped
    pub fn release(&mut self) -> Result<bool, M::Error> {
        if self.released {
            return Ok(false);
        }
        let released = self.lock_manager.release_lock(self.serial, &self.owner)?;
        self.released = true;
        Ok(released)
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl<'a, M: ControllerLockManager> Drop for CommissionLockGuard<'a, M> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.lock_manager.release_lock(self.serial, &self.owner) {
                log::warn!("failed to release controller lock on {}: {}", self.serial, e);
            }
        }
    }
}
