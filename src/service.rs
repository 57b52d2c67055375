use crate::config::{ControllerConfig, QuotaHolderConfig};
use anyhow::{Context, Result};
use quotaholder_core::error::StorageError;
use quotaholder_core::locks::ControllerLockManager;
use quotaholder_ledger::QuotaHolder;
use quotaholder_runtime::{callpoint_constructor, Callpoint, Controller, Physical};
use quotaholder_storage_impl::{InMemoryLockManager, QuotaStorage};
use std::sync::Arc;

/// Lock manager shared by every controller of a service
pub type SharedLocks = Arc<dyn ControllerLockManager<Error = StorageError>>;

/// An open ledger together with the lock manager its controllers share
#[derive(Debug, Clone)]
pub struct QuotaHolderService {
    ledger: Arc<QuotaHolder>,
    locks: SharedLocks,
    controller: ControllerConfig,
}

impl QuotaHolderService {
    pub(crate) fn in_memory(config: &QuotaHolderConfig) -> Result<Self> {
        let storage = Arc::new(quotaholder_storage_impl::InMemoryStorage::new());
        Self::assemble(config, storage, Arc::new(InMemoryLockManager::new()))
    }

    #[cfg(feature = "sqlite")]
    pub(crate) fn sqlite(config: &QuotaHolderConfig, path: &std::path::Path) -> Result<Self> {
        let storage = quotaholder_storage_impl::SqliteStorage::new(path)
            .with_context(|| format!("Failed to open quotaholder database {}", path.display()))?;
        let locks = Arc::new(storage.lock_manager());
        Self::assemble(config, Arc::new(storage), locks)
    }

    fn assemble(
        config: &QuotaHolderConfig,
        storage: Arc<dyn QuotaStorage>,
        locks: SharedLocks,
    ) -> Result<Self> {
        let backend = storage.backend_name();
        let ledger = QuotaHolder::open(storage, config.ledger.clone())
            .with_context(|| format!("Failed to open ledger on {}", backend))?;
        log::info!(
            "quotaholder open on {} with root {}",
            backend,
            ledger.root_entity()
        );
        Ok(Self {
            ledger: Arc::new(ledger),
            locks,
            controller: config.controller.clone(),
        })
    }

    pub fn ledger(&self) -> &Arc<QuotaHolder> {
        &self.ledger
    }

    pub fn locks(&self) -> &SharedLocks {
        &self.locks
    }

    /// A controller driving `physical` as `worker_id`, sharing this service's row locks
    pub fn controller<P: Physical>(
        &self,
        physical: P,
        worker_id: impl Into<String>,
    ) -> Controller<P, SharedLocks> {
        Controller::new(self.ledger.clone(), physical, self.locks.clone(), worker_id)
            .with_lock_timeout(self.controller.lock_timeout_ms)
    }

    /// The compiled-in callpoint serving `api` over this ledger
    pub fn callpoint(&self, api: &str) -> Option<Box<dyn Callpoint>> {
        callpoint_constructor(api).map(|construct| construct(self.ledger.clone()))
    }

    /// Release controller row locks abandoned by crashed workers
    pub fn cleanup_expired_locks(&self) -> Result<usize, StorageError> {
        let released = self.locks.cleanup_expired_locks()?;
        if released > 0 {
            log::warn!("released {} expired controller locks", released);
        }
        Ok(released)
    }
}
