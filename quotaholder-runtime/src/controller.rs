//! Saga driving a commission from its ledger reservation to a physical outcome.
//!
//! Each tracked commission has a controller row whose status moves
//! `undertaken -> {complete, failing} -> retired`. Retiring deletes the row.
//! Polls are driven purely by persisted state, so any number of workers may
//! call `process_controller` for the same serial; the row lock keeps at most
//! one of them mutating it at a time. Every poll locks under its own owner
//! token, so two threads sharing one controller exclude each other too.

use crate::error::ControllerError;
use crate::physical::{CommissionSpec, Physical};
use quotaholder_core::error::{QuotaError, StorageError};
use quotaholder_core::id::{validate_name, Serial};
use quotaholder_core::locks::{CommissionLockGuard, ControllerLockManager};
use quotaholder_core::objects::{ControllerCommission, ControllerStatus, ResolutionKind};
use quotaholder_ledger::{CommissionIssue, QuotaHolder};
use quotaholder_storage_impl::StorageTransaction;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Reason recorded in the provision log for saga resolutions
pub const CONTROLLER_REASON: &str = "controller";

/// What a single poll of a commission did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Nothing existed physically; the driver was asked to start building
    Initiated,

    /// Building is under way; the driver was nudged and another poll is due
    Continuing,

    /// The resource complies; the reservation was accepted and the row retired
    Accepted,

    /// The resource cannot be reached; the reservation was rejected and the row retired
    Rejected,

    /// No row is tracked for the serial (never undertaken or already retired)
    NotTracked,

    /// Another worker holds the row lock; nothing was done
    Busy,
}

impl Advance {
    /// Whether the commission reached a final outcome on this poll
    pub fn is_final(&self) -> bool {
        matches!(self, Advance::Accepted | Advance::Rejected)
    }
}

/// Drives commissions through a physical driver on top of a ledger
pub struct Controller<P: Physical, L: ControllerLockManager> {
    ledger: Arc<QuotaHolder>,
    physical: P,
    locks: L,
    worker_id: String,
    lock_timeout_ms: Option<u64>,
    polls: AtomicU64,
}

impl<P: Physical, L: ControllerLockManager> std::fmt::Debug for Controller<P, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("worker_id", &self.worker_id)
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .field("locks", &self.locks)
            .finish()
    }
}

impl<P: Physical, L: ControllerLockManager> Controller<P, L> {
    /// Create a controller polling as `worker_id`
    pub fn new(
        ledger: Arc<QuotaHolder>,
        physical: P,
        locks: L,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            physical,
            locks,
            worker_id: worker_id.into(),
            lock_timeout_ms: None,
            polls: AtomicU64::new(0),
        }
    }

    /// Let other workers take over a row lock older than `timeout_ms`
    pub fn with_lock_timeout(mut self, timeout_ms: Option<u64>) -> Self {
        self.lock_timeout_ms = timeout_ms;
        self
    }

    pub fn ledger(&self) -> &Arc<QuotaHolder> {
        &self.ledger
    }

    pub fn physical(&self) -> &P {
        &self.physical
    }

    pub fn locks(&self) -> &L {
        &self.locks
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// The ledger reservation a request needs
    pub fn get_commission_issue(
        &self,
        spec: &CommissionSpec,
    ) -> Result<CommissionIssue, QuotaError> {
        if spec.issue.clientkey.is_empty() {
            return Err(QuotaError::InvalidData(format!(
                "{}: controlled calls need a clientkey",
                spec.call
            )));
        }
        validate_name("entity", &spec.issue.target)?;
        Ok(spec.issue.clone())
    }

    /// Reserve the resources of a request, start tracking it and take the first step.
    ///
    /// Returns the commission serial, which doubles as the handle the caller
    /// polls with. A crash after the reservation but before the row is
    /// tracked leaves a plain pending commission that the client reconciles
    /// with `resolve_pending_commissions`.
    pub fn undertake_commission(&self, spec: CommissionSpec) -> Result<Serial, ControllerError> {
        let issue = self.get_commission_issue(&spec)?;
        let description = self
            .physical
            .derive_description(&spec)
            .map_err(ControllerError::Physical)?;
        let encoded = bincode::serialize(&description)
            .map_err(|e| ControllerError::Codec(format!("{}: {}", spec.call, e)))?;

        let serial = self.ledger.issue_commission(issue.clone())?;
        self.register_commission(&ControllerCommission {
            serial,
            clientkey: issue.clientkey,
            physical_description: encoded,
            status: ControllerStatus::Undertaken,
        })?;
        log::info!("undertook {} for {}", serial, spec.call);

        let advance = self.process_controller(serial)?;
        log::debug!("first poll of {}: {:?}", serial, advance);
        Ok(serial)
    }

    /// Take one step on a tracked commission.
    pub fn process_controller(&self, serial: Serial) -> Result<Advance, ControllerError> {
        let owner = self.poll_owner();
        let guard =
            CommissionLockGuard::try_acquire(&self.locks, serial, &owner, self.lock_timeout_ms)
                .map_err(|e| ControllerError::Lock(format!("{}: {}", serial, e)))?;
        let mut guard = match guard {
            Some(guard) => guard,
            None => {
                log::debug!("{} is busy, skipping poll by {}", serial, owner);
                return Ok(Advance::Busy);
            }
        };

        let advance = self.step(serial);
        if let Err(e) = guard.release() {
            log::warn!("{} could not release the lock on {}: {}", guard.owner(), serial, e);
        }
        advance
    }

    /// Lock owner for one poll: the worker id plus a per-controller counter
    fn poll_owner(&self) -> String {
        let poll = self.polls.fetch_add(1, Ordering::Relaxed);
        format!("{}/{}", self.worker_id, poll)
    }

    fn step(&self, serial: Serial) -> Result<Advance, ControllerError> {
        let row = match self.load_commission(serial)? {
            Some(row) => row,
            None => return Ok(Advance::NotTracked),
        };
        let description = self.decode_description(&row)?;

        match row.status {
            ControllerStatus::Complete => self.finalize(&row, &description, ResolutionKind::Accept),
            ControllerStatus::Failing => self.finalize(&row, &description, ResolutionKind::Reject),
            ControllerStatus::Undertaken => self.process_physical(row, &description),
        }
    }

    /// Compare the physical resource with its description and act on the difference.
    fn process_physical(
        &self,
        mut row: ControllerCommission,
        description: &P::Description,
    ) -> Result<Advance, ControllerError> {
        let serial = row.serial;
        let state = self
            .physical
            .get_current_state(serial, description)
            .map_err(ControllerError::Physical)?;

        let state = match state {
            Some(state) => state,
            None => {
                self.physical
                    .initiate_commission(serial, description)
                    .map_err(ControllerError::Physical)?;
                log::debug!("initiated {}", serial);
                return Ok(Advance::Initiated);
            }
        };

        if self.physical.complies(&state, description) {
            row.status = ControllerStatus::Complete;
            self.register_commission(&row)?;
            self.finalize(&row, description, ResolutionKind::Accept)
        } else if self.physical.attainable(&state, description) {
            self.physical
                .continue_commission(serial, description)
                .map_err(ControllerError::Physical)?;
            log::debug!("continued {} at {:?}", serial, state);
            Ok(Advance::Continuing)
        } else {
            log::warn!("{} cannot reach its target from {:?}", serial, state);
            row.status = ControllerStatus::Failing;
            self.register_commission(&row)?;
            self.finalize(&row, description, ResolutionKind::Reject)
        }
    }

    /// Resolve the reservation, release the driver and retire the row.
    ///
    /// Every step tolerates being repeated after a crash: the ledger skips a
    /// serial it already resolved and the row stays until retirement.
    fn finalize(
        &self,
        row: &ControllerCommission,
        description: &P::Description,
        kind: ResolutionKind,
    ) -> Result<Advance, ControllerError> {
        let serials = [row.serial];
        let skipped = match kind {
            ResolutionKind::Accept => {
                self.ledger
                    .accept_commission(&row.clientkey, &serials, CONTROLLER_REASON)?
            }
            ResolutionKind::Reject => {
                self.ledger
                    .reject_commission(&row.clientkey, &serials, CONTROLLER_REASON)?
            }
        };
        if !skipped.is_empty() {
            log::warn!("{} was no longer pending in the ledger", row.serial);
        }

        self.physical
            .end_commission(row.serial, description)
            .map_err(ControllerError::Physical)?;
        self.retire_commission(row.serial)?;

        log::info!("finalized {} ({:?})", row.serial, kind);
        Ok(match kind {
            ResolutionKind::Accept => Advance::Accepted,
            ResolutionKind::Reject => Advance::Rejected,
        })
    }

    /// Serials of every tracked commission, ascending
    pub fn pending_controller_commissions(&self) -> Result<Vec<Serial>, ControllerError> {
        Ok(self.rows(|tx| tx.list_controller_serials())?)
    }

    /// The controller row of a serial, if it is still tracked
    pub fn load_commission(
        &self,
        serial: Serial,
    ) -> Result<Option<ControllerCommission>, ControllerError> {
        Ok(self.rows(|tx| tx.get_controller_commission(serial))?)
    }

    fn register_commission(&self, row: &ControllerCommission) -> Result<(), ControllerError> {
        self.rows(|tx| tx.put_controller_commission(row))?;
        log::debug!("{} is {}", row.serial, row.status.as_str());
        Ok(())
    }

    fn retire_commission(&self, serial: Serial) -> Result<(), ControllerError> {
        if !self.rows(|tx| tx.delete_controller_commission(serial))? {
            log::warn!("{} was already retired", serial);
        }
        Ok(())
    }

    fn decode_description(
        &self,
        row: &ControllerCommission,
    ) -> Result<P::Description, ControllerError> {
        if row.physical_description.is_empty() {
            return Err(QuotaError::Corrupted(format!(
                "{} is tracked without a physical description",
                row.serial
            ))
            .into());
        }
        bincode::deserialize(&row.physical_description).map_err(|e| {
            QuotaError::Corrupted(format!(
                "{} has an unreadable physical description: {}",
                row.serial, e
            ))
            .into()
        })
    }

    /// Run `f` in its own storage transaction, committing on success
    fn rows<T>(
        &self,
        f: impl FnOnce(&mut dyn StorageTransaction) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut tx = self.ledger.storage().begin()?;
        let value = f(&mut *tx)?;
        tx.commit()?;
        Ok(value)
    }
}
