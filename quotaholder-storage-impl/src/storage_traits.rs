use chrono::{DateTime, Utc};
use quotaholder_core::error::StorageError;
use quotaholder_core::id::Serial;
use quotaholder_core::objects::{
    Commission, ControllerCommission, Entity, Holding, Policy, Provision, ProvisionLog,
};

/// Named monotonic counters kept by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Sequence {
    /// Commission serials
    CommissionSerial,
    /// Suffixes for anonymous per-holding policies
    AnonymousPolicy,
}

impl Sequence {
    pub fn name(&self) -> &'static str {
        match self {
            Sequence::CommissionSerial => "commission_serial",
            Sequence::AnonymousPolicy => "anonymous_policy",
        }
    }
}

/// Exclusive position in the provision log, ordered by `(issue_time, id)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCursor {
    pub issue_time: DateTime<Utc>,
    pub id: u64,
}

impl LogCursor {
    /// Cursor positioned after every entry issued at or before `after`
    pub fn after(after: DateTime<Utc>) -> Self {
        Self {
            issue_time: after,
            id: i64::MAX as u64,
        }
    }

    /// Cursor positioned right after a given entry
    pub fn at(entry: &ProvisionLog) -> Self {
        Self {
            issue_time: entry.issue_time,
            id: entry.id,
        }
    }

    /// Whether an entry lies strictly after this cursor
    pub fn precedes(&self, entry: &ProvisionLog) -> bool {
        (entry.issue_time, entry.id) > (self.issue_time, self.id)
    }
}

/// Main storage interface for the quotaholder ledger
///
/// Every read and write goes through a transaction obtained from `begin`.
/// Transactions are serialized by the backend: while one is open, no other
/// transaction observes or modifies the store.
pub trait QuotaStorage: Send + Sync {
    /// Open a new transaction
    ///
    /// # Returns
    /// A transaction that must be committed for its writes to persist.
    /// Dropping it without commit rolls it back.
    fn begin(&self) -> Result<Box<dyn StorageTransaction + '_>, StorageError>;

    /// Short backend name used in logs
    fn backend_name(&self) -> &'static str;
}

/// One unit of work against the ledger tables
pub trait StorageTransaction {
    // Entities

    fn get_entity(&mut self, name: &str) -> Result<Option<Entity>, StorageError>;

    /// Insert or replace an entity
    fn put_entity(&mut self, entity: &Entity) -> Result<(), StorageError>;

    /// Delete an entity, returning whether it existed
    fn delete_entity(&mut self, name: &str) -> Result<bool, StorageError>;

    /// Names of the entities owned by `owner`, sorted
    fn list_children(&mut self, owner: &str) -> Result<Vec<String>, StorageError>;

    // Policies

    fn get_policy(&mut self, name: &str) -> Result<Option<Policy>, StorageError>;

    /// Insert or replace a policy
    fn put_policy(&mut self, policy: &Policy) -> Result<(), StorageError>;

    fn delete_policy(&mut self, name: &str) -> Result<bool, StorageError>;

    /// Number of holdings pointing at a policy
    fn policy_references(&mut self, name: &str) -> Result<usize, StorageError>;

    // Holdings

    fn get_holding(&mut self, entity: &str, resource: &str)
        -> Result<Option<Holding>, StorageError>;

    /// Insert or replace the holding keyed by its (entity, resource)
    fn put_holding(&mut self, holding: &Holding) -> Result<(), StorageError>;

    fn delete_holding(&mut self, entity: &str, resource: &str) -> Result<bool, StorageError>;

    /// Holdings of an entity, sorted by resource
    fn list_holdings(&mut self, entity: &str) -> Result<Vec<Holding>, StorageError>;

    // Sequences

    /// Advance a sequence and return its new value; the first value is 1
    fn next_value(&mut self, sequence: Sequence) -> Result<u64, StorageError>;

    // Commissions and provisions

    fn put_commission(&mut self, commission: &Commission) -> Result<(), StorageError>;

    fn get_commission(&mut self, serial: Serial) -> Result<Option<Commission>, StorageError>;

    fn delete_commission(&mut self, serial: Serial) -> Result<bool, StorageError>;

    /// Unresolved commission serials of a client, ascending
    fn pending_serials(&mut self, clientkey: &str) -> Result<Vec<Serial>, StorageError>;

    /// Append a provision to its commission, keeping issue order
    fn put_provision(&mut self, provision: &Provision) -> Result<(), StorageError>;

    /// Provisions of a commission in issue order
    fn provisions_for(&mut self, serial: Serial) -> Result<Vec<Provision>, StorageError>;

    /// Delete every provision of a commission, returning how many were removed
    fn delete_provisions(&mut self, serial: Serial) -> Result<usize, StorageError>;

    // Provision log

    /// Append an entry; its `id` field is ignored and the assigned id is returned
    fn append_provision_log(&mut self, entry: &ProvisionLog) -> Result<u64, StorageError>;

    /// Entries strictly after `cursor` and issued no later than `before`,
    /// ordered by `(issue_time, id)`, at most `limit` of them
    fn scan_provision_logs(
        &mut self,
        cursor: LogCursor,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProvisionLog>, StorageError>;

    // Controller commissions

    fn put_controller_commission(
        &mut self,
        commission: &ControllerCommission,
    ) -> Result<(), StorageError>;

    fn get_controller_commission(
        &mut self,
        serial: Serial,
    ) -> Result<Option<ControllerCommission>, StorageError>;

    fn delete_controller_commission(&mut self, serial: Serial) -> Result<bool, StorageError>;

    /// Serials of every tracked controller commission, ascending
    fn list_controller_serials(&mut self) -> Result<Vec<Serial>, StorageError>;

    // Completion

    /// Make every write of this transaction durable
    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discard every write of this transaction
    fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}
