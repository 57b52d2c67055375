use crate::storage_traits::{LogCursor, QuotaStorage, Sequence, StorageTransaction};
use chrono::{DateTime, Utc};
use quotaholder_core::error::StorageError;
use quotaholder_core::id::Serial;
use quotaholder_core::objects::{
    Commission, ControllerCommission, Entity, Holding, Policy, Provision, ProvisionLog,
};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

type HoldingKey = (String, String);

#[derive(Debug, Default)]
struct Tables {
    entities: BTreeMap<String, Entity>,
    policies: BTreeMap<String, Policy>,
    holdings: BTreeMap<HoldingKey, Holding>,
    commissions: BTreeMap<Serial, Commission>,
    provisions: BTreeMap<Serial, Vec<Provision>>,
    provision_log: Vec<ProvisionLog>,
    controller: BTreeMap<Serial, ControllerCommission>,
    sequences: BTreeMap<Sequence, u64>,
}

/// Previous value of a row touched by an open transaction
#[derive(Debug)]
enum Undo {
    Entity(String, Option<Entity>),
    Policy(String, Option<Policy>),
    Holding(HoldingKey, Option<Holding>),
    Commission(Serial, Option<Commission>),
    Provisions(Serial, Option<Vec<Provision>>),
    Controller(Serial, Option<ControllerCommission>),
    Sequence(Sequence, Option<u64>),
    LogLength(usize),
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, previous: Option<V>) {
    match previous {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

/// In-process storage backend.
///
/// A transaction holds the table mutex for its whole lifetime, so
/// transactions never interleave. Writes are applied in place and journaled;
/// rollback replays the journal backwards.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tables: Mutex<Tables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuotaStorage for InMemoryStorage {
    fn begin(&self) -> Result<Box<dyn StorageTransaction + '_>, StorageError> {
        let tables = self
            .tables
            .lock()
            .map_err(|e| StorageError::Lock(format!("Failed to acquire lock: {}", e)))?;
        Ok(Box::new(InMemoryTransaction {
            tables,
            journal: Vec::new(),
            open: true,
        }))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Transaction over [`InMemoryStorage`]
pub struct InMemoryTransaction<'a> {
    tables: MutexGuard<'a, Tables>,
    journal: Vec<Undo>,
    open: bool,
}

impl<'a> InMemoryTransaction<'a> {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::TransactionClosed(
                "in-memory transaction already finished".to_string(),
            ))
        }
    }

    fn undo_all(&mut self) {
        while let Some(undo) = self.journal.pop() {
            let tables = &mut *self.tables;
            match undo {
                Undo::Entity(k, v) => restore(&mut tables.entities, k, v),
                Undo::Policy(k, v) => restore(&mut tables.policies, k, v),
                Undo::Holding(k, v) => restore(&mut tables.holdings, k, v),
                Undo::Commission(k, v) => restore(&mut tables.commissions, k, v),
                Undo::Provisions(k, v) => restore(&mut tables.provisions, k, v),
                Undo::Controller(k, v) => restore(&mut tables.controller, k, v),
                Undo::Sequence(k, v) => restore(&mut tables.sequences, k, v),
                Undo::LogLength(len) => tables.provision_log.truncate(len),
            }
        }
    }
}

impl<'a> StorageTransaction for InMemoryTransaction<'a> {
    fn get_entity(&mut self, name: &str) -> Result<Option<Entity>, StorageError> {
        self.ensure_open()?;
        Ok(self.tables.entities.get(name).cloned())
    }

    fn put_entity(&mut self, entity: &Entity) -> Result<(), StorageError> {
        self.ensure_open()?;
        let previous = self
            .tables
            .entities
            .insert(entity.name.clone(), entity.clone());
        self.journal.push(Undo::Entity(entity.name.clone(), previous));
        Ok(())
    }

    fn delete_entity(&mut self, name: &str) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let previous = self.tables.entities.remove(name);
        let existed = previous.is_some();
        self.journal.push(Undo::Entity(name.to_string(), previous));
        Ok(existed)
    }

    fn list_children(&mut self, owner: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_open()?;
        Ok(self
            .tables
            .entities
            .values()
            .filter(|e| e.owner.as_deref() == Some(owner))
            .map(|e| e.name.clone())
            .collect())
    }

    fn get_policy(&mut self, name: &str) -> Result<Option<Policy>, StorageError> {
        self.ensure_open()?;
        Ok(self.tables.policies.get(name).cloned())
    }

    fn put_policy(&mut self, policy: &Policy) -> Result<(), StorageError> {
        self.ensure_open()?;
        let previous = self
            .tables
            .policies
            .insert(policy.name.clone(), policy.clone());
        self.journal.push(Undo::Policy(policy.name.clone(), previous));
        Ok(())
    }

    fn delete_policy(&mut self, name: &str) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let previous = self.tables.policies.remove(name);
        let existed = previous.is_some();
        self.journal.push(Undo::Policy(name.to_string(), previous));
        Ok(existed)
    }

    fn policy_references(&mut self, name: &str) -> Result<usize, StorageError> {
        self.ensure_open()?;
        Ok(self
            .tables
            .holdings
            .values()
            .filter(|h| h.policy == name)
            .count())
    }

    fn get_holding(
        &mut self,
        entity: &str,
        resource: &str,
    ) -> Result<Option<Holding>, StorageError> {
        self.ensure_open()?;
        let key = (entity.to_string(), resource.to_string());
        Ok(self.tables.holdings.get(&key).cloned())
    }

    fn put_holding(&mut self, holding: &Holding) -> Result<(), StorageError> {
        self.ensure_open()?;
        let key = (holding.entity.clone(), holding.resource.clone());
        let previous = self.tables.holdings.insert(key.clone(), holding.clone());
        self.journal.push(Undo::Holding(key, previous));
        Ok(())
    }

    fn delete_holding(&mut self, entity: &str, resource: &str) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let key = (entity.to_string(), resource.to_string());
        let previous = self.tables.holdings.remove(&key);
        let existed = previous.is_some();
        self.journal.push(Undo::Holding(key, previous));
        Ok(existed)
    }

    fn list_holdings(&mut self, entity: &str) -> Result<Vec<Holding>, StorageError> {
        self.ensure_open()?;
        // Keys sort by (entity, resource), so the range is already ordered by resource
        Ok(self
            .tables
            .holdings
            .range((entity.to_string(), String::new())..)
            .take_while(|((e, _), _)| e == entity)
            .map(|(_, h)| h.clone())
            .collect())
    }

    fn next_value(&mut self, sequence: Sequence) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let previous = self.tables.sequences.get(&sequence).copied();
        let next = previous.unwrap_or(0).checked_add(1).ok_or_else(|| {
            StorageError::Other(format!("sequence {} exhausted", sequence.name()))
        })?;
        self.tables.sequences.insert(sequence, next);
        self.journal.push(Undo::Sequence(sequence, previous));
        Ok(next)
    }

    fn put_commission(&mut self, commission: &Commission) -> Result<(), StorageError> {
        self.ensure_open()?;
        let previous = self
            .tables
            .commissions
            .insert(commission.serial, commission.clone());
        self.journal.push(Undo::Commission(commission.serial, previous));
        Ok(())
    }

    fn get_commission(&mut self, serial: Serial) -> Result<Option<Commission>, StorageError> {
        self.ensure_open()?;
        Ok(self.tables.commissions.get(&serial).cloned())
    }

    fn delete_commission(&mut self, serial: Serial) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let previous = self.tables.commissions.remove(&serial);
        let existed = previous.is_some();
        self.journal.push(Undo::Commission(serial, previous));
        Ok(existed)
    }

    fn pending_serials(&mut self, clientkey: &str) -> Result<Vec<Serial>, StorageError> {
        self.ensure_open()?;
        Ok(self
            .tables
            .commissions
            .values()
            .filter(|c| c.clientkey == clientkey)
            .map(|c| c.serial)
            .collect())
    }

    fn put_provision(&mut self, provision: &Provision) -> Result<(), StorageError> {
        self.ensure_open()?;
        let previous = self.tables.provisions.get(&provision.serial).cloned();
        self.tables
            .provisions
            .entry(provision.serial)
            .or_default()
            .push(provision.clone());
        self.journal.push(Undo::Provisions(provision.serial, previous));
        Ok(())
    }

    fn provisions_for(&mut self, serial: Serial) -> Result<Vec<Provision>, StorageError> {
        self.ensure_open()?;
        Ok(self
            .tables
            .provisions
            .get(&serial)
            .cloned()
            .unwrap_or_default())
    }

    fn delete_provisions(&mut self, serial: Serial) -> Result<usize, StorageError> {
        self.ensure_open()?;
        let previous = self.tables.provisions.remove(&serial);
        let removed = previous.as_ref().map_or(0, Vec::len);
        self.journal.push(Undo::Provisions(serial, previous));
        Ok(removed)
    }

    fn append_provision_log(&mut self, entry: &ProvisionLog) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let len = self.tables.provision_log.len();
        let id = len as u64 + 1;
        let mut entry = entry.clone();
        entry.id = id;
        self.tables.provision_log.push(entry);
        self.journal.push(Undo::LogLength(len));
        Ok(id)
    }

    fn scan_provision_logs(
        &mut self,
        cursor: LogCursor,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProvisionLog>, StorageError> {
        self.ensure_open()?;
        let mut entries: Vec<ProvisionLog> = self
            .tables
            .provision_log
            .iter()
            .filter(|e| cursor.precedes(e) && e.issue_time <= before)
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.issue_time, e.id));
        entries.truncate(limit);
        Ok(entries)
    }

    fn put_controller_commission(
        &mut self,
        commission: &ControllerCommission,
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        let previous = self
            .tables
            .controller
            .insert(commission.serial, commission.clone());
        self.journal.push(Undo::Controller(commission.serial, previous));
        Ok(())
    }

    fn get_controller_commission(
        &mut self,
        serial: Serial,
    ) -> Result<Option<ControllerCommission>, StorageError> {
        self.ensure_open()?;
        Ok(self.tables.controller.get(&serial).cloned())
    }

    fn delete_controller_commission(&mut self, serial: Serial) -> Result<bool, StorageError> {
        self.ensure_open()?;
        let previous = self.tables.controller.remove(&serial);
        let existed = previous.is_some();
        self.journal.push(Undo::Controller(serial, previous));
        Ok(existed)
    }

    fn list_controller_serials(&mut self) -> Result<Vec<Serial>, StorageError> {
        self.ensure_open()?;
        Ok(self.tables.controller.keys().copied().collect())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.journal.clear();
        self.open = false;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.undo_all();
        self.open = false;
        Ok(())
    }
}

impl<'a> Drop for InMemoryTransaction<'a> {
    fn drop(&mut self) {
        if self.open {
            self.undo_all();
            self.open = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotaholder_core::objects::{timestamp_now, HoldingSnapshot};

    fn snapshot() -> HoldingSnapshot {
        Holding::new("e", "r", "p", 0).snapshot(&Policy::unbounded("p"))
    }

    fn log_entry(serial: u64, issue_time: DateTime<Utc>) -> ProvisionLog {
        ProvisionLog {
            id: 0,
            serial: Serial::new(serial).unwrap(),
            name: "c".to_string(),
            source: "system".to_string(),
            target: "alice".to_string(),
            resource: "cpu".to_string(),
            issue_time,
            log_time: issue_time,
            delta_quantity: 1,
            source_state: snapshot(),
            target_state: snapshot(),
            reason: "ACCEPT:".to_string(),
        }
    }

    #[test]
    fn test_commit_persists_writes() {
        let storage = InMemoryStorage::new();

        let mut tx = storage.begin().unwrap();
        tx.put_entity(&Entity::root("system", "")).unwrap();
        tx.put_policy(&Policy::unbounded("p")).unwrap();
        tx.put_holding(&Holding::new("system", "cpu", "p", 0)).unwrap();
        tx.commit().unwrap();

        let mut tx = storage.begin().unwrap();
        assert!(tx.get_entity("system").unwrap().is_some());
        assert_eq!(tx.policy_references("p").unwrap(), 1);
        assert_eq!(tx.list_holdings("system").unwrap().len(), 1);
    }

    #[test]
    fn test_rollback_restores_previous_rows() {
        let storage = InMemoryStorage::new();

        let mut tx = storage.begin().unwrap();
        tx.put_entity(&Entity::root("system", "old")).unwrap();
        tx.commit().unwrap();

        let mut tx = storage.begin().unwrap();
        tx.put_entity(&Entity::root("system", "new")).unwrap();
        tx.put_entity(&Entity::new("alice", "system", "k")).unwrap();
        assert_eq!(tx.next_value(Sequence::CommissionSerial).unwrap(), 1);
        tx.append_provision_log(&log_entry(1, timestamp_now())).unwrap();
        tx.rollback().unwrap();

        let mut tx = storage.begin().unwrap();
        assert_eq!(tx.get_entity("system").unwrap().unwrap().key, "old");
        assert!(tx.get_entity("alice").unwrap().is_none());
        assert_eq!(tx.next_value(Sequence::CommissionSerial).unwrap(), 1);
        let all = tx
            .scan_provision_logs(LogCursor::after(DateTime::<Utc>::MIN_UTC), DateTime::<Utc>::MAX_UTC, 10)
            .unwrap();
        assert!(all.is_empty());
    }

    #[test]
    fn test_drop_without_commit_rolls_back() {
        let storage = InMemoryStorage::new();
        {
            let mut tx = storage.begin().unwrap();
            tx.put_policy(&Policy::unbounded("p")).unwrap();
        }
        let mut tx = storage.begin().unwrap();
        assert!(tx.get_policy("p").unwrap().is_none());
    }

    #[test]
    fn test_pending_serials_are_ascending_per_client() {
        let storage = InMemoryStorage::new();
        let mut tx = storage.begin().unwrap();
        for (serial, client) in [(3, "a"), (1, "a"), (2, "b")] {
            tx.put_commission(&Commission {
                serial: Serial::new(serial).unwrap(),
                entity: "alice".to_string(),
                clientkey: client.to_string(),
                name: String::new(),
                issue_time: timestamp_now(),
            })
            .unwrap();
        }
        let pending: Vec<u64> = tx
            .pending_serials("a")
            .unwrap()
            .into_iter()
            .map(|s| *s)
            .collect();
        assert_eq!(pending, vec![1, 3]);
    }

    #[test]
    fn test_log_scan_orders_and_pages() {
        let storage = InMemoryStorage::new();
        let base = timestamp_now();
        let mut tx = storage.begin().unwrap();
        let later = base + chrono::Duration::seconds(1);
        tx.append_provision_log(&log_entry(2, later)).unwrap();
        tx.append_provision_log(&log_entry(1, base)).unwrap();
        tx.append_provision_log(&log_entry(1, base)).unwrap();

        let first = tx
            .scan_provision_logs(LogCursor::after(base - chrono::Duration::seconds(1)), later, 2)
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!((first[0].id, first[1].id), (2, 3));

        let rest = tx
            .scan_provision_logs(LogCursor::at(&first[1]), later, 2)
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, 1);

        // `after` is exclusive, `before` inclusive
        let none = tx.scan_provision_logs(LogCursor::after(later), later, 10).unwrap();
        assert!(none.is_empty());
    }
}
