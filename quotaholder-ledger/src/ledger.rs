use crate::config::LedgerConfig;
use crate::items::{
    AddQuota, CreateEntity, EntityInfo, EntityKey, HoldingInfo, HoldingKey, PolicyLimits,
    QuotaInfo, SetEntityKey, SetHolding, SetQuota,
};
use quotaholder_core::error::QuotaError;
use quotaholder_core::id::validate_name;
use quotaholder_core::objects::{Entity, Holding, Policy};
use quotaholder_core::quota::add_limit;
use quotaholder_storage_impl::{InMemoryStorage, QuotaStorage, Sequence, StorageTransaction};
use std::fmt;
use std::sync::Arc;

/// The quota ledger.
///
/// Owns entities, policies and holdings, and runs the commission protocol
/// over them. Every public call executes inside exactly one storage
/// transaction (accept/reject use one per serial) and rolls back on error.
pub struct QuotaHolder {
    storage: Arc<dyn QuotaStorage>,
    config: LedgerConfig,
}

impl fmt::Debug for QuotaHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaHolder")
            .field("backend", &self.storage.backend_name())
            .field("config", &self.config)
            .finish()
    }
}

impl QuotaHolder {
    /// Open a ledger over a store, creating the root entity if it is missing
    pub fn open(storage: Arc<dyn QuotaStorage>, config: LedgerConfig) -> Result<Self, QuotaError> {
        validate_name("entity", &config.root_entity)?;
        if config.timeline_chunk == 0 {
            return Err(QuotaError::InvalidData(
                "timeline_chunk must be positive".to_string(),
            ));
        }

        let holder = Self { storage, config };
        holder.transact("open", |tx| {
            match tx.get_entity(&holder.config.root_entity)? {
                Some(root) if root.is_root() => Ok(()),
                Some(other) => Err(QuotaError::Corrupted(format!(
                    "root entity {} has an owner {:?}",
                    other.name, other.owner
                ))),
                None => {
                    log::info!("creating root entity {}", holder.config.root_entity);
                    tx.put_entity(&Entity::root(
                        holder.config.root_entity.clone(),
                        holder.config.root_key.clone(),
                    ))?;
                    Ok(())
                }
            }
        })?;
        Ok(holder)
    }

    /// A ledger over a fresh in-memory store with default settings
    pub fn in_memory() -> Result<Self, QuotaError> {
        Self::open(Arc::new(InMemoryStorage::new()), LedgerConfig::default())
    }

    pub fn storage(&self) -> &Arc<dyn QuotaStorage> {
        &self.storage
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn root_entity(&self) -> &str {
        &self.config.root_entity
    }

    /// Run `f` in one storage transaction, committing on success
    pub(crate) fn transact<T>(
        &self,
        call: &str,
        f: impl FnOnce(&mut dyn StorageTransaction) -> Result<T, QuotaError>,
    ) -> Result<T, QuotaError> {
        let mut tx = self.storage.begin()?;
        match f(&mut *tx) {
            Ok(value) => {
                tx.commit()?;
                log::debug!("{} committed on {}", call, self.storage.backend_name());
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    log::warn!("{}: rollback failed: {}", call, rollback);
                }
                log::debug!("{} rolled back: {}", call, err);
                Err(err)
            }
        }
    }

    /// Apply `apply` to every item, returning the rejected ones
    fn batch<I: fmt::Debug>(
        &self,
        call: &str,
        items: Vec<I>,
        mut apply: impl FnMut(&mut dyn StorageTransaction, &I) -> Result<(), QuotaError>,
    ) -> Result<Vec<I>, QuotaError> {
        self.transact(call, |tx| {
            let mut rejected = Vec::new();
            for item in items {
                match apply(&mut *tx, &item) {
                    Ok(()) => {}
                    Err(err) if err.is_rejection() => {
                        log::warn!("{}: rejected {:?}: {}", call, item, err);
                        rejected.push(item);
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(rejected)
        })
    }

    /// Look up every item, silently skipping the unauthorized or missing ones
    fn lookup<I: fmt::Debug, O>(
        &self,
        call: &str,
        items: Vec<I>,
        mut get: impl FnMut(&mut dyn StorageTransaction, &I) -> Result<O, QuotaError>,
    ) -> Result<Vec<O>, QuotaError> {
        self.transact(call, |tx| {
            let mut found = Vec::with_capacity(items.len());
            for item in &items {
                match get(&mut *tx, item) {
                    Ok(value) => found.push(value),
                    Err(err) if err.is_rejection() => {
                        log::debug!("{}: skipped {:?}: {}", call, item, err);
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(found)
        })
    }

    // Entities

    pub fn create_entity(&self, items: Vec<CreateEntity>) -> Result<Vec<CreateEntity>, QuotaError> {
        self.batch("create_entity", items, |tx, item| {
            create_child(tx, &item.entity, &item.owner, &item.ownerkey, &item.key)
        })
    }

    pub fn set_entity_key(&self, items: Vec<SetEntityKey>) -> Result<Vec<SetEntityKey>, QuotaError> {
        self.batch("set_entity_key", items, |tx, item| {
            let mut entity = authorize(tx, &item.entity, &item.key)?;
            entity.key = item.newkey.clone();
            tx.put_entity(&entity)?;
            Ok(())
        })
    }

    /// Names of the entities owned by an entity
    pub fn list_entities(&self, item: &EntityKey) -> Result<Vec<String>, QuotaError> {
        self.transact("list_entities", |tx| {
            authorize(tx, &item.entity, &item.key)?;
            Ok(tx.list_children(&item.entity)?)
        })
    }

    pub fn get_entity(&self, items: Vec<EntityKey>) -> Result<Vec<EntityInfo>, QuotaError> {
        self.lookup("get_entity", items, |tx, item| {
            let entity = authorize(tx, &item.entity, &item.key)?;
            Ok(EntityInfo {
                owner: entity.owner_name().to_string(),
                entity: entity.name,
            })
        })
    }

    /// Delete entities that own neither entities nor holdings
    pub fn release_entity(&self, items: Vec<EntityKey>) -> Result<Vec<EntityKey>, QuotaError> {
        self.batch("release_entity", items, |tx, item| {
            let entity = authorize(tx, &item.entity, &item.key)?;
            if entity.is_root() {
                return Err(QuotaError::InvalidData(format!(
                    "root entity {} cannot be released",
                    entity.name
                )));
            }
            if !tx.list_children(&entity.name)?.is_empty() {
                return Err(QuotaError::InvalidData(format!(
                    "entity {} still owns entities",
                    entity.name
                )));
            }
            if !tx.list_holdings(&entity.name)?.is_empty() {
                return Err(QuotaError::InvalidData(format!(
                    "entity {} still has holdings",
                    entity.name
                )));
            }
            tx.delete_entity(&entity.name)?;
            Ok(())
        })
    }

    // Policies

    pub fn get_limits(&self, policies: Vec<String>) -> Result<Vec<PolicyLimits>, QuotaError> {
        self.lookup("get_limits", policies, |tx, name| {
            tx.get_policy(name)?
                .map(PolicyLimits::from)
                .ok_or_else(|| QuotaError::NoEntity(format!("no policy {}", name)))
        })
    }

    /// Create or update named policies; every holding pointing at one sees the change
    pub fn set_limits(&self, items: Vec<PolicyLimits>) -> Result<Vec<PolicyLimits>, QuotaError> {
        self.batch("set_limits", items, |tx, item| {
            validate_name("policy", &item.policy)?;
            let policy = item.to_policy();
            policy.validate()?;
            tx.put_policy(&policy)?;
            Ok(())
        })
    }

    // Holdings

    pub fn get_holding(&self, items: Vec<HoldingKey>) -> Result<Vec<HoldingInfo>, QuotaError> {
        self.lookup("get_holding", items, |tx, item| {
            authorize(tx, &item.entity, &item.key)?;
            let holding = require_holding(tx, &item.entity, &item.resource)?;
            Ok(HoldingInfo::from(&holding))
        })
    }

    /// Point holdings at existing named policies, creating the holdings if needed
    pub fn set_holding(&self, items: Vec<SetHolding>) -> Result<Vec<SetHolding>, QuotaError> {
        self.batch("set_holding", items, |tx, item| {
            authorize(tx, &item.entity, &item.key)?;
            validate_name("resource", &item.resource)?;
            if tx.get_policy(&item.policy)?.is_none() {
                return Err(QuotaError::NoEntity(format!("no policy {}", item.policy)));
            }
            repoint(tx, &item.entity, &item.resource, &item.policy, item.flags)
        })
    }

    /// Resources an entity holds, sorted
    pub fn list_resources(&self, item: &EntityKey) -> Result<Vec<String>, QuotaError> {
        self.transact("list_resources", |tx| {
            authorize(tx, &item.entity, &item.key)?;
            Ok(tx
                .list_holdings(&item.entity)?
                .into_iter()
                .map(|h| h.resource)
                .collect())
        })
    }

    /// Holdings of every authorized entity, plus the rejected entity items
    pub fn list_holdings(
        &self,
        items: Vec<EntityKey>,
    ) -> Result<(Vec<HoldingInfo>, Vec<EntityKey>), QuotaError> {
        let mut holdings = Vec::new();
        let rejected = self.batch("list_holdings", items, |tx, item| {
            authorize(tx, &item.entity, &item.key)?;
            holdings.extend(tx.list_holdings(&item.entity)?.iter().map(HoldingInfo::from));
            Ok(())
        })?;
        Ok((holdings, rejected))
    }

    pub fn get_quota(&self, items: Vec<HoldingKey>) -> Result<Vec<QuotaInfo>, QuotaError> {
        self.lookup("get_quota", items, |tx, item| {
            authorize(tx, &item.entity, &item.key)?;
            let holding = require_holding(tx, &item.entity, &item.resource)?;
            let policy = policy_of(tx, &holding)?;
            Ok(QuotaInfo::new(&holding, &policy))
        })
    }

    /// Give holdings fresh private limits, creating the holdings if needed
    pub fn set_quota(&self, items: Vec<SetQuota>) -> Result<Vec<SetQuota>, QuotaError> {
        self.batch("set_quota", items, |tx, item| {
            authorize(tx, &item.entity, &item.key)?;
            validate_name("resource", &item.resource)?;
            let limits = Policy::new(
                format!("{}.{}", item.entity, item.resource),
                item.quantity,
                item.capacity,
                item.import_limit,
                item.export_limit,
            );
            limits.validate()?;
            let policy = allocate_policy(tx, &limits)?;
            repoint(tx, &item.entity, &item.resource, &policy.name, item.flags)
        })
    }

    /// Shift the limits of existing holdings by signed deltas
    pub fn add_quota(&self, items: Vec<AddQuota>) -> Result<Vec<AddQuota>, QuotaError> {
        self.batch("add_quota", items, |tx, item| {
            authorize(tx, &item.entity, &item.key)?;
            let holding = require_holding(tx, &item.entity, &item.resource)?;
            let current = policy_of(tx, &holding)?;
            let limits = Policy::new(
                holding.label(),
                add_limit(current.quantity, item.quantity, "quantity")?,
                add_limit(current.capacity, item.capacity, "capacity")?,
                add_limit(current.import_limit, item.import_limit, "import_limit")?,
                add_limit(current.export_limit, item.export_limit, "export_limit")?,
            );
            limits.validate()?;
            let policy = allocate_policy(tx, &limits)?;
            repoint(tx, &item.entity, &item.resource, &policy.name, holding.flags)
        })
    }

    /// Zero the settled counters of holdings
    pub fn reset_holding(&self, items: Vec<HoldingKey>) -> Result<Vec<HoldingKey>, QuotaError> {
        self.batch("reset_holding", items, |tx, item| {
            authorize(tx, &item.entity, &item.key)?;
            let mut holding = require_holding(tx, &item.entity, &item.resource)?;
            holding.reset_settled();
            tx.put_holding(&holding)?;
            Ok(())
        })
    }

    /// Delete idle holdings
    pub fn release_holding(&self, items: Vec<HoldingKey>) -> Result<Vec<HoldingKey>, QuotaError> {
        self.batch("release_holding", items, |tx, item| {
            authorize(tx, &item.entity, &item.key)?;
            let holding = require_holding(tx, &item.entity, &item.resource)?;
            if !holding.is_idle() {
                return Err(QuotaError::InvalidData(format!(
                    "holding {} is not idle",
                    holding.label()
                )));
            }
            tx.delete_holding(&holding.entity, &holding.resource)?;
            collect_policy(tx, &holding.policy)
        })
    }
}

/// Fetch an entity and check the presented key
pub(crate) fn authorize(
    tx: &mut dyn StorageTransaction,
    name: &str,
    key: &str,
) -> Result<Entity, QuotaError> {
    let entity = tx
        .get_entity(name)?
        .ok_or_else(|| QuotaError::NoEntity(format!("no entity {}", name)))?;
    if !entity.key_matches(key) {
        return Err(QuotaError::InvalidKey(format!("bad key for entity {}", name)));
    }
    Ok(entity)
}

/// Create `name` under `owner`, which must accept `ownerkey`
pub(crate) fn create_child(
    tx: &mut dyn StorageTransaction,
    name: &str,
    owner: &str,
    ownerkey: &str,
    key: &str,
) -> Result<(), QuotaError> {
    validate_name("entity", name)?;
    if tx.get_entity(name)?.is_some() {
        return Err(QuotaError::InvalidData(format!("entity {} already exists", name)));
    }
    authorize(tx, owner, ownerkey)?;
    tx.put_entity(&Entity::new(name, owner, key))?;
    Ok(())
}

fn require_holding(
    tx: &mut dyn StorageTransaction,
    entity: &str,
    resource: &str,
) -> Result<Holding, QuotaError> {
    tx.get_holding(entity, resource)?
        .ok_or_else(|| QuotaError::NoEntity(format!("no holding {}.{}", entity, resource)))
}

/// The policy a holding points at; a dangling reference is corruption
pub(crate) fn policy_of(
    tx: &mut dyn StorageTransaction,
    holding: &Holding,
) -> Result<Policy, QuotaError> {
    tx.get_policy(&holding.policy)?.ok_or_else(|| {
        QuotaError::Corrupted(format!(
            "holding {} points at missing policy {}",
            holding.label(),
            holding.policy
        ))
    })
}

/// Store a copy of `limits` under a fresh anonymous name
fn allocate_policy(tx: &mut dyn StorageTransaction, limits: &Policy) -> Result<Policy, QuotaError> {
    loop {
        let name = format!("anon:{}", tx.next_value(Sequence::AnonymousPolicy)?);
        if tx.get_policy(&name)?.is_none() {
            let policy = Policy {
                name,
                ..limits.clone()
            };
            tx.put_policy(&policy)?;
            return Ok(policy);
        }
    }
}

/// Point a holding at `policy`, creating it when absent, and collect the old policy
fn repoint(
    tx: &mut dyn StorageTransaction,
    entity: &str,
    resource: &str,
    policy: &str,
    flags: u32,
) -> Result<(), QuotaError> {
    match tx.get_holding(entity, resource)? {
        Some(mut holding) => {
            let old = std::mem::replace(&mut holding.policy, policy.to_string());
            holding.flags = flags;
            tx.put_holding(&holding)?;
            if old != policy {
                collect_policy(tx, &old)?;
            }
        }
        None => tx.put_holding(&Holding::new(entity, resource, policy, flags))?,
    }
    Ok(())
}

/// Delete a policy once no holding references it
fn collect_policy(tx: &mut dyn StorageTransaction, name: &str) -> Result<(), QuotaError> {
    if tx.policy_references(name)? == 0 && tx.delete_policy(name)? {
        log::debug!("collected unreferenced policy {}", name);
    }
    Ok(())
}
