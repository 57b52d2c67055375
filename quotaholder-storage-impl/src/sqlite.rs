#![cfg(feature = "sqlite")]

use crate::lock_manager::SqliteLockManager;
use crate::storage_traits::{LogCursor, QuotaStorage, Sequence, StorageTransaction};
use anyhow::Context;
use chrono::{DateTime, Utc};
use quotaholder_core::error::StorageError;
use quotaholder_core::id::Serial;
use quotaholder_core::objects::{
    timestamp_from_micros, Commission, ControllerCommission, ControllerStatus, Entity, Holding,
    HoldingSnapshot, Policy, Provision, ProvisionLog,
};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// SQL query constants to avoid repetition
mod sql {
    pub const SCHEMA: &[&str] = &[
        "CREATE TABLE IF NOT EXISTS entities (
            name TEXT PRIMARY KEY,
            owner TEXT,
            key TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_entities_owner ON entities(owner)",
        "CREATE TABLE IF NOT EXISTS policies (
            name TEXT PRIMARY KEY,
            quantity INTEGER,
            capacity INTEGER,
            import_limit INTEGER,
            export_limit INTEGER
        )",
        "CREATE TABLE IF NOT EXISTS holdings (
            entity TEXT NOT NULL,
            resource TEXT NOT NULL,
            policy TEXT NOT NULL,
            flags INTEGER NOT NULL,
            imported INTEGER NOT NULL,
            importing INTEGER NOT NULL,
            exported INTEGER NOT NULL,
            exporting INTEGER NOT NULL,
            returned INTEGER NOT NULL,
            \"returning\" INTEGER NOT NULL,
            released INTEGER NOT NULL,
            releasing INTEGER NOT NULL,
            PRIMARY KEY (entity, resource)
        )",
        "CREATE INDEX IF NOT EXISTS idx_holdings_policy ON holdings(policy)",
        "CREATE TABLE IF NOT EXISTS commissions (
            serial INTEGER PRIMARY KEY,
            entity TEXT NOT NULL,
            clientkey TEXT NOT NULL,
            name TEXT NOT NULL,
            issue_time INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_commissions_clientkey ON commissions(clientkey, serial)",
        "CREATE TABLE IF NOT EXISTS provisions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            serial INTEGER NOT NULL,
            entity TEXT NOT NULL,
            resource TEXT NOT NULL,
            quantity INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_provisions_serial ON provisions(serial)",
        "CREATE TABLE IF NOT EXISTS provision_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            serial INTEGER NOT NULL,
            name TEXT NOT NULL,
            source TEXT NOT NULL,
            target TEXT NOT NULL,
            resource TEXT NOT NULL,
            issue_time INTEGER NOT NULL,
            log_time INTEGER NOT NULL,
            delta_quantity INTEGER NOT NULL,
            states BLOB NOT NULL,
            reason TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_provision_log_time ON provision_log(issue_time, id)",
        "CREATE TABLE IF NOT EXISTS controller_commissions (
            serial INTEGER PRIMARY KEY,
            clientkey TEXT NOT NULL,
            physical_description BLOB NOT NULL,
            status TEXT NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS sequences (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        )",
    ];

    pub const GET_ENTITY: &str = "SELECT name, owner, key FROM entities WHERE name = ?";
    pub const PUT_ENTITY: &str =
        "INSERT OR REPLACE INTO entities (name, owner, key) VALUES (?, ?, ?)";
    pub const DELETE_ENTITY: &str = "DELETE FROM entities WHERE name = ?";
    pub const LIST_CHILDREN: &str = "SELECT name FROM entities WHERE owner = ? ORDER BY name";

    pub const GET_POLICY: &str = "SELECT name, quantity, capacity, import_limit, export_limit
        FROM policies WHERE name = ?";
    pub const PUT_POLICY: &str = "INSERT OR REPLACE INTO policies
        (name, quantity, capacity, import_limit, export_limit) VALUES (?, ?, ?, ?, ?)";
    pub const DELETE_POLICY: &str = "DELETE FROM policies WHERE name = ?";
    pub const POLICY_REFERENCES: &str = "SELECT COUNT(*) AS refs FROM holdings WHERE policy = ?";

    pub const HOLDING_COLUMNS: &str = "entity, resource, policy, flags, imported, importing,
        exported, exporting, returned, \"returning\", released, releasing";
    pub const PUT_HOLDING: &str = "INSERT OR REPLACE INTO holdings
        (entity, resource, policy, flags, imported, importing, exported, exporting,
         returned, \"returning\", released, releasing)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";
    pub const DELETE_HOLDING: &str = "DELETE FROM holdings WHERE entity = ? AND resource = ?";

    pub const GET_SEQUENCE: &str = "SELECT value FROM sequences WHERE name = ?";
    pub const PUT_SEQUENCE: &str = "INSERT OR REPLACE INTO sequences (name, value) VALUES (?, ?)";

    pub const PUT_COMMISSION: &str = "INSERT OR REPLACE INTO commissions
        (serial, entity, clientkey, name, issue_time) VALUES (?, ?, ?, ?, ?)";
    pub const GET_COMMISSION: &str = "SELECT serial, entity, clientkey, name, issue_time
        FROM commissions WHERE serial = ?";
    pub const DELETE_COMMISSION: &str = "DELETE FROM commissions WHERE serial = ?";
    pub const PENDING_SERIALS: &str =
        "SELECT serial FROM commissions WHERE clientkey = ? ORDER BY serial";

    pub const PUT_PROVISION: &str =
        "INSERT INTO provisions (serial, entity, resource, quantity) VALUES (?, ?, ?, ?)";
    pub const PROVISIONS_FOR: &str = "SELECT serial, entity, resource, quantity
        FROM provisions WHERE serial = ? ORDER BY id";
    pub const DELETE_PROVISIONS: &str = "DELETE FROM provisions WHERE serial = ?";

    pub const APPEND_LOG: &str = "INSERT INTO provision_log
        (serial, name, source, target, resource, issue_time, log_time, delta_quantity,
         states, reason)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";
    pub const SCAN_LOG: &str = "SELECT id, serial, name, source, target, resource, issue_time,
            log_time, delta_quantity, states, reason
        FROM provision_log
        WHERE (issue_time > ? OR (issue_time = ? AND id > ?)) AND issue_time <= ?
        ORDER BY issue_time, id
        LIMIT ?";

    pub const PUT_CONTROLLER: &str = "INSERT OR REPLACE INTO controller_commissions
        (serial, clientkey, physical_description, status) VALUES (?, ?, ?, ?)";
    pub const GET_CONTROLLER: &str = "SELECT serial, clientkey, physical_description, status
        FROM controller_commissions WHERE serial = ?";
    pub const DELETE_CONTROLLER: &str = "DELETE FROM controller_commissions WHERE serial = ?";
    pub const LIST_CONTROLLER: &str = "SELECT serial FROM controller_commissions ORDER BY serial";
}

// Not a From impl: neither type is local to this crate
fn db(err: sqlx::Error) -> StorageError {
    StorageError::Database(err.to_string())
}

fn micros(time: &DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

fn from_micros(value: i64) -> Result<DateTime<Utc>, StorageError> {
    timestamp_from_micros(value)
        .ok_or_else(|| StorageError::Database(format!("Invalid timestamp: {}", value)))
}

fn serial_from(value: i64) -> Result<Serial, StorageError> {
    Serial::from_i64(value).map_err(|e| StorageError::Database(e.to_string()))
}

fn flags_from(value: i64) -> Result<u32, StorageError> {
    u32::try_from(value).map_err(|_| StorageError::Database(format!("Invalid flags: {}", value)))
}

fn row_to_entity(row: &SqliteRow) -> Result<Entity, StorageError> {
    Ok(Entity {
        name: row.try_get("name").map_err(db)?,
        owner: row.try_get("owner").map_err(db)?,
        key: row.try_get("key").map_err(db)?,
    })
}

fn row_to_policy(row: &SqliteRow) -> Result<Policy, StorageError> {
    Ok(Policy {
        name: row.try_get("name").map_err(db)?,
        quantity: row.try_get("quantity").map_err(db)?,
        capacity: row.try_get("capacity").map_err(db)?,
        import_limit: row.try_get("import_limit").map_err(db)?,
        export_limit: row.try_get("export_limit").map_err(db)?,
    })
}

fn row_to_holding(row: &SqliteRow) -> Result<Holding, StorageError> {
    Ok(Holding {
        entity: row.try_get("entity").map_err(db)?,
        resource: row.try_get("resource").map_err(db)?,
        policy: row.try_get("policy").map_err(db)?,
        flags: flags_from(row.try_get("flags").map_err(db)?)?,
        imported: row.try_get("imported").map_err(db)?,
        importing: row.try_get("importing").map_err(db)?,
        exported: row.try_get("exported").map_err(db)?,
        exporting: row.try_get("exporting").map_err(db)?,
        returned: row.try_get("returned").map_err(db)?,
        returning: row.try_get("returning").map_err(db)?,
        released: row.try_get("released").map_err(db)?,
        releasing: row.try_get("releasing").map_err(db)?,
    })
}

fn row_to_commission(row: &SqliteRow) -> Result<Commission, StorageError> {
    Ok(Commission {
        serial: serial_from(row.try_get("serial").map_err(db)?)?,
        entity: row.try_get("entity").map_err(db)?,
        clientkey: row.try_get("clientkey").map_err(db)?,
        name: row.try_get("name").map_err(db)?,
        issue_time: from_micros(row.try_get("issue_time").map_err(db)?)?,
    })
}

fn row_to_provision(row: &SqliteRow) -> Result<Provision, StorageError> {
    Ok(Provision {
        serial: serial_from(row.try_get("serial").map_err(db)?)?,
        entity: row.try_get("entity").map_err(db)?,
        resource: row.try_get("resource").map_err(db)?,
        quantity: row.try_get("quantity").map_err(db)?,
    })
}

fn row_to_log(row: &SqliteRow) -> Result<ProvisionLog, StorageError> {
    let id: i64 = row.try_get("id").map_err(db)?;
    let states: Vec<u8> = row.try_get("states").map_err(db)?;
    let (source_state, target_state): (HoldingSnapshot, HoldingSnapshot) =
        bincode::deserialize(&states)
            .map_err(|e| StorageError::Serialization(format!("Invalid log states: {}", e)))?;

    Ok(ProvisionLog {
        id: id as u64,
        serial: serial_from(row.try_get("serial").map_err(db)?)?,
        name: row.try_get("name").map_err(db)?,
        source: row.try_get("source").map_err(db)?,
        target: row.try_get("target").map_err(db)?,
        resource: row.try_get("resource").map_err(db)?,
        issue_time: from_micros(row.try_get("issue_time").map_err(db)?)?,
        log_time: from_micros(row.try_get("log_time").map_err(db)?)?,
        delta_quantity: row.try_get("delta_quantity").map_err(db)?,
        source_state,
        target_state,
        reason: row.try_get("reason").map_err(db)?,
    })
}

fn row_to_controller(row: &SqliteRow) -> Result<ControllerCommission, StorageError> {
    let status: String = row.try_get("status").map_err(db)?;
    Ok(ControllerCommission {
        serial: serial_from(row.try_get("serial").map_err(db)?)?,
        clientkey: row.try_get("clientkey").map_err(db)?,
        physical_description: row.try_get("physical_description").map_err(db)?,
        status: ControllerStatus::parse(&status)
            .map_err(|e| StorageError::Database(e.to_string()))?,
    })
}

/// A SQLite-backed store for the quotaholder ledger, using sqlx.
///
/// Each ledger transaction takes a pooled connection and runs inside
/// `BEGIN IMMEDIATE`, so writers are serialized by SQLite itself.
pub struct SqliteStorage {
    pool: SqlitePool,
    rt: Arc<Runtime>,
    db_path: PathBuf,
}

impl SqliteStorage {
    /// Opens (creating if needed) the database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db_path = path.as_ref().to_path_buf();
        let db_url = format!("sqlite:{}", db_path.to_string_lossy());

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to create runtime")?;
        let rt = Arc::new(rt);

        let options = SqliteConnectOptions::from_str(&db_url)
            .with_context(|| format!("Invalid database URL: {}", db_url))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = rt
            .block_on(async {
                SqlitePoolOptions::new()
                    .max_connections(5)
                    .connect_with(options)
                    .await
            })
            .with_context(|| format!("Failed to connect to database {}", db_path.display()))?;

        rt.block_on(Self::initialize_schema(&pool))
            .context("Failed to initialize database schema")?;

        let storage = Self { pool, rt, db_path };
        storage
            .rt
            .block_on(storage.lock_manager().initialize())?;

        log::debug!("opened sqlite quota store at {}", storage.db_path.display());
        Ok(storage)
    }

    /// Creates the necessary tables in the database
    async fn initialize_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        for statement in sql::SCHEMA {
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }

    /// Lock manager for controller rows stored in the same database
    pub fn lock_manager(&self) -> SqliteLockManager {
        SqliteLockManager::new(self.pool.clone(), self.rt.clone())
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl QuotaStorage for SqliteStorage {
    fn begin(&self) -> Result<Box<dyn StorageTransaction + '_>, StorageError> {
        let conn = self.rt.block_on(async {
            let mut conn = self.pool.acquire().await?;
            sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
            Ok::<_, sqlx::Error>(conn)
        });
        let conn = conn.map_err(|e| StorageError::Database(format!("Failed to begin: {}", e)))?;

        Ok(Box::new(SqliteTransaction {
            conn,
            rt: &self.rt,
            open: true,
        }))
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

/// Transaction over [`SqliteStorage`], rolled back on drop unless committed
pub struct SqliteTransaction<'a> {
    conn: PoolConnection<Sqlite>,
    rt: &'a Runtime,
    open: bool,
}

impl<'a> SqliteTransaction<'a> {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::TransactionClosed(
                "sqlite transaction already finished".to_string(),
            ))
        }
    }

    fn execute<'b>(
        &mut self,
        query: sqlx::query::Query<'b, Sqlite, sqlx::sqlite::SqliteArguments<'b>>,
    ) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let result = self.rt.block_on(query.execute(&mut *self.conn)).map_err(db)?;
        Ok(result.rows_affected())
    }

    fn fetch_optional<'b>(
        &mut self,
        query: sqlx::query::Query<'b, Sqlite, sqlx::sqlite::SqliteArguments<'b>>,
    ) -> Result<Option<SqliteRow>, StorageError> {
        self.ensure_open()?;
        self.rt.block_on(query.fetch_optional(&mut *self.conn)).map_err(db)
    }

    fn fetch_all<'b>(
        &mut self,
        query: sqlx::query::Query<'b, Sqlite, sqlx::sqlite::SqliteArguments<'b>>,
    ) -> Result<Vec<SqliteRow>, StorageError> {
        self.ensure_open()?;
        self.rt.block_on(query.fetch_all(&mut *self.conn)).map_err(db)
    }

    fn finish(&mut self, statement: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.open = false;
        self.rt
            .block_on(sqlx::query(statement).execute(&mut *self.conn))
            .map_err(db)?;
        Ok(())
    }
}

impl<'a> StorageTransaction for SqliteTransaction<'a> {
    fn get_entity(&mut self, name: &str) -> Result<Option<Entity>, StorageError> {
        let row = self.fetch_optional(sqlx::query(sql::GET_ENTITY).bind(name))?;
        row.as_ref().map(row_to_entity).transpose()
    }

    fn put_entity(&mut self, entity: &Entity) -> Result<(), StorageError> {
        self.execute(
            sqlx::query(sql::PUT_ENTITY)
                .bind(&entity.name)
                .bind(&entity.owner)
                .bind(&entity.key),
        )?;
        Ok(())
    }

    fn delete_entity(&mut self, name: &str) -> Result<bool, StorageError> {
        Ok(self.execute(sqlx::query(sql::DELETE_ENTITY).bind(name))? > 0)
    }

    fn list_children(&mut self, owner: &str) -> Result<Vec<String>, StorageError> {
        let rows = self.fetch_all(sqlx::query(sql::LIST_CHILDREN).bind(owner))?;
        rows.iter()
            .map(|row| row.try_get("name").map_err(db))
            .collect()
    }

    fn get_policy(&mut self, name: &str) -> Result<Option<Policy>, StorageError> {
        let row = self.fetch_optional(sqlx::query(sql::GET_POLICY).bind(name))?;
        row.as_ref().map(row_to_policy).transpose()
    }

    fn put_policy(&mut self, policy: &Policy) -> Result<(), StorageError> {
        self.execute(
            sqlx::query(sql::PUT_POLICY)
                .bind(&policy.name)
                .bind(policy.quantity)
                .bind(policy.capacity)
                .bind(policy.import_limit)
                .bind(policy.export_limit),
        )?;
        Ok(())
    }

    fn delete_policy(&mut self, name: &str) -> Result<bool, StorageError> {
        Ok(self.execute(sqlx::query(sql::DELETE_POLICY).bind(name))? > 0)
    }

    fn policy_references(&mut self, name: &str) -> Result<usize, StorageError> {
        let row = self.fetch_optional(sqlx::query(sql::POLICY_REFERENCES).bind(name))?;
        let refs: i64 = match row {
            Some(row) => row.try_get("refs").map_err(db)?,
            None => 0,
        };
        Ok(refs as usize)
    }

    fn get_holding(
        &mut self,
        entity: &str,
        resource: &str,
    ) -> Result<Option<Holding>, StorageError> {
        let query = format!(
            "SELECT {} FROM holdings WHERE entity = ? AND resource = ?",
            sql::HOLDING_COLUMNS
        );
        let row = self.fetch_optional(sqlx::query(&query).bind(entity).bind(resource))?;
        row.as_ref().map(row_to_holding).transpose()
    }

    fn put_holding(&mut self, holding: &Holding) -> Result<(), StorageError> {
        self.execute(
            sqlx::query(sql::PUT_HOLDING)
                .bind(&holding.entity)
                .bind(&holding.resource)
                .bind(&holding.policy)
                .bind(holding.flags as i64)
                .bind(holding.imported)
                .bind(holding.importing)
                .bind(holding.exported)
                .bind(holding.exporting)
                .bind(holding.returned)
                .bind(holding.returning)
                .bind(holding.released)
                .bind(holding.releasing),
        )?;
        Ok(())
    }

    fn delete_holding(&mut self, entity: &str, resource: &str) -> Result<bool, StorageError> {
        Ok(self.execute(sqlx::query(sql::DELETE_HOLDING).bind(entity).bind(resource))? > 0)
    }

    fn list_holdings(&mut self, entity: &str) -> Result<Vec<Holding>, StorageError> {
        let query = format!(
            "SELECT {} FROM holdings WHERE entity = ? ORDER BY resource",
            sql::HOLDING_COLUMNS
        );
        let rows = self.fetch_all(sqlx::query(&query).bind(entity))?;
        rows.iter().map(row_to_holding).collect()
    }

    fn next_value(&mut self, sequence: Sequence) -> Result<u64, StorageError> {
        let row = self.fetch_optional(sqlx::query(sql::GET_SEQUENCE).bind(sequence.name()))?;
        let current: i64 = match row {
            Some(row) => row.try_get("value").map_err(db)?,
            None => 0,
        };
        let next = current.checked_add(1).ok_or_else(|| {
            StorageError::Other(format!("sequence {} exhausted", sequence.name()))
        })?;
        self.execute(
            sqlx::query(sql::PUT_SEQUENCE)
                .bind(sequence.name())
                .bind(next),
        )?;
        Ok(next as u64)
    }

    fn put_commission(&mut self, commission: &Commission) -> Result<(), StorageError> {
        self.execute(
            sqlx::query(sql::PUT_COMMISSION)
                .bind(commission.serial.as_i64())
                .bind(&commission.entity)
                .bind(&commission.clientkey)
                .bind(&commission.name)
                .bind(micros(&commission.issue_time)),
        )?;
        Ok(())
    }

    fn get_commission(&mut self, serial: Serial) -> Result<Option<Commission>, StorageError> {
        let row = self.fetch_optional(sqlx::query(sql::GET_COMMISSION).bind(serial.as_i64()))?;
        row.as_ref().map(row_to_commission).transpose()
    }

    fn delete_commission(&mut self, serial: Serial) -> Result<bool, StorageError> {
        Ok(self.execute(sqlx::query(sql::DELETE_COMMISSION).bind(serial.as_i64()))? > 0)
    }

    fn pending_serials(&mut self, clientkey: &str) -> Result<Vec<Serial>, StorageError> {
        let rows = self.fetch_all(sqlx::query(sql::PENDING_SERIALS).bind(clientkey))?;
        rows.iter()
            .map(|row| serial_from(row.try_get("serial").map_err(db)?))
            .collect()
    }

    fn put_provision(&mut self, provision: &Provision) -> Result<(), StorageError> {
        self.execute(
            sqlx::query(sql::PUT_PROVISION)
                .bind(provision.serial.as_i64())
                .bind(&provision.entity)
                .bind(&provision.resource)
                .bind(provision.quantity),
        )?;
        Ok(())
    }

    fn provisions_for(&mut self, serial: Serial) -> Result<Vec<Provision>, StorageError> {
        let rows = self.fetch_all(sqlx::query(sql::PROVISIONS_FOR).bind(serial.as_i64()))?;
        rows.iter().map(row_to_provision).collect()
    }

    fn delete_provisions(&mut self, serial: Serial) -> Result<usize, StorageError> {
        Ok(self.execute(sqlx::query(sql::DELETE_PROVISIONS).bind(serial.as_i64()))? as usize)
    }

    fn append_provision_log(&mut self, entry: &ProvisionLog) -> Result<u64, StorageError> {
        let states = bincode::serialize(&(&entry.source_state, &entry.target_state))
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.ensure_open()?;
        let result = self
            .rt
            .block_on(
                sqlx::query(sql::APPEND_LOG)
                    .bind(entry.serial.as_i64())
                    .bind(&entry.name)
                    .bind(&entry.source)
                    .bind(&entry.target)
                    .bind(&entry.resource)
                    .bind(micros(&entry.issue_time))
                    .bind(micros(&entry.log_time))
                    .bind(entry.delta_quantity)
                    .bind(states)
                    .bind(&entry.reason)
                    .execute(&mut *self.conn),
            )
            .map_err(db)?;
        Ok(result.last_insert_rowid() as u64)
    }

    fn scan_provision_logs(
        &mut self,
        cursor: LogCursor,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProvisionLog>, StorageError> {
        let after = micros(&cursor.issue_time);
        let after_id = i64::try_from(cursor.id).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self.fetch_all(
            sqlx::query(sql::SCAN_LOG)
                .bind(after)
                .bind(after)
                .bind(after_id)
                .bind(micros(&before))
                .bind(limit),
        )?;
        rows.iter().map(row_to_log).collect()
    }

    fn put_controller_commission(
        &mut self,
        commission: &ControllerCommission,
    ) -> Result<(), StorageError> {
        self.execute(
            sqlx::query(sql::PUT_CONTROLLER)
                .bind(commission.serial.as_i64())
                .bind(&commission.clientkey)
                .bind(&commission.physical_description)
                .bind(commission.status.as_str()),
        )?;
        Ok(())
    }

    fn get_controller_commission(
        &mut self,
        serial: Serial,
    ) -> Result<Option<ControllerCommission>, StorageError> {
        let row = self.fetch_optional(sqlx::query(sql::GET_CONTROLLER).bind(serial.as_i64()))?;
        row.as_ref().map(row_to_controller).transpose()
    }

    fn delete_controller_commission(&mut self, serial: Serial) -> Result<bool, StorageError> {
        Ok(self.execute(sqlx::query(sql::DELETE_CONTROLLER).bind(serial.as_i64()))? > 0)
    }

    fn list_controller_serials(&mut self) -> Result<Vec<Serial>, StorageError> {
        let rows = self.fetch_all(sqlx::query(sql::LIST_CONTROLLER))?;
        rows.iter()
            .map(|row| serial_from(row.try_get("serial").map_err(db)?))
            .collect()
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("COMMIT")
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("ROLLBACK")
    }
}

impl<'a> Drop for SqliteTransaction<'a> {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            if let Err(e) = self
                .rt
                .block_on(sqlx::query("ROLLBACK").execute(&mut *self.conn))
            {
                log::warn!("failed to roll back sqlite transaction: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotaholder_core::objects::timestamp_now;
    use tempfile::tempdir;

    fn open() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::new(dir.path().join("quota.db")).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_basic_storage_operations() {
        let (_dir, storage) = open();

        let mut tx = storage.begin().unwrap();
        tx.put_entity(&Entity::root("system", "")).unwrap();
        tx.put_entity(&Entity::new("alice", "system", "k")).unwrap();
        tx.put_policy(&Policy::new("p", Some(-3), None, Some(4), None))
            .unwrap();
        let mut holding = Holding::new("alice", "cpu", "p", 7);
        holding.importing = 5;
        tx.put_holding(&holding).unwrap();
        tx.commit().unwrap();

        let mut tx = storage.begin().unwrap();
        assert_eq!(tx.get_entity("system").unwrap().unwrap().owner, None);
        assert_eq!(tx.list_children("system").unwrap(), vec!["alice".to_string()]);
        let policy = tx.get_policy("p").unwrap().unwrap();
        assert_eq!(policy.quantity, Some(-3));
        assert_eq!(policy.capacity, None);
        assert_eq!(tx.get_holding("alice", "cpu").unwrap().unwrap(), holding);
        assert_eq!(tx.policy_references("p").unwrap(), 1);
    }

    #[test]
    fn test_drop_rolls_back() {
        let (_dir, storage) = open();
        {
            let mut tx = storage.begin().unwrap();
            tx.put_policy(&Policy::unbounded("p")).unwrap();
            assert_eq!(tx.next_value(Sequence::AnonymousPolicy).unwrap(), 1);
        }
        let mut tx = storage.begin().unwrap();
        assert!(tx.get_policy("p").unwrap().is_none());
        assert_eq!(tx.next_value(Sequence::AnonymousPolicy).unwrap(), 1);
        assert_eq!(tx.next_value(Sequence::AnonymousPolicy).unwrap(), 2);
    }

    #[test]
    fn test_commissions_and_provisions() {
        let (_dir, storage) = open();
        let serial = Serial::new(4).unwrap();
        let issue_time = timestamp_now();

        let mut tx = storage.begin().unwrap();
        tx.put_commission(&Commission {
            serial,
            entity: "alice".to_string(),
            clientkey: "client".to_string(),
            name: "vm".to_string(),
            issue_time,
        })
        .unwrap();
        for (resource, quantity) in [("cpu", 2), ("ram", -1)] {
            tx.put_provision(&Provision {
                serial,
                entity: "system".to_string(),
                resource: resource.to_string(),
                quantity,
            })
            .unwrap();
        }
        tx.commit().unwrap();

        let mut tx = storage.begin().unwrap();
        let commission = tx.get_commission(serial).unwrap().unwrap();
        assert_eq!(commission.issue_time, issue_time);
        assert_eq!(tx.pending_serials("client").unwrap(), vec![serial]);
        let provisions = tx.provisions_for(serial).unwrap();
        assert_eq!(provisions.len(), 2);
        assert_eq!(provisions[1].quantity, -1);

        assert_eq!(tx.delete_provisions(serial).unwrap(), 2);
        assert!(tx.delete_commission(serial).unwrap());
        assert!(tx.pending_serials("client").unwrap().is_empty());
    }

    #[test]
    fn test_provision_log_round_trip_and_scan() {
        let (_dir, storage) = open();
        let base = timestamp_now();
        let state = Holding::new("system", "cpu", "p", 0).snapshot(&Policy::unbounded("p"));
        let entry = ProvisionLog {
            id: 0,
            serial: Serial::FIRST,
            name: "c".to_string(),
            source: "system".to_string(),
            target: "alice".to_string(),
            resource: "cpu".to_string(),
            issue_time: base,
            log_time: base,
            delta_quantity: 3,
            source_state: state.clone(),
            target_state: state,
            reason: "ACCEPT:ok".to_string(),
        };

        let mut tx = storage.begin().unwrap();
        let first = tx.append_provision_log(&entry).unwrap();
        let second = tx.append_provision_log(&entry).unwrap();
        assert!(second > first);
        tx.commit().unwrap();

        let mut tx = storage.begin().unwrap();
        let earlier = base - chrono::Duration::seconds(1);
        let page = tx
            .scan_provision_logs(LogCursor::after(earlier), base, 1)
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, first);
        assert_eq!(page[0].source_state, entry.source_state);

        let rest = tx
            .scan_provision_logs(LogCursor::at(&page[0]), base, 10)
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, second);

        assert!(tx
            .scan_provision_logs(LogCursor::after(base), base, 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_controller_rows() {
        let (_dir, storage) = open();
        let row = ControllerCommission {
            serial: Serial::new(9).unwrap(),
            clientkey: "controller".to_string(),
            physical_description: vec![1, 2, 3],
            status: ControllerStatus::Failing,
        };

        let mut tx = storage.begin().unwrap();
        tx.put_controller_commission(&row).unwrap();
        tx.commit().unwrap();

        let mut tx = storage.begin().unwrap();
        assert_eq!(tx.get_controller_commission(row.serial).unwrap().unwrap(), row);
        assert_eq!(tx.list_controller_serials().unwrap(), vec![row.serial]);
        assert!(tx.delete_controller_commission(row.serial).unwrap());
        assert!(tx.list_controller_serials().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quota.db");
        {
            let storage = SqliteStorage::new(&path).unwrap();
            let mut tx = storage.begin().unwrap();
            tx.put_entity(&Entity::root("system", "")).unwrap();
            tx.commit().unwrap();
        }
        let storage = SqliteStorage::new(&path).unwrap();
        let mut tx = storage.begin().unwrap();
        assert!(tx.get_entity("system").unwrap().is_some());
    }
}
