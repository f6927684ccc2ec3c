//! Database façade: store registry, upgrade protocol, combined commits.

use crate::backend::{index_table_prefix, table_prefix, Backend, BatchFragment};
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::object_store::{validate_schema_name, ObjectStore, StoreOptions, UpgradeCondition};
use crate::transaction::{Transaction, TransactionState};
use crate::watchdog::DEFAULT_TRANSACTION_TIMEOUT;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stratadb_storage::{BatchOp, KvEngine, LogEngine, LogEngineConfig, MemoryEngine};
use tracing::{debug, warn};

/// Reserved root key holding the schema version as ASCII digits. Table
/// namespaces all start with `!`, so it can never collide.
const VERSION_KEY: &[u8] = b"_dbVersion";

/// Process-wide counter handing out database instance ids.
static INSTANCE_IDS: AtomicU64 = AtomicU64::new(1);

/// Configuration for opening a database.
#[derive(Clone)]
pub struct DatabaseConfig {
    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to fsync the root engine log on every commit.
    pub sync_on_commit: bool,

    /// Compaction threshold for the root engine log, in bytes.
    pub compact_threshold: u64,

    /// Watchdog deadline for transactions; `None` disables the watchdog.
    pub transaction_timeout: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            compact_threshold: 64 * 1024 * 1024, // 64 MB
            transaction_timeout: Some(DEFAULT_TRANSACTION_TIMEOUT),
        }
    }
}

impl DatabaseConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to fsync on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the root log compaction threshold.
    #[must_use]
    pub const fn compact_threshold(mut self, bytes: u64) -> Self {
        self.compact_threshold = bytes;
        self
    }

    /// Sets the transaction watchdog deadline (`None` disables it).
    #[must_use]
    pub const fn transaction_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transaction_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("create_if_missing", &self.create_if_missing)
            .field("sync_on_commit", &self.sync_on_commit)
            .field("compact_threshold", &self.compact_threshold)
            .field("transaction_timeout", &self.transaction_timeout)
            .finish()
    }
}

/// Options accepted when deleting an object store.
#[derive(Default)]
pub struct DeleteStoreOptions {
    upgrade_condition: Option<UpgradeCondition>,
    index_names: Vec<String>,
}

impl DeleteStoreOptions {
    /// Creates options with defaults (unconditional deletion, no index
    /// tables).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deletes only when the condition holds for the old version.
    #[must_use]
    pub fn upgrade_condition(
        mut self,
        condition: impl Fn(u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.upgrade_condition = Some(Arc::new(condition));
        self
    }

    /// Names the deleted store's index tables, so they are dropped too.
    #[must_use]
    pub fn index_names(mut self, names: Vec<String>) -> Self {
        self.index_names = names;
        self
    }
}

impl std::fmt::Debug for DeleteStoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeleteStoreOptions")
            .field("has_upgrade_condition", &self.upgrade_condition.is_some())
            .field("index_names", &self.index_names)
            .finish()
    }
}

struct StoreDeletion {
    name: String,
    index_names: Vec<String>,
    condition: Option<UpgradeCondition>,
}

/// The main database handle.
///
/// A database owns one root engine and a registry of object stores that
/// share it. Opening is two-phase: `open` locks the directory and enters
/// the schema-declaration phase (`create_object_store`, `create_index`,
/// `delete_object_store`); `connect` builds the engine, runs the upgrade
/// protocol, and freezes the schema.
///
/// # Example
///
/// ```rust,ignore
/// let db = Database::open(Path::new("my_db"), 1, DatabaseConfig::default())?;
/// let users = db.create_object_store("users", StoreOptions::default())?;
/// users.create_index("by_email", KeyPath::new("email"), IndexOptions::new().unique())?;
/// db.connect_with(|old, new, db| {
///     // populate or migrate
///     Ok(())
/// })?;
/// ```
pub struct Database {
    id: u64,
    version: u32,
    config: DatabaseConfig,
    dir: Option<DatabaseDir>,
    engine: RwLock<Option<Arc<dyn KvEngine>>>,
    stores: RwLock<BTreeMap<String, Arc<ObjectStore>>>,
    deletions: Mutex<Vec<StoreDeletion>>,
    connected: RwLock<bool>,
    ids: Arc<AtomicU64>,
}

impl Database {
    /// Opens (or creates) a database directory and locks it.
    ///
    /// The returned handle is in the schema-declaration phase; call
    /// [`Database::connect`] or [`Database::connect_with`] before reading
    /// or writing data.
    pub fn open(path: &Path, version: u32, config: DatabaseConfig) -> CoreResult<Self> {
        let dir = DatabaseDir::open(path, config.create_if_missing)?;
        Ok(Self::with_dir(Some(dir), version, config))
    }

    /// Opens a fresh in-memory database (volatile root engine).
    pub fn open_in_memory(version: u32) -> CoreResult<Self> {
        Ok(Self::with_dir(None, version, DatabaseConfig::default()))
    }

    /// Opens a fresh in-memory database with custom configuration.
    pub fn open_in_memory_with_config(version: u32, config: DatabaseConfig) -> CoreResult<Self> {
        Ok(Self::with_dir(None, version, config))
    }

    fn with_dir(dir: Option<DatabaseDir>, version: u32, config: DatabaseConfig) -> Self {
        Self {
            id: INSTANCE_IDS.fetch_add(1, Ordering::SeqCst),
            version,
            config,
            dir,
            engine: RwLock::new(None),
            stores: RwLock::new(BTreeMap::new()),
            deletions: Mutex::new(Vec::new()),
            connected: RwLock::new(false),
            ids: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Returns the schema version this handle was opened with.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether `connect` has completed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    /// Declares an object store. Only valid before `connect`.
    pub fn create_object_store(
        &self,
        name: &str,
        options: StoreOptions,
    ) -> CoreResult<Arc<ObjectStore>> {
        if self.is_connected() {
            return Err(CoreError::schema_change_while_connected(format!(
                "cannot create object store {name:?} on a connected database"
            )));
        }
        validate_schema_name(name, "store")?;
        let mut stores = self.stores.write();
        if stores.contains_key(name) {
            return Err(CoreError::invalid_argument(format!(
                "object store {name:?} already exists"
            )));
        }
        let store = Arc::new(ObjectStore::new(
            name.to_string(),
            options,
            Arc::clone(&self.ids),
            self.config.transaction_timeout,
        ));
        stores.insert(name.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Schedules an object store's data for deletion during the next
    /// upgrade. Only valid before `connect`.
    pub fn delete_object_store(&self, name: &str, options: DeleteStoreOptions) -> CoreResult<()> {
        if self.is_connected() {
            return Err(CoreError::schema_change_while_connected(format!(
                "cannot delete object store {name:?} on a connected database"
            )));
        }
        self.stores.write().remove(name);
        self.deletions.lock().push(StoreDeletion {
            name: name.to_string(),
            index_names: options.index_names,
            condition: options.upgrade_condition,
        });
        Ok(())
    }

    /// Returns a declared object store by name.
    pub fn get_object_store(&self, name: &str) -> CoreResult<Arc<ObjectStore>> {
        self.stores
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::store_not_found(name))
    }

    /// Names of the declared object stores.
    #[must_use]
    pub fn object_store_names(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }

    /// Connects without an upgrade callback.
    pub fn connect(&self) -> CoreResult<()> {
        self.connect_with(|_, _, _| Ok(()))
    }

    /// Builds the root engine, runs the upgrade protocol, and freezes the
    /// schema.
    ///
    /// Upgrade order when the requested version exceeds the stored one:
    /// conditional truncation of deleted stores (and declared stores whose
    /// own upgrade condition holds), backend initialisation, the user
    /// callback `(old, new, &db)`, then the version write. When the
    /// versions match, every upgrade step is skipped. A stored version
    /// newer than the requested one is an error.
    pub fn connect_with<F>(&self, on_upgrade: F) -> CoreResult<()>
    where
        F: FnOnce(u32, u32, &Database) -> CoreResult<()>,
    {
        if self.is_connected() {
            return Err(CoreError::invalid_state("database is already connected"));
        }

        let engine: Arc<dyn KvEngine> = match &self.dir {
            Some(dir) => Arc::new(LogEngine::open_with_config(
                &dir.kv_log_path(),
                LogEngineConfig::new()
                    .sync_on_apply(self.config.sync_on_commit)
                    .compact_threshold(self.config.compact_threshold),
            )?),
            None => Arc::new(MemoryEngine::new()),
        };

        let stored = read_version(&engine)?;
        if stored > self.version {
            return Err(CoreError::invalid_format(format!(
                "stored version {stored} is newer than requested version {}",
                self.version
            )));
        }
        let upgrading = self.version > stored;

        if upgrading {
            let mut batch = Vec::new();
            for deletion in self.deletions.lock().iter() {
                let holds = deletion.condition.as_ref().map_or(true, |c| c(stored));
                if !holds {
                    continue;
                }
                batch.push(BatchOp::delete_prefix(
                    table_prefix(&deletion.name).into_bytes(),
                ));
                for index in &deletion.index_names {
                    batch.push(BatchOp::delete_prefix(
                        index_table_prefix(&deletion.name, index).into_bytes(),
                    ));
                }
            }
            for (name, store) in self.stores.read().iter() {
                if store.is_persistent() && store.upgrade_condition_holds(stored) {
                    batch.push(BatchOp::delete_prefix(table_prefix(name).into_bytes()));
                    for index in store.index_names() {
                        batch.push(BatchOp::delete_prefix(
                            index_table_prefix(name, &index).into_bytes(),
                        ));
                    }
                }
            }
            if !batch.is_empty() {
                engine.apply(&batch)?;
            }
        }

        for store in self.stores.read().values() {
            store.connect(&engine, self.id)?;
        }
        *self.engine.write() = Some(Arc::clone(&engine));
        *self.connected.write() = true;

        if upgrading {
            on_upgrade(stored, self.version, self)?;
            engine.apply(&[BatchOp::put(
                VERSION_KEY.to_vec(),
                self.version.to_string().into_bytes(),
            )])?;
            debug!(old = stored, new = self.version, "database upgraded");
        }
        Ok(())
    }

    /// Commits a group of sibling transactions atomically.
    ///
    /// Every transaction must be open and belong to this database. The
    /// group either all commits or all conflicts - the backends' batch
    /// entries land in one root engine write, and deferred steps run only
    /// after it succeeds.
    pub fn commit_combined(&self, txns: &[Transaction]) -> CoreResult<bool> {
        if txns.len() < 2 {
            return Err(CoreError::invalid_argument(
                "combined commit requires at least two transactions",
            ));
        }
        for tx in txns {
            if tx.database_id() != self.id {
                return Err(CoreError::invalid_argument(
                    "transaction does not belong to this database",
                ));
            }
            tx.ensure_open_for_commit()?;
        }

        // Per-store commit locks, deduplicated, in address order so
        // overlapping combined commits cannot deadlock.
        let mut mutexes: Vec<&Mutex<()>> = Vec::new();
        for tx in txns {
            let mutex = tx.commit_backend().commit_mutex().ok_or_else(|| {
                CoreError::invalid_argument(
                    "combined commit requires object-store transactions",
                )
            })?;
            if !mutexes.iter().any(|held| std::ptr::eq(*held, mutex)) {
                mutexes.push(mutex);
            }
        }
        mutexes.sort_by_key(|mutex| *mutex as *const Mutex<()> as usize);
        let _guards: Vec<_> = mutexes.iter().map(|mutex| mutex.lock()).collect();

        for tx in txns {
            tx.cancel_watchdog();
        }

        let mut fragments = Vec::new();
        for tx in txns {
            match tx.commit_backend().apply_combined(tx) {
                Ok(Some(staged)) => fragments.extend(staged),
                Ok(None) => {
                    warn!(count = txns.len(), "combined commit conflicted");
                    self.finish_combined(txns, TransactionState::Conflicted);
                    return Ok(false);
                }
                Err(error) => {
                    self.finish_combined(txns, TransactionState::Conflicted);
                    return Err(error);
                }
            }
        }

        let mut entries = Vec::new();
        let mut deferred = Vec::new();
        for fragment in fragments {
            match fragment {
                BatchFragment::Entries(ops) => entries.extend(ops),
                BatchFragment::Deferred(step) => deferred.push(step),
            }
        }

        if !entries.is_empty() {
            let engine = self
                .engine
                .read()
                .clone()
                .ok_or(CoreError::DatabaseClosed)?;
            if let Err(error) = engine.apply(&entries) {
                self.finish_combined(txns, TransactionState::Conflicted);
                return Err(error.into());
            }
        }

        for step in deferred {
            if let Err(error) = step.run() {
                warn!(%error, "deferred step failed during combined commit");
                self.finish_combined(txns, TransactionState::Conflicted);
                return Ok(false);
            }
        }

        self.finish_combined(txns, TransactionState::Committed);
        debug!(count = txns.len(), "combined commit applied");
        Ok(true)
    }

    fn finish_combined(&self, txns: &[Transaction], state: TransactionState) {
        for tx in txns {
            tx.set_terminal(state);
        }
    }

    /// Flushes the root engine and releases store backends. The directory
    /// lock is held until the handle drops.
    pub fn close(&self) -> CoreResult<()> {
        if let Some(engine) = self.engine.read().as_ref() {
            engine.sync()?;
        }
        for store in self.stores.read().values() {
            store.disconnect();
        }
        *self.engine.write() = None;
        *self.connected.write() = false;
        Ok(())
    }

    /// Closes the database and deletes its files.
    pub fn destroy(self) -> CoreResult<()> {
        self.close()?;
        if let Some(dir) = &self.dir {
            std::fs::remove_dir_all(dir.path())?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("connected", &self.is_connected())
            .field("stores", &self.object_store_names())
            .finish_non_exhaustive()
    }
}

/// Reads the stored schema version; a missing key means a fresh database
/// (version 0).
fn read_version(engine: &Arc<dyn KvEngine>) -> CoreResult<u32> {
    match engine.get(VERSION_KEY)? {
        Some(bytes) => {
            let text = std::str::from_utf8(&bytes)
                .map_err(|_| CoreError::invalid_format("stored version is not ASCII"))?;
            text.parse::<u32>()
                .map_err(|_| CoreError::invalid_format("stored version is not an integer"))
        }
        None => Ok(0),
    }
}
