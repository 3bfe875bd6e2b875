//! The database engine and its public surface.
//!
//! [`SoloDb`] is a cheap clonable handle over one engine. Opening the same
//! file twice within a process yields handles to a single shared engine
//! (one cache, one transaction manager); the engine is created on the
//! first open and torn down when the last handle drops.
//!
//! Every write operation either auto-commits or joins the open explicit
//! transaction; any error rolls the transaction back before it propagates,
//! so no partially committed state is ever visible.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use solodb_common::{Document, ObjectId, Result, SoloError, Value};

use crate::collection::CollectionService;
use crate::data::DataService;
use crate::index::{IndexService, Order};
use crate::query::cursor::PlanExecutor;
use crate::query::{optimize, FindCursor, FindOptions, Query};
use crate::storage::{
    journal, page::deserialize_page, page::peek_page_type, page::serialize_page, Cipher,
    CollectionIndex, CrossProcessLock, DiskManager, HeaderPage, LockService, PageId, PageType,
    PagerService, TransactionService, TypedPage, CACHE_CHECKPOINT_SIZE, DEFAULT_LOCK_TIMEOUT,
    PAGE_SIZE, PK_SLOT,
};

/// Engine configuration.
#[derive(Clone)]
pub struct EngineOptions {
    /// Page cache ceiling before a checkpoint purge (in pages).
    pub page_cache_size: usize,
    /// Wall-clock limit for lock acquisition.
    pub timeout: Duration,
    /// Keep an undo journal for crash-safe commits. Disabling trades
    /// durability for speed.
    pub journal: bool,
    /// Reject every write operation.
    pub read_only: bool,
    /// Password for new files; required to open protected files.
    pub password: Option<String>,
    /// Optional page cipher (derive its key from the password outside the
    /// engine).
    pub cipher: Option<Arc<dyn Cipher>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            page_cache_size: CACHE_CHECKPOINT_SIZE,
            timeout: DEFAULT_LOCK_TIMEOUT,
            journal: true,
            read_only: false,
            password: None,
            cipher: None,
        }
    }
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("page_cache_size", &self.page_cache_size)
            .field("timeout", &self.timeout)
            .field("journal", &self.journal)
            .field("read_only", &self.read_only)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("cipher", &self.cipher.is_some())
            .finish()
    }
}

/// Metadata about one index, for [`Engine::index_list`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub name: String,
    pub field: String,
    pub unique: bool,
}

/// Page and document statistics for one database.
#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
    pub file_size: u64,
    pub page_count: u64,
    pub pages_by_type: BTreeMap<&'static str, u64>,
    /// Collection name -> document count.
    pub collections: BTreeMap<String, u64>,
}

// Shared-open registry

static OPEN_ENGINES: OnceLock<DashMap<PathBuf, Weak<Engine>>> = OnceLock::new();

fn registry() -> &'static DashMap<PathBuf, Weak<Engine>> {
    OPEN_ENGINES.get_or_init(DashMap::new)
}

/// Handle to an open database. Clones share the same engine.
#[derive(Clone)]
pub struct SoloDb {
    inner: Arc<Engine>,
}

impl SoloDb {
    /// Open (or create) a database file with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SoloDb> {
        Self::open_with(path, EngineOptions::default())
    }

    /// Open (or create) a database file.
    ///
    /// Opens of the same path in one process share a single engine; the
    /// options of the first open win.
    pub fn open_with<P: AsRef<Path>>(path: P, options: EngineOptions) -> Result<SoloDb> {
        let key = std::path::absolute(path.as_ref())?;

        // Entry locking makes first-open-wins race free within the process
        let entry = registry().entry(key.clone());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if let Some(engine) = occupied.get().upgrade() {
                    return Ok(SoloDb { inner: engine });
                }
                let engine = Arc::new(Engine::open_engine(key, options)?);
                occupied.insert(Arc::downgrade(&engine));
                Ok(SoloDb { inner: engine })
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let engine = Arc::new(Engine::open_engine(key, options)?);
                vacant.insert(Arc::downgrade(&engine));
                Ok(SoloDb { inner: engine })
            }
        }
    }
}

impl Deref for SoloDb {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        &self.inner
    }
}

/// The storage engine behind a [`SoloDb`] handle.
pub struct Engine {
    path: PathBuf,
    options: EngineOptions,
    pager: Arc<PagerService>,
    locks: Arc<LockService>,
    trans: TransactionService,
    rng: Mutex<StdRng>,
}

impl Drop for Engine {
    fn drop(&mut self) {
        registry().remove_if(&self.path, |_, weak| weak.upgrade().is_none());
    }
}

impl Engine {
    fn open_engine(path: PathBuf, options: EngineOptions) -> Result<Engine> {
        let (disk, created) = DiskManager::open(&path, options.cipher.clone())?;
        let disk = Arc::new(disk);

        if created {
            let mut header = HeaderPage::new(PageId::HEADER);
            if let Some(password) = &options.password {
                header.set_password(password)?;
            }
            disk.write_page(PageId::HEADER, &serialize_page(&header)?)?;
            disk.sync()?;
            tracing::info!(path = %path.display(), "created new data file");
        } else {
            if options.journal {
                journal::recover(&disk)?;
            }
            let header: HeaderPage = deserialize_page(&disk.read_page(PageId::HEADER)?)?;
            header.verify_password(options.password.as_deref())?;
        }

        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        let cross = CrossProcessLock::open(PathBuf::from(lock_path))?;

        let locks = Arc::new(LockService::new(options.timeout, Some(cross)));
        let pager = Arc::new(PagerService::new(disk, options.journal));
        let trans = TransactionService::new(pager.clone(), locks.clone(), options.page_cache_size);

        Ok(Engine {
            path,
            options,
            pager,
            locks,
            trans,
            rng: Mutex::new(StdRng::from_os_rng()),
        })
    }

    /// Path of the underlying data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.options.read_only {
            Err(SoloError::ReadOnly)
        } else {
            Ok(())
        }
    }

    // Transactions

    /// Open an explicit transaction. Holds the writer lock until commit or
    /// rollback; every write operation on this thread joins it.
    pub fn begin_trans(&self) -> Result<()> {
        self.ensure_writable()?;
        self.trans.begin()
    }

    pub fn commit(&self) -> Result<()> {
        self.trans.commit()
    }

    pub fn rollback(&self) -> Result<()> {
        self.trans.rollback()
    }

    /// Flush dirty pages (under journal protection) and drop the clean
    /// cache. Useful inside long transactions; a no-op ceiling check runs
    /// after every operation anyway.
    pub fn checkpoint(&self) -> Result<()> {
        if self.trans.owns_transaction() {
            if self.pager.has_dirty() {
                self.pager.flush()?;
            }
            self.pager.clear_clean();
            Ok(())
        } else {
            self.trans.with_read(|| {
                self.pager.clear_clean();
                Ok(())
            })
        }
    }

    // Document writes

    /// Insert one document; a missing `_id` gets a generated ObjectId.
    /// Returns the document's id.
    pub fn insert(&self, collection: &str, doc: Document) -> Result<Value> {
        self.ensure_writable()?;
        self.trans.with_write(|| self.insert_inner(collection, doc))
    }

    /// Insert many documents in one transaction.
    pub fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<Value>> {
        self.ensure_writable()?;
        self.trans.with_write(|| {
            docs.into_iter()
                .map(|doc| self.insert_inner(collection, doc))
                .collect()
        })
    }

    /// Replace the document whose `_id` matches. Returns false when absent.
    pub fn update(&self, collection: &str, doc: &Document) -> Result<bool> {
        self.ensure_writable()?;
        self.trans.with_write(|| self.update_inner(collection, doc))
    }

    /// Update the document by `_id`, inserting it when absent. Returns
    /// true when an insert happened.
    pub fn upsert(&self, collection: &str, doc: Document) -> Result<bool> {
        self.ensure_writable()?;
        self.trans.with_write(|| {
            if doc.id().is_some() && self.update_inner(collection, &doc)? {
                return Ok(false);
            }
            self.insert_inner(collection, doc)?;
            Ok(true)
        })
    }

    /// Delete one document by `_id`. Returns false when absent.
    pub fn delete(&self, collection: &str, id: &Value) -> Result<bool> {
        self.ensure_writable()?;
        self.trans.with_write(|| self.delete_inner(collection, id))
    }

    /// Delete every document matching the query, returning how many went.
    pub fn delete_many(&self, collection: &str, query: &Query) -> Result<usize> {
        self.ensure_writable()?;
        self.trans.with_write(|| {
            let ids = self.query_ids_inner(collection, query)?;
            let mut deleted = 0;
            for id in ids {
                if self.delete_inner(collection, &id)? {
                    deleted += 1;
                }
            }
            Ok(deleted)
        })
    }

    // Indexes

    /// Create an index over a (dotted) field path, backfilling existing
    /// documents. Returns false when the index already exists.
    pub fn ensure_index(&self, collection: &str, field: &str, unique: bool) -> Result<bool> {
        self.ensure_writable()?;
        if field.is_empty() || field.len() > 100 || field == "_id" {
            return Err(SoloError::InvalidName(field.to_string()));
        }

        self.trans.with_write(|| {
            let cols = CollectionService::new(&self.pager, &self.rng);
            let mut col = cols.get_or_create(collection)?;
            if col.index_by_field(field).is_some() {
                return Ok(false);
            }

            let index_service = IndexService::new(&self.pager, &self.rng);
            let data_service = DataService::new(&self.pager);
            let name = format!("{}_1", field.replace('.', "_"));
            let index = index_service.create_index(&mut col, &name, field, unique)?;

            // Backfill every existing document
            let pk = col.pk_index()?.clone();
            let mut cur = index_service.first(&pk, Order::Ascending)?;
            while let Some(pk_node) = cur {
                let doc = Document::from_bytes(&data_service.read(pk_node.data_block)?)?;
                let key = doc.get_path(field).clone();
                let node =
                    index_service.add_node(&mut col, &index, key, pk_node.data_block)?;
                index_service.chain_insert(pk_node.position, &node)?;
                cur = index_service.sibling(&pk_node, Order::Ascending)?;
            }

            cols.save(&col)?;
            Ok(true)
        })
    }

    /// Drop an index by field path or index name. The primary key cannot
    /// be dropped. Returns false when no such index exists.
    pub fn drop_index(&self, collection: &str, index: &str) -> Result<bool> {
        self.ensure_writable()?;
        self.trans.with_write(|| {
            let cols = CollectionService::new(&self.pager, &self.rng);
            let Some(mut col) = cols.get(collection)? else {
                return Ok(false);
            };
            let found = col
                .index_by_field(index)
                .or_else(|| col.index_by_name(index))
                .cloned();
            let Some(found) = found else {
                return Ok(false);
            };
            if found.slot == PK_SLOT {
                return Err(SoloError::InvalidOperation(
                    "the primary-key index cannot be dropped".into(),
                ));
            }

            let index_service = IndexService::new(&self.pager, &self.rng);
            index_service.drop_index(&mut col, found.slot)?;
            cols.save(&col)?;
            Ok(true)
        })
    }

    /// List a collection's indexes.
    pub fn index_list(&self, collection: &str) -> Result<Vec<IndexInfo>> {
        self.trans.with_read(|| {
            let cols = CollectionService::new(&self.pager, &self.rng);
            Ok(match cols.get(collection)? {
                None => Vec::new(),
                Some(col) => col
                    .indexes
                    .values()
                    .map(|i| IndexInfo {
                        name: i.name.clone(),
                        field: i.field.clone(),
                        unique: i.unique,
                    })
                    .collect(),
            })
        })
    }

    // Queries

    /// Find documents matching a query. The returned cursor is lazy and
    /// holds the shared lock until dropped, so finish (or drop) it before
    /// writing from the same thread.
    pub fn find(&self, collection: &str, query: Query) -> Result<FindCursor<'_>> {
        self.find_with(collection, query, FindOptions::default())
    }

    /// [`find`](Self::find) with ordering, paging and projection options.
    pub fn find_with(
        &self,
        collection: &str,
        query: Query,
        options: FindOptions,
    ) -> Result<FindCursor<'_>> {
        let owns_lock = self.trans.enter_read()?;
        let result = (|| {
            let cols = CollectionService::new(&self.pager, &self.rng);
            let plan = match cols.get(collection)? {
                None => None,
                Some(col) => {
                    let order_by = options
                        .order_by
                        .as_ref()
                        .map(|(field, order)| (field.as_str(), *order));
                    Some(optimize(&col, &query, order_by)?)
                }
            };
            FindCursor::new(
                &self.trans,
                owns_lock,
                &self.pager,
                &self.rng,
                plan,
                options.skip,
                options.limit,
                options.projection.clone(),
            )
        })();

        if result.is_err() {
            self.trans.exit_read(owns_lock);
        }
        result
    }

    /// Every document of a collection in primary-key order.
    pub fn find_all(&self, collection: &str) -> Result<FindCursor<'_>> {
        self.find(collection, Query::all())
    }

    /// Look one document up by `_id`.
    pub fn find_by_id(&self, collection: &str, id: &Value) -> Result<Option<Document>> {
        self.trans.with_read(|| {
            let cols = CollectionService::new(&self.pager, &self.rng);
            let Some(col) = cols.get(collection)? else {
                return Ok(None);
            };
            let index_service = IndexService::new(&self.pager, &self.rng);
            let pk = col.pk_index()?.clone();
            match index_service.find(&pk, id, false, Order::Ascending)? {
                None => Ok(None),
                Some(node) => {
                    let data_service = DataService::new(&self.pager);
                    let doc = Document::from_bytes(&data_service.read(node.data_block)?)?;
                    Ok(Some(doc))
                }
            }
        })
    }

    /// First document matching the query, if any.
    pub fn first(&self, collection: &str, query: Query) -> Result<Option<Document>> {
        self.find(collection, query)?.next().transpose()
    }

    /// Count documents matching the query. Skips document loads entirely
    /// when every term is answered by the index.
    pub fn count(&self, collection: &str, query: &Query) -> Result<u64> {
        self.trans.with_read(|| {
            let cols = CollectionService::new(&self.pager, &self.rng);
            let Some(col) = cols.get(collection)? else {
                return Ok(0);
            };
            if matches!(query, Query::All) {
                return Ok(col.document_count);
            }

            let plan = optimize(&col, query, None)?;
            let mut exec = PlanExecutor::new(plan);
            let index_service = IndexService::new(&self.pager, &self.rng);
            let mut count = 0u64;

            if exec.key_only() {
                while exec.next_node(&index_service)?.is_some() {
                    count += 1;
                    if count % 128 == 0 {
                        self.trans.read_checkpoint();
                    }
                }
            } else {
                let data_service = DataService::new(&self.pager);
                while exec.next_doc(&index_service, &data_service)?.is_some() {
                    count += 1;
                    if count % 128 == 0 {
                        self.trans.read_checkpoint();
                    }
                }
            }
            Ok(count)
        })
    }

    /// Does any document match the query?
    pub fn exists(&self, collection: &str, query: &Query) -> Result<bool> {
        self.trans.with_read(|| {
            let cols = CollectionService::new(&self.pager, &self.rng);
            let Some(col) = cols.get(collection)? else {
                return Ok(false);
            };
            let plan = optimize(&col, query, None)?;
            let mut exec = PlanExecutor::new(plan);
            let index_service = IndexService::new(&self.pager, &self.rng);

            if exec.key_only() {
                Ok(exec.next_node(&index_service)?.is_some())
            } else {
                let data_service = DataService::new(&self.pager);
                Ok(exec.next_doc(&index_service, &data_service)?.is_some())
            }
        })
    }

    /// Smallest key of an indexed field.
    pub fn min(&self, collection: &str, field: &str) -> Result<Option<Value>> {
        self.index_edge(collection, field, Order::Ascending)
    }

    /// Largest key of an indexed field.
    pub fn max(&self, collection: &str, field: &str) -> Result<Option<Value>> {
        self.index_edge(collection, field, Order::Descending)
    }

    fn index_edge(&self, collection: &str, field: &str, order: Order) -> Result<Option<Value>> {
        self.trans.with_read(|| {
            let cols = CollectionService::new(&self.pager, &self.rng);
            let Some(col) = cols.get(collection)? else {
                return Ok(None);
            };
            let index = col
                .index_by_field(field)
                .cloned()
                .ok_or_else(|| SoloError::IndexNotFound(field.to_string()))?;
            let index_service = IndexService::new(&self.pager, &self.rng);
            Ok(index_service.first(&index, order)?.map(|n| n.key))
        })
    }

    /// Describe the execution plan for a query (diagnostic text).
    pub fn explain(&self, collection: &str, query: &Query) -> Result<String> {
        self.explain_with(collection, query, None)
    }

    pub fn explain_with(
        &self,
        collection: &str,
        query: &Query,
        order_by: Option<(&str, Order)>,
    ) -> Result<String> {
        self.trans.with_read(|| {
            let cols = CollectionService::new(&self.pager, &self.rng);
            match cols.get(collection)? {
                None => Ok("NO COLLECTION".to_string()),
                Some(col) => Ok(optimize(&col, query, order_by)?.explain()),
            }
        })
    }

    // Collections

    pub fn collection_names(&self) -> Result<Vec<String>> {
        self.trans
            .with_read(|| CollectionService::new(&self.pager, &self.rng).list())
    }

    /// Drop a collection with all its documents and indexes.
    pub fn drop_collection(&self, collection: &str) -> Result<bool> {
        self.ensure_writable()?;
        self.trans
            .with_write(|| CollectionService::new(&self.pager, &self.rng).drop(collection))
    }

    pub fn rename_collection(&self, collection: &str, new_name: &str) -> Result<bool> {
        self.ensure_writable()?;
        self.trans
            .with_write(|| CollectionService::new(&self.pager, &self.rng).rename(collection, new_name))
    }

    // Maintenance

    /// Rebuild the database into a fresh file and swap it in, reclaiming
    /// every empty page. Returns the number of bytes recovered.
    pub fn shrink(&self) -> Result<u64> {
        self.ensure_writable()?;
        if self.trans.owns_transaction() {
            return Err(SoloError::InvalidOperation(
                "shrink cannot run inside a transaction".into(),
            ));
        }

        self.locks.enter_exclusive()?;
        let result = self.shrink_inner();
        self.locks.exit_exclusive();
        result
    }

    fn shrink_inner(&self) -> Result<u64> {
        let old_size = self.pager.disk().len_pages()? * PAGE_SIZE as u64;

        let mut tmp_os = self.path.clone().into_os_string();
        tmp_os.push(".shrink");
        let tmp_path = PathBuf::from(tmp_os);
        let _ = std::fs::remove_file(&tmp_path);

        {
            // Rebuild into a private engine (never registered, journal off)
            let tmp = Engine::open_engine(
                tmp_path.clone(),
                EngineOptions {
                    journal: false,
                    password: self.options.password.clone(),
                    cipher: self.options.cipher.clone(),
                    ..EngineOptions::default()
                },
            )?;

            let cols = CollectionService::new(&self.pager, &self.rng);
            let index_service = IndexService::new(&self.pager, &self.rng);
            let data_service = DataService::new(&self.pager);

            for name in cols.list()? {
                let col = cols
                    .get(&name)?
                    .ok_or_else(|| SoloError::CollectionNotFound(name.clone()))?;

                for index in col.indexes.values().filter(|i| i.slot != PK_SLOT) {
                    tmp.ensure_index(&name, &index.field, index.unique)?;
                }

                let pk = col.pk_index()?.clone();
                let mut cur = index_service.first(&pk, Order::Ascending)?;
                let mut batch = Vec::new();
                while let Some(node) = cur {
                    batch.push(Document::from_bytes(&data_service.read(node.data_block)?)?);
                    if batch.len() == 256 {
                        tmp.insert_many(&name, std::mem::take(&mut batch))?;
                    }
                    cur = index_service.sibling(&node, Order::Ascending)?;
                }
                if !batch.is_empty() {
                    tmp.insert_many(&name, batch)?;
                }
            }
        }

        // Swap the rebuilt file in and start from a cold cache
        self.pager.clear_cache();
        self.pager.disk().replace_with(&tmp_path)?;

        let mut tmp_lock = tmp_path.into_os_string();
        tmp_lock.push(".lock");
        let _ = std::fs::remove_file(PathBuf::from(tmp_lock));

        let new_size = self.pager.disk().len_pages()? * PAGE_SIZE as u64;
        tracing::info!(old_size, new_size, "database shrunk");
        Ok(old_size.saturating_sub(new_size))
    }

    /// Page- and collection-level statistics.
    pub fn stats(&self) -> Result<DatabaseStats> {
        self.trans.with_read(|| {
            let disk = self.pager.disk();
            let header = self.pager.header()?;

            let mut stats = DatabaseStats {
                file_size: disk.len_pages()? * PAGE_SIZE as u64,
                page_count: header.last_page_id.0 as u64 + 1,
                ..DatabaseStats::default()
            };

            for id in 0..=header.last_page_id.0 {
                let raw = disk.read_page(PageId(id))?;
                let name = match peek_page_type(&raw)? {
                    PageType::Header => "header",
                    PageType::Collection => "collection",
                    PageType::Index => "index",
                    PageType::Data => "data",
                    PageType::Extend => "extend",
                    PageType::Empty => "empty",
                };
                *stats.pages_by_type.entry(name).or_insert(0) += 1;
            }

            let cols = CollectionService::new(&self.pager, &self.rng);
            for name in cols.list()? {
                if let Some(col) = cols.get(&name)? {
                    stats.collections.insert(name, col.document_count);
                }
            }
            Ok(stats)
        })
    }

    // Internal write paths (callers hold the writer lock)

    fn insert_inner(&self, collection: &str, mut doc: Document) -> Result<Value> {
        let cols = CollectionService::new(&self.pager, &self.rng);
        let mut col = cols.get_or_create(collection)?;

        let id = match doc.id() {
            Some(id) if id.is_null() || id.is_sentinel() => {
                return Err(SoloError::InvalidId(id.to_string()));
            }
            Some(id) => id.clone(),
            None => {
                let id = Value::ObjectId(ObjectId::new()?);
                doc.set_id(id.clone())?;
                id
            }
        };

        let index_service = IndexService::new(&self.pager, &self.rng);
        let data_service = DataService::new(&self.pager);

        let bytes = doc.to_bytes();
        let block = data_service.insert(&mut col, &bytes)?;

        // Primary key first, then every secondary index in slot order,
        // chaining the nodes per document
        let pk = col.pk_index()?.clone();
        let pk_node = index_service.add_node(&mut col, &pk, id.clone(), block)?;
        let mut last = pk_node.position;

        let secondary: Vec<CollectionIndex> = col
            .indexes
            .values()
            .filter(|i| i.slot != PK_SLOT)
            .cloned()
            .collect();
        for index in secondary {
            let key = doc.get_path(&index.field).clone();
            let node = index_service.add_node(&mut col, &index, key, block)?;
            index_service.set_next_node(last, node.position)?;
            last = node.position;
        }

        col.document_count += 1;
        cols.save(&col)?;
        Ok(id)
    }

    fn update_inner(&self, collection: &str, doc: &Document) -> Result<bool> {
        let cols = CollectionService::new(&self.pager, &self.rng);
        let Some(mut col) = cols.get(collection)? else {
            return Ok(false);
        };

        let id = match doc.id() {
            Some(id) if !id.is_null() && !id.is_sentinel() => id.clone(),
            Some(id) => return Err(SoloError::InvalidId(id.to_string())),
            None => {
                return Err(SoloError::InvalidId(
                    "update requires an _id field".into(),
                ))
            }
        };

        let index_service = IndexService::new(&self.pager, &self.rng);
        let data_service = DataService::new(&self.pager);

        let pk = col.pk_index()?.clone();
        let Some(pk_node) = index_service.find(&pk, &id, false, Order::Ascending)? else {
            return Ok(false);
        };

        data_service.update(&mut col, pk_node.data_block, &doc.to_bytes())?;

        // Re-key every secondary index whose value changed
        let secondary: Vec<CollectionIndex> = col
            .indexes
            .values()
            .filter(|i| i.slot != PK_SLOT)
            .cloned()
            .collect();
        for index in secondary {
            // Fresh chain walk: earlier replacements may have moved links
            let mut prev_addr = pk_node.position;
            let mut cur = index_service.get_node(pk_node.position)?.next_node;
            let mut found = None;
            while !cur.is_empty() {
                let node = index_service.get_node(cur)?;
                if node.index_slot == index.slot {
                    found = Some(node);
                    break;
                }
                prev_addr = node.position;
                cur = node.next_node;
            }
            let old_node = found.ok_or_else(|| {
                SoloError::Corrupted(format!(
                    "document chain is missing a node for index \"{}\"",
                    index.name
                ))
            })?;

            let new_key = doc.get_path(&index.field).clone();
            if new_key.compare(&old_node.key) == std::cmp::Ordering::Equal {
                continue;
            }

            let new_node =
                index_service.add_node(&mut col, &index, new_key, pk_node.data_block)?;
            index_service.set_next_node(new_node.position, old_node.next_node)?;
            index_service.set_next_node(prev_addr, new_node.position)?;
            index_service.delete_node(&mut col, old_node.position)?;
        }

        cols.save(&col)?;
        Ok(true)
    }

    fn delete_inner(&self, collection: &str, id: &Value) -> Result<bool> {
        let cols = CollectionService::new(&self.pager, &self.rng);
        let Some(mut col) = cols.get(collection)? else {
            return Ok(false);
        };

        let index_service = IndexService::new(&self.pager, &self.rng);
        let data_service = DataService::new(&self.pager);

        let pk = col.pk_index()?.clone();
        let Some(pk_node) = index_service.find(&pk, id, false, Order::Ascending)? else {
            return Ok(false);
        };

        index_service.delete_all(&mut col, pk_node.position)?;
        data_service.delete(&mut col, pk_node.data_block)?;

        col.document_count = col.document_count.saturating_sub(1);
        cols.save(&col)?;
        Ok(true)
    }

    /// Materialize the ids matching a query (used by delete_many, which
    /// must not mutate while scanning).
    fn query_ids_inner(&self, collection: &str, query: &Query) -> Result<Vec<Value>> {
        let cols = CollectionService::new(&self.pager, &self.rng);
        let Some(col) = cols.get(collection)? else {
            return Ok(Vec::new());
        };

        let plan = optimize(&col, query, None)?;
        let mut exec = PlanExecutor::new(plan);
        let index_service = IndexService::new(&self.pager, &self.rng);
        let data_service = DataService::new(&self.pager);

        let mut ids = Vec::new();
        while let Some(doc) = exec.next_doc(&index_service, &data_service)? {
            if let Some(id) = doc.id() {
                ids.push(id.clone());
            }
        }
        Ok(ids)
    }
}
