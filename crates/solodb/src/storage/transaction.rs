//! Transaction manager: single-writer commits with undo-journal safety.
//!
//! State machine: Idle -> Active -> (committing | rolling back) -> Idle.
//! Write operations run under the exclusive lock, either one-per-operation
//! (auto-commit) or grouped in an explicit transaction. Commit bumps the
//! header change counter, persists the journal, flushes dirty pages and
//! deletes the journal area; rollback simply discards the cache. Readers
//! detect foreign commits by comparing the cached header's change counter
//! against disk and drop their cache when it moved.

use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;
use solodb_common::{Result, SoloError};

use super::lock::LockService;
use super::pager::PagerService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Idle,
    Active { owner: ThreadId },
}

/// Coordinates locking, journaling and commit/rollback.
pub struct TransactionService {
    pager: Arc<PagerService>,
    locks: Arc<LockService>,
    cache_limit: usize,
    state: Mutex<TxState>,
}

impl TransactionService {
    pub fn new(pager: Arc<PagerService>, locks: Arc<LockService>, cache_limit: usize) -> Self {
        Self {
            pager,
            locks,
            cache_limit,
            state: Mutex::new(TxState::Idle),
        }
    }

    /// True when an explicit transaction is open and owned by this thread.
    pub fn owns_transaction(&self) -> bool {
        matches!(
            *self.state.lock(),
            TxState::Active { owner } if owner == std::thread::current().id()
        )
    }

    /// Open an explicit transaction: take the exclusive lock and hold it
    /// until commit or rollback.
    pub fn begin(&self) -> Result<()> {
        {
            let state = self.state.lock();
            if *state != TxState::Idle {
                return Err(SoloError::Transaction("transaction already open".into()));
            }
        }

        self.locks.enter_exclusive()?;
        self.avoid_dirty_read()?;

        *self.state.lock() = TxState::Active {
            owner: std::thread::current().id(),
        };
        tracing::debug!("transaction started");
        Ok(())
    }

    /// Commit the open explicit transaction.
    pub fn commit(&self) -> Result<()> {
        if !self.owns_transaction() {
            return Err(SoloError::Transaction("no open transaction".into()));
        }

        let result = self.commit_pages();
        *self.state.lock() = TxState::Idle;
        self.locks.exit_exclusive();
        result
    }

    /// Roll back the open explicit transaction, discarding every dirty
    /// page (and restoring checkpoint-flushed pages from the journal).
    pub fn rollback(&self) -> Result<()> {
        if !self.owns_transaction() {
            return Err(SoloError::Transaction("no open transaction".into()));
        }

        let result = self.pager.rollback();
        *self.state.lock() = TxState::Idle;
        self.locks.exit_exclusive();
        tracing::debug!("transaction rolled back");
        result
    }

    /// Run a write operation. Inside an explicit transaction the work joins
    /// it; otherwise the operation auto-commits. Any error rolls the whole
    /// transaction back before propagating.
    pub fn with_write<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.owns_transaction() {
            match f() {
                Ok(value) => {
                    self.checkpoint()?;
                    Ok(value)
                }
                Err(e) => {
                    if let Err(undo) = self.pager.rollback() {
                        tracing::warn!(error = %undo, "rollback after failed write left residue");
                    }
                    *self.state.lock() = TxState::Idle;
                    self.locks.exit_exclusive();
                    Err(e)
                }
            }
        } else {
            self.locks.enter_exclusive()?;
            if let Err(e) = self.avoid_dirty_read() {
                self.locks.exit_exclusive();
                return Err(e);
            }

            let result = f().and_then(|value| {
                self.commit_pages()?;
                Ok(value)
            });
            if result.is_err() {
                if let Err(undo) = self.pager.rollback() {
                    tracing::warn!(error = %undo, "rollback after failed write left residue");
                }
            }
            self.locks.exit_exclusive();
            result
        }
    }

    /// Run a read operation under the shared lock.
    pub fn with_read<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let owns_lock = self.enter_read()?;
        let result = f();
        self.exit_read(owns_lock);
        result
    }

    /// Take the shared lock for a read, unless this thread's open
    /// transaction already holds the exclusive lock. Returns whether a
    /// shared hold was taken (pass it back to [`exit_read`](Self::exit_read)).
    pub fn enter_read(&self) -> Result<bool> {
        if self.owns_transaction() {
            return Ok(false);
        }
        self.locks.enter_shared()?;
        if let Err(e) = self.avoid_dirty_read() {
            self.locks.exit_shared();
            return Err(e);
        }
        Ok(true)
    }

    pub fn exit_read(&self, owns_lock: bool) {
        if owns_lock {
            self.locks.exit_shared();
        }
    }

    /// Flush-and-purge when the cache outgrew its ceiling. Called after
    /// every document-level mutation step; the journal is persisted first,
    /// so the partial flush stays recoverable.
    pub fn checkpoint(&self) -> Result<()> {
        if self.pager.over_limit(self.cache_limit) {
            tracing::debug!("checkpoint: flushing cache over {} pages", self.cache_limit);
            if self.pager.has_dirty() {
                self.pager.flush()?;
            }
            self.pager.clear_clean();
        }
        Ok(())
    }

    /// Drop clean pages during long read scans once the cache outgrows its
    /// ceiling. Readers have no dirty pages.
    pub fn read_checkpoint(&self) {
        if self.pager.over_limit(self.cache_limit) {
            self.pager.clear_clean();
        }
    }

    /// Outside a transaction, a cached header whose change counter differs
    /// from disk means another process committed since we cached pages: the
    /// whole cache is stale and gets dropped. Self-healing, not an error.
    pub fn avoid_dirty_read(&self) -> Result<()> {
        let Some(cached) = self.pager.cached_change_id() else {
            return Ok(());
        };

        let on_disk = self.pager.header_from_disk()?.change_id;
        if on_disk != cached {
            tracing::debug!(cached, on_disk, "change id moved, invalidating page cache");
            self.pager.clear_cache();
        }
        Ok(())
    }

    /// The commit sequence. Nothing to do only when the transaction neither
    /// holds dirty pages nor flushed any at a checkpoint.
    fn commit_pages(&self) -> Result<()> {
        if !self.pager.has_dirty() && !self.pager.flushed_in_transaction() {
            return Ok(());
        }

        let mut header = self.pager.header()?;
        header.bump_change_id();
        self.pager.save(header)?;

        // Journal first, data after, truncate last: the truncate is the
        // commit point.
        self.pager.flush()?;
        self.pager.truncate_journal()?;

        tracing::debug!("commit complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::data_page::DataPage;
    use crate::storage::disk::DiskManager;
    use crate::storage::header::HeaderPage;
    use crate::storage::lock::{LockService, DEFAULT_LOCK_TIMEOUT};
    use crate::storage::page::{serialize_page, PageId, TypedPage};
    use tempfile::TempDir;

    fn setup() -> (Arc<PagerService>, TransactionService, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let (disk, _) = DiskManager::open(&path, None).unwrap();
        disk.write_page(
            PageId::HEADER,
            &serialize_page(&HeaderPage::new(PageId::HEADER)).unwrap(),
        )
        .unwrap();

        let pager = Arc::new(PagerService::new(Arc::new(disk), true));
        let locks = Arc::new(LockService::new(DEFAULT_LOCK_TIMEOUT, None));
        let trans = TransactionService::new(pager.clone(), locks, 5_000);
        (pager, trans, dir)
    }

    #[test]
    fn test_auto_commit_bumps_change_id() {
        let (pager, trans, _dir) = setup();

        trans
            .with_write(|| {
                let _: DataPage = pager.new_page()?;
                Ok(())
            })
            .unwrap();

        assert!(!pager.has_dirty());
        assert_eq!(pager.header_from_disk().unwrap().change_id, 1);
    }

    #[test]
    fn test_read_only_commit_is_noop() {
        let (pager, trans, _dir) = setup();

        trans.with_write(|| Ok(())).unwrap();
        assert_eq!(pager.header_from_disk().unwrap().change_id, 0);
    }

    #[test]
    fn test_explicit_transaction_groups_writes() {
        let (pager, trans, _dir) = setup();

        trans.begin().unwrap();
        trans
            .with_write(|| {
                let _: DataPage = pager.new_page()?;
                Ok(())
            })
            .unwrap();
        trans
            .with_write(|| {
                let _: DataPage = pager.new_page()?;
                Ok(())
            })
            .unwrap();

        // Nothing on disk until commit
        assert_eq!(pager.header_from_disk().unwrap().change_id, 0);
        trans.commit().unwrap();
        assert_eq!(pager.header_from_disk().unwrap().change_id, 1);
        assert_eq!(pager.header_from_disk().unwrap().last_page_id, PageId(2));
    }

    #[test]
    fn test_rollback_discards_writes() {
        let (pager, trans, _dir) = setup();

        trans.begin().unwrap();
        trans
            .with_write(|| {
                let _: DataPage = pager.new_page()?;
                Ok(())
            })
            .unwrap();
        trans.rollback().unwrap();

        assert_eq!(pager.header_from_disk().unwrap().change_id, 0);
        assert_eq!(pager.header_from_disk().unwrap().last_page_id, PageId(0));
        // A new transaction can start after rollback
        trans.begin().unwrap();
        trans.commit().unwrap();
    }

    #[test]
    fn test_double_begin_rejected() {
        let (_pager, trans, _dir) = setup();

        trans.begin().unwrap();
        assert!(matches!(trans.begin(), Err(SoloError::Transaction(_))));
        trans.rollback().unwrap();
    }

    #[test]
    fn test_error_in_write_rolls_back() {
        let (pager, trans, _dir) = setup();

        trans.begin().unwrap();
        let err = trans.with_write::<()>(|| {
            let _: DataPage = pager.new_page()?;
            Err(SoloError::InvalidOperation("boom".into()))
        });
        assert!(err.is_err());

        // Transaction is gone; nothing was committed
        assert!(matches!(trans.commit(), Err(SoloError::Transaction(_))));
        assert_eq!(pager.header_from_disk().unwrap().last_page_id, PageId(0));
    }

    /// A zero cache ceiling forces a checkpoint flush after every write.
    fn setup_tiny_cache() -> (Arc<PagerService>, TransactionService, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let (disk, _) = DiskManager::open(&path, None).unwrap();
        disk.write_page(
            PageId::HEADER,
            &serialize_page(&HeaderPage::new(PageId::HEADER)).unwrap(),
        )
        .unwrap();

        let pager = Arc::new(PagerService::new(Arc::new(disk), true));
        let locks = Arc::new(LockService::new(DEFAULT_LOCK_TIMEOUT, None));
        let trans = TransactionService::new(pager.clone(), locks, 0);
        (pager, trans, dir)
    }

    #[test]
    fn test_commit_after_checkpoint_flush_truncates_journal() {
        let (pager, trans, _dir) = setup_tiny_cache();

        trans.begin().unwrap();
        trans
            .with_write(|| {
                let _: DataPage = pager.new_page()?;
                Ok(())
            })
            .unwrap();

        // The checkpoint flushed everything; commit must still bump the
        // change counter and delete the journal area
        assert!(!pager.has_dirty());
        assert!(pager.flushed_in_transaction());
        trans.commit().unwrap();

        let header = pager.header_from_disk().unwrap();
        assert_eq!(header.change_id, 1);
        assert_eq!(
            pager.disk().len_pages().unwrap(),
            header.last_page_id.0 as u64 + 1
        );
    }

    #[test]
    fn test_rollback_after_checkpoint_flush_restores_disk() {
        let (pager, trans, _dir) = setup_tiny_cache();

        trans.begin().unwrap();
        trans
            .with_write(|| {
                let _: DataPage = pager.new_page()?;
                Ok(())
            })
            .unwrap();

        // Mid-transaction state reached disk
        assert_eq!(pager.header_from_disk().unwrap().last_page_id, PageId(1));

        trans.rollback().unwrap();

        // Pre-images restored, file trimmed back to one page
        let header = pager.header_from_disk().unwrap();
        assert_eq!(header.change_id, 0);
        assert_eq!(header.last_page_id, PageId(0));
        assert_eq!(pager.disk().len_pages().unwrap(), 1);
    }

    #[test]
    fn test_change_id_invalidates_foreign_cache() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let (disk, _) = DiskManager::open(&path, None).unwrap();
        disk.write_page(
            PageId::HEADER,
            &serialize_page(&HeaderPage::new(PageId::HEADER)).unwrap(),
        )
        .unwrap();
        drop(disk);

        let open = |p: &std::path::Path| {
            let (disk, _) = DiskManager::open(p, None).unwrap();
            let pager = Arc::new(PagerService::new(Arc::new(disk), true));
            let locks = Arc::new(LockService::new(DEFAULT_LOCK_TIMEOUT, None));
            let trans = TransactionService::new(pager.clone(), locks, 5_000);
            (pager, trans)
        };

        // Reader caches the header, writer (a second engine on the same
        // file) commits, reader must invalidate on its next lock entry.
        let (pager_a, trans_a) = open(&path);
        trans_a.with_read(|| pager_a.header().map(|_| ())).unwrap();
        assert_eq!(pager_a.cached_change_id(), Some(0));

        let (pager_b, trans_b) = open(&path);
        trans_b
            .with_write(|| {
                let _: DataPage = pager_b.new_page()?;
                Ok(())
            })
            .unwrap();

        trans_a.with_read(|| Ok(())).unwrap();
        // Cache was cleared; no header cached anymore
        assert_eq!(pager_a.cached_change_id(), None);
    }
}
