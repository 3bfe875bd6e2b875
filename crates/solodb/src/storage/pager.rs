//! Page manager: typed page access over the cache and disk.
//!
//! All page traffic funnels through here. Callers load a clone of a typed
//! page, mutate it locally, and save it back; saving moves the page into
//! the dirty set and captures its pre-image for the journal on the first
//! transition. Allocation pops the header's empty-page free list before
//! extending the file, and per-collection free lists are kept sorted by
//! descending free space so the head is always the best candidate.

use std::sync::Arc;

use parking_lot::Mutex;
use solodb_common::{Result, SoloError};

use super::cache::CacheService;
use super::disk::DiskManager;
use super::header::HeaderPage;
use super::journal::JournalShadow;
use super::page::{CachedPage, EmptyPage, PageId, TypedPage};

struct PagerState {
    cache: CacheService,
    journal: JournalShadow,
    /// A mid-transaction checkpoint flushed dirty pages to disk; commit
    /// must still truncate the journal and rollback must restore from it.
    flushed: bool,
}

/// Typed page access, allocation and free-list maintenance.
pub struct PagerService {
    disk: Arc<DiskManager>,
    state: Mutex<PagerState>,
    journal_enabled: bool,
}

impl PagerService {
    pub fn new(disk: Arc<DiskManager>, journal_enabled: bool) -> Self {
        Self {
            disk,
            state: Mutex::new(PagerState {
                cache: CacheService::new(),
                journal: JournalShadow::new(),
                flushed: false,
            }),
            journal_enabled,
        }
    }

    pub fn disk(&self) -> &DiskManager {
        &self.disk
    }

    // Typed access

    /// Get a clone of a typed page, loading and parsing it if not cached.
    /// The on-disk type tag must match `T`.
    pub fn get_page<T: TypedPage>(&self, page_id: PageId) -> Result<T> {
        let mut state = self.state.lock();
        let cached = Self::load(&self.disk, &mut state, page_id)?;
        T::from_cached(cached).ok_or_else(|| {
            SoloError::Corrupted(format!(
                "page {} does not hold a {:?} page",
                page_id,
                T::PAGE_TYPE
            ))
        })
    }

    /// Save a mutated page into the dirty set.
    pub fn save<T: Into<CachedPage>>(&self, page: T) -> Result<()> {
        let mut state = self.state.lock();
        Self::store(&mut state, page.into(), self.journal_enabled)
    }

    /// The header page (page 0).
    pub fn header(&self) -> Result<HeaderPage> {
        self.get_page(PageId::HEADER)
    }

    // Allocation

    /// Allocate a page of type `T`: reuse the head of the header's
    /// empty-page list when possible, otherwise extend the file. The new
    /// page is saved dirty immediately.
    pub fn new_page<T: TypedPage>(&self) -> Result<T> {
        let mut state = self.state.lock();
        let mut header: HeaderPage = Self::load_typed(&self.disk, &mut state, PageId::HEADER)?;

        let page_id = if header.free_empty_page_id.is_valid() {
            let reused = header.free_empty_page_id;
            // Loading the empty page caches its pre-image for the journal
            let empty: EmptyPage = Self::load_typed(&self.disk, &mut state, reused)?;
            header.free_empty_page_id = empty.base.next_page_id;
            reused
        } else {
            header.last_page_id = PageId(header.last_page_id.0 + 1);
            header.last_page_id
        };

        Self::store(&mut state, header.into(), self.journal_enabled)?;

        let page = T::new(page_id);
        Self::store(&mut state, page.clone().into(), self.journal_enabled)?;
        Ok(page)
    }

    /// Convert a page (or, with `cascade`, the chain reachable through its
    /// `next_page_id` links) into Empty pages on the header free list.
    ///
    /// The page must already have been removed from any collection free
    /// list.
    pub fn delete_page(&self, page_id: PageId, cascade: bool) -> Result<()> {
        let mut state = self.state.lock();

        let mut ids = vec![page_id];
        if cascade {
            let mut next = Self::load(&self.disk, &mut state, page_id)?
                .base()
                .next_page_id;
            while next.is_valid() {
                ids.push(next);
                next = Self::load(&self.disk, &mut state, next)?.base().next_page_id;
            }
        }

        let mut header: HeaderPage = Self::load_typed(&self.disk, &mut state, PageId::HEADER)?;
        for id in ids {
            // Load first so the committed content reaches the journal
            let _ = Self::load(&self.disk, &mut state, id)?;
            let mut empty = EmptyPage::new(id);
            empty.base.next_page_id = header.free_empty_page_id;
            header.free_empty_page_id = id;
            Self::store(&mut state, empty.into(), self.journal_enabled)?;
        }
        Self::store(&mut state, header.into(), self.journal_enabled)
    }

    // Free lists

    /// Get a page from a free list with at least `needed` free bytes.
    ///
    /// The list is sorted by descending free space, so only the head is
    /// checked: a miss there means no listed page qualifies and a fresh
    /// page is allocated instead. The caller re-links the list after
    /// mutating the returned page.
    pub fn get_free_page<T: TypedPage>(&self, head: PageId, needed: usize) -> Result<T> {
        if head.is_valid() {
            let page: T = self.get_page(head)?;
            if page.free_bytes() as usize >= needed {
                return Ok(page);
            }
        }
        self.new_page()
    }

    /// Keep a page correctly positioned in (or out of) a free list after
    /// its free space changed. Pages below `keep_min` free bytes leave the
    /// list; listed pages are re-inserted to preserve the descending-free
    /// order. Returns the new list head.
    pub fn free_list_ensure(
        &self,
        head: PageId,
        page_id: PageId,
        keep_min: usize,
    ) -> Result<PageId> {
        let mut state = self.state.lock();

        let page = Self::load(&self.disk, &mut state, page_id)?;
        let in_list = head == page_id
            || page.base().prev_page_id.is_valid()
            || page.base().next_page_id.is_valid();
        let should_list = (page.free_bytes() as usize) >= keep_min;

        let mut new_head = head;
        if in_list {
            new_head = self.unlink_locked(&mut state, new_head, page_id)?;
        }
        if should_list {
            new_head = self.insert_sorted_locked(&mut state, new_head, page_id)?;
        }
        Ok(new_head)
    }

    /// Walk a free list from its head, returning the page ids in order.
    /// Used by integrity checks and tests.
    pub fn free_list_pages(&self, head: PageId) -> Result<Vec<PageId>> {
        let mut state = self.state.lock();
        let mut ids = Vec::new();
        let mut cur = head;
        while cur.is_valid() {
            ids.push(cur);
            cur = Self::load(&self.disk, &mut state, cur)?.base().next_page_id;
        }
        Ok(ids)
    }

    /// Force a page out of a free list (before deleting it).
    pub fn free_list_remove(&self, head: PageId, page_id: PageId) -> Result<PageId> {
        self.free_list_ensure(head, page_id, usize::MAX)
    }

    fn unlink_locked(
        &self,
        state: &mut PagerState,
        head: PageId,
        page_id: PageId,
    ) -> Result<PageId> {
        let mut page = Self::load(&self.disk, state, page_id)?;
        let prev = page.base().prev_page_id;
        let next = page.base().next_page_id;

        if prev.is_valid() {
            let mut p = Self::load(&self.disk, state, prev)?;
            p.base_mut().next_page_id = next;
            Self::store(state, p, self.journal_enabled)?;
        }
        if next.is_valid() {
            let mut n = Self::load(&self.disk, state, next)?;
            n.base_mut().prev_page_id = prev;
            Self::store(state, n, self.journal_enabled)?;
        }

        page.base_mut().prev_page_id = PageId::INVALID;
        page.base_mut().next_page_id = PageId::INVALID;
        Self::store(state, page, self.journal_enabled)?;

        Ok(if head == page_id { next } else { head })
    }

    fn insert_sorted_locked(
        &self,
        state: &mut PagerState,
        head: PageId,
        page_id: PageId,
    ) -> Result<PageId> {
        let mut page = Self::load(&self.disk, state, page_id)?;
        let free = page.free_bytes();

        // Find the first listed page with less free space
        let mut prev = PageId::INVALID;
        let mut cur = head;
        while cur.is_valid() {
            let c = Self::load(&self.disk, state, cur)?;
            if c.free_bytes() <= free {
                break;
            }
            prev = cur;
            cur = c.base().next_page_id;
        }

        page.base_mut().prev_page_id = prev;
        page.base_mut().next_page_id = cur;
        Self::store(state, page, self.journal_enabled)?;

        if prev.is_valid() {
            let mut p = Self::load(&self.disk, state, prev)?;
            p.base_mut().next_page_id = page_id;
            Self::store(state, p, self.journal_enabled)?;
        }
        if cur.is_valid() {
            let mut c = Self::load(&self.disk, state, cur)?;
            c.base_mut().prev_page_id = page_id;
            Self::store(state, c, self.journal_enabled)?;
        }

        Ok(if prev.is_valid() { head } else { page_id })
    }

    // Flush, checkpoint and cache control

    pub fn has_dirty(&self) -> bool {
        self.state.lock().cache.has_dirty()
    }

    /// True when a checkpoint already flushed this transaction's pages, so
    /// commit work remains even with an empty dirty set.
    pub fn flushed_in_transaction(&self) -> bool {
        self.state.lock().flushed
    }

    pub fn over_limit(&self, max_pages: usize) -> bool {
        self.state.lock().cache.over_limit(max_pages)
    }

    /// Persist the journal, then every dirty page (header last), then sync.
    /// Dirty pages become clean; the journal area stays on disk until
    /// [`truncate_journal`](Self::truncate_journal).
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();

        let header: HeaderPage = Self::load_typed(&self.disk, &mut state, PageId::HEADER)?;

        if self.journal_enabled && !state.journal.is_empty() {
            state.journal.persist(&self.disk, header.last_page_id)?;
        }

        let dirty = state.cache.dirty_pages();
        for page in dirty.iter().filter(|p| p.page_id() != PageId::HEADER) {
            self.disk.write_page(page.page_id(), &page.to_raw()?)?;
        }
        if let Some(header_page) = dirty.iter().find(|p| p.page_id() == PageId::HEADER) {
            self.disk.write_page(PageId::HEADER, &header_page.to_raw()?)?;
        }
        self.disk.sync()?;

        state.cache.mark_all_clean();
        state.flushed = true;
        Ok(())
    }

    /// Delete the journal area: truncate the file back to the header's
    /// extent. This is the commit point.
    pub fn truncate_journal(&self) -> Result<()> {
        let mut state = self.state.lock();
        let header: HeaderPage = Self::load_typed(&self.disk, &mut state, PageId::HEADER)?;

        self.disk.set_len_pages(header.last_page_id.0 as u64 + 1)?;
        self.disk.sync()?;
        state.journal.clear();
        state.flushed = false;
        Ok(())
    }

    /// Undo a transaction. Dirty pages simply drop out of memory; when a
    /// checkpoint already flushed parts of the transaction, the journaled
    /// pre-images are written back and the file is trimmed to its
    /// transaction-start extent.
    pub fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();

        if state.flushed {
            let mut last_page_id = self.header_from_disk()?.last_page_id;
            for raw in state.journal.pages() {
                let (base, page_type) = super::page::verify_page(raw)?;
                if page_type == super::page::PageType::Header {
                    let header: HeaderPage = super::page::deserialize_page(raw)?;
                    last_page_id = header.last_page_id;
                }
                self.disk.write_page(base.page_id, raw)?;
            }
            self.disk.set_len_pages(last_page_id.0 as u64 + 1)?;
            self.disk.sync()?;
            tracing::debug!("rolled back a checkpoint-flushed transaction from its journal");
        }

        state.journal.clear();
        state.flushed = false;
        state.cache.clear();
        Ok(())
    }

    /// Discard every cached page and the journal shadow. Returns whether
    /// dirty pages were dropped.
    pub fn clear_cache(&self) -> bool {
        let mut state = self.state.lock();
        state.journal.clear();
        state.flushed = false;
        state.cache.clear()
    }

    /// Drop clean pages only (safe during long read scans).
    pub fn clear_clean(&self) {
        self.state.lock().cache.clear_clean();
    }

    /// Read the header straight from disk, bypassing the cache.
    pub fn header_from_disk(&self) -> Result<HeaderPage> {
        let raw = self.disk.read_page(PageId::HEADER)?;
        super::page::deserialize_page(&raw)
    }

    /// The change counter of the cached header, if one is cached.
    pub fn cached_change_id(&self) -> Option<u16> {
        let state = self.state.lock();
        match state.cache.get(PageId::HEADER) {
            Some(CachedPage::Header(h)) => Some(h.change_id),
            _ => None,
        }
    }

    // Internal plumbing

    fn load(disk: &DiskManager, state: &mut PagerState, page_id: PageId) -> Result<CachedPage> {
        if !page_id.is_valid() {
            return Err(SoloError::Corrupted(
                "attempt to load the invalid page id".into(),
            ));
        }
        if let Some(page) = state.cache.get(page_id) {
            return Ok(page.clone());
        }

        let raw = disk.read_page(page_id)?;
        let page = CachedPage::from_raw(&raw)?;
        if page.page_id() != page_id {
            return Err(SoloError::Corrupted(format!(
                "page at slot {} claims id {}",
                page_id,
                page.page_id()
            )));
        }
        state.cache.insert_clean(page.clone());
        Ok(page)
    }

    fn load_typed<T: TypedPage>(
        disk: &DiskManager,
        state: &mut PagerState,
        page_id: PageId,
    ) -> Result<T> {
        let cached = Self::load(disk, state, page_id)?;
        T::from_cached(cached).ok_or_else(|| {
            SoloError::Corrupted(format!(
                "page {} does not hold a {:?} page",
                page_id,
                T::PAGE_TYPE
            ))
        })
    }

    fn store(state: &mut PagerState, page: CachedPage, journal_enabled: bool) -> Result<()> {
        if let Some(pre_image) = state.cache.set_dirty(page) {
            if journal_enabled {
                state.journal.capture(&pre_image)?;
            }
        }
        Ok(())
    }
}
