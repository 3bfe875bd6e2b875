//! Page cache: clean and dirty page maps.
//!
//! The cache is split in two: clean pages mirror disk and can be dropped at
//! any time; dirty pages carry uncommitted mutations and must survive until
//! they are flushed. The first clean-to-dirty transition of a page yields
//! its pre-image for journal capture.

use std::collections::HashMap;

use super::page::{CachedPage, PageId};

/// Default cache ceiling, in pages. [`CacheService::over_limit`] reports when
/// either map outgrows this so the owner can run a checkpoint.
pub const CACHE_CHECKPOINT_SIZE: usize = 5_000;

/// In-memory page cache.
///
/// Not internally synchronized; the pager wraps it in a mutex, making the
/// cache a process-wide shared resource touched only inside that lock.
#[derive(Debug, Default)]
pub struct CacheService {
    clean: HashMap<u32, CachedPage>,
    dirty: HashMap<u32, CachedPage>,
}

impl CacheService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a page, preferring the dirty version.
    pub fn get(&self, page_id: PageId) -> Option<&CachedPage> {
        self.dirty
            .get(&page_id.0)
            .or_else(|| self.clean.get(&page_id.0))
    }

    /// Insert a page freshly loaded from disk.
    pub fn insert_clean(&mut self, page: CachedPage) {
        let id = page.page_id().0;
        // A dirty copy always wins over a reload
        if !self.dirty.contains_key(&id) {
            self.clean.insert(id, page);
        }
    }

    /// Insert or replace a mutated page in the dirty set.
    ///
    /// Returns the page's clean pre-image when this is the first transition
    /// out of the clean set; brand-new pages and already-dirty pages return
    /// None.
    pub fn set_dirty(&mut self, page: CachedPage) -> Option<CachedPage> {
        let id = page.page_id().0;
        let pre_image = if self.dirty.contains_key(&id) {
            None
        } else {
            self.clean.remove(&id)
        };
        self.dirty.insert(id, page);
        pre_image
    }

    /// Drop any cached copy of a page (used when an empty page slot is
    /// handed out for reuse under a new type).
    pub fn discard(&mut self, page_id: PageId) {
        self.clean.remove(&page_id.0);
        self.dirty.remove(&page_id.0);
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn clean_count(&self) -> usize {
        self.clean.len()
    }

    /// Snapshot of the dirty set, ordered by page id.
    pub fn dirty_pages(&self) -> Vec<CachedPage> {
        let mut pages: Vec<CachedPage> = self.dirty.values().cloned().collect();
        pages.sort_by_key(|p| p.page_id());
        pages
    }

    /// After a flush: dirty pages now mirror disk, demote them to clean.
    pub fn mark_all_clean(&mut self) {
        for (id, page) in self.dirty.drain() {
            self.clean.insert(id, page);
        }
    }

    /// Drop every clean page (safe at any time).
    pub fn clear_clean(&mut self) {
        self.clean.clear();
    }

    /// Drop everything. Returns whether dirty pages were discarded, which
    /// rollback uses to know a journal exists.
    pub fn clear(&mut self) -> bool {
        let had_dirty = !self.dirty.is_empty();
        self.clean.clear();
        self.dirty.clear();
        had_dirty
    }

    /// True when either map exceeds the ceiling.
    pub fn over_limit(&self, max_pages: usize) -> bool {
        self.clean.len() > max_pages || self.dirty.len() > max_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{EmptyPage, TypedPage};

    fn page(id: u32) -> CachedPage {
        EmptyPage::new(PageId(id)).into()
    }

    #[test]
    fn test_dirty_wins_over_clean() {
        let mut cache = CacheService::new();
        cache.insert_clean(page(1));
        assert!(cache.get(PageId(1)).is_some());

        let pre = cache.set_dirty(page(1));
        assert!(pre.is_some());
        assert_eq!(cache.dirty_count(), 1);
        assert_eq!(cache.clean_count(), 0);

        // Reload attempts must not clobber the dirty copy
        cache.insert_clean(page(1));
        assert_eq!(cache.clean_count(), 0);
    }

    #[test]
    fn test_pre_image_only_on_first_transition() {
        let mut cache = CacheService::new();
        cache.insert_clean(page(1));

        assert!(cache.set_dirty(page(1)).is_some());
        assert!(cache.set_dirty(page(1)).is_none());

        // A page never seen clean has no pre-image
        assert!(cache.set_dirty(page(2)).is_none());
    }

    #[test]
    fn test_clear_reports_dirty() {
        let mut cache = CacheService::new();
        cache.insert_clean(page(1));
        assert!(!cache.clear());

        cache.set_dirty(page(2));
        assert!(cache.clear());
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(cache.clean_count(), 0);
    }

    #[test]
    fn test_mark_all_clean() {
        let mut cache = CacheService::new();
        cache.set_dirty(page(1));
        cache.set_dirty(page(2));
        cache.mark_all_clean();

        assert!(!cache.has_dirty());
        assert_eq!(cache.clean_count(), 2);
    }

    #[test]
    fn test_over_limit() {
        let mut cache = CacheService::new();
        for i in 0..10 {
            cache.insert_clean(page(i));
        }
        assert!(cache.over_limit(5));
        assert!(!cache.over_limit(10));
    }
}
