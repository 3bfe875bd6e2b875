//! Undo journal: pre-images of pages about to be overwritten.
//!
//! Pre-images are captured in memory at a page's first clean-to-dirty
//! transition and persisted as raw pages past `last_page_id` before any
//! committed page is overwritten. Deleting the journal area (truncating the
//! file back to `last_page_id + 1`) is the commit point: a crash before the
//! truncate recovers to the transaction-start state, a crash after it keeps
//! the fully committed state.

use std::collections::{HashMap, HashSet};

use solodb_common::Result;

use super::disk::DiskManager;
use super::header::HeaderPage;
use super::page::{deserialize_page, verify_page, CachedPage, PageId, RawPage};

/// In-memory pre-image set for the running transaction.
#[derive(Debug, Default)]
pub struct JournalShadow {
    pages: Vec<RawPage>,
    seen: HashSet<u32>,
}

impl JournalShadow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a page's pre-image. Only the first capture per page id is
    /// kept: after a mid-transaction checkpoint the clean copy already
    /// contains in-transaction content, which must not shadow the original.
    pub fn capture(&mut self, pre_image: &CachedPage) -> Result<()> {
        let id = pre_image.page_id().0;
        if self.seen.insert(id) {
            self.pages.push(pre_image.to_raw()?);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// The captured pre-images, in capture order.
    pub fn pages(&self) -> impl Iterator<Item = &RawPage> {
        self.pages.iter()
    }

    /// Write every pre-image to the journal area starting right past
    /// `last_page_id`, then sync. Must complete before any data page is
    /// overwritten.
    pub fn persist(&self, disk: &DiskManager, last_page_id: PageId) -> Result<()> {
        if self.pages.is_empty() {
            return Ok(());
        }

        let base = last_page_id.0 as u64 + 1;
        for (i, raw) in self.pages.iter().enumerate() {
            disk.write_page(PageId((base + i as u64) as u32), raw)?;
        }
        disk.sync()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.seen.clear();
    }
}

/// Result of an open-time recovery check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Clean,
    Recovered { pages: usize },
}

/// Detect and apply a crashed transaction's journal on open.
///
/// A file longer than `last_page_id + 1` pages carries a trailing area from
/// an interrupted commit. Every valid page image found there is written back
/// to its own page id (first occurrence wins; torn or zero pages are
/// skipped), then the file is truncated to the restored header's length.
pub fn recover(disk: &DiskManager) -> Result<Recovery> {
    let len = disk.len_pages()?;
    if len == 0 {
        return Ok(Recovery::Clean);
    }

    let disk_header: HeaderPage = deserialize_page(&disk.read_page(PageId::HEADER)?)?;
    let data_pages = disk_header.last_page_id.0 as u64 + 1;
    if len <= data_pages {
        return Ok(Recovery::Clean);
    }

    // Collect first occurrences from the trailing area
    let mut images: HashMap<u32, RawPage> = HashMap::new();
    let mut order: Vec<u32> = Vec::new();
    for slot in data_pages..len {
        let raw = match disk.read_page(PageId(slot as u32)) {
            Ok(raw) => raw,
            Err(_) => continue,
        };
        let Ok((base, _)) = verify_page(&raw) else {
            // Torn or never-written slot; later journal pages may still be valid
            continue;
        };
        if !images.contains_key(&base.page_id.0) {
            images.insert(base.page_id.0, raw);
            order.push(base.page_id.0);
        }
    }

    // The journaled header (if any) defines the transaction-start file length
    let old_header: HeaderPage = match images.get(&PageId::HEADER.0) {
        Some(raw) => deserialize_page(raw)?,
        None => disk_header,
    };
    let old_last = old_header.last_page_id;

    let mut restored = 0usize;
    for id in &order {
        if *id <= old_last.0 {
            disk.write_page(PageId(*id), &images[id])?;
            restored += 1;
        }
    }

    disk.set_len_pages(old_last.0 as u64 + 1)?;
    disk.sync()?;

    tracing::warn!(
        "recovered data file from interrupted commit: {} page(s) restored",
        restored
    );

    Ok(Recovery::Recovered { pages: restored })
}
