//! Data service: document bytes as chained blocks.
//!
//! A document serializes once, then lands in a first block inside a data
//! page taken from the collection's free list. Bytes that do not fit
//! continue in a chain of extend pages, one block per page, linked through
//! `next_block` (and `next_page_id`, so a chain can be released as a
//! sequence). The first block's address is the document's stable handle:
//! updates keep it, reshaping only the tail of the chain.

use solodb_common::{Result, SoloError};

use crate::storage::{
    CollectionPage, DataBlock, DataPage, ExtendPage, PageAddress, PagerService, TypedPage,
    BLOCK_FIXED_SIZE, EXTEND_PAGE_DATA, MAX_BLOCK_DATA,
};

/// Maximum serialized document size (1 MiB).
pub const MAX_DOCUMENT_SIZE: usize = 1024 * 1024;

/// Data pages with at least this much spare room stay in the collection's
/// free list; smaller remainders are left to future small documents.
pub const DATA_FREE_LIST_MIN: usize = 300;

/// Block storage for document payloads.
pub struct DataService<'a> {
    pager: &'a PagerService,
}

impl<'a> DataService<'a> {
    pub fn new(pager: &'a PagerService) -> Self {
        Self { pager }
    }

    /// Store a document's bytes, returning the first block's address.
    pub fn insert(&self, col: &mut CollectionPage, bytes: &[u8]) -> Result<PageAddress> {
        if bytes.len() > MAX_DOCUMENT_SIZE {
            return Err(SoloError::DocumentTooLarge {
                size: bytes.len(),
                max: MAX_DOCUMENT_SIZE,
            });
        }

        let desired = BLOCK_FIXED_SIZE + bytes.len().min(MAX_BLOCK_DATA);
        let mut page: DataPage = self.pager.get_free_page(col.free_data_page_id, desired)?;

        let available = page.free_bytes() as usize - BLOCK_FIXED_SIZE;
        let first_chunk = bytes.len().min(available);

        let slot = page.next_free_slot();
        let addr = PageAddress::new(page.page_id(), slot);
        let mut block = DataBlock::new(addr, bytes.len() as u32, bytes[..first_chunk].to_vec());

        if first_chunk < bytes.len() {
            block.next_block = self.write_extend_chain(&bytes[first_chunk..])?;
        }

        page.blocks.insert(slot, block);
        self.pager.save(page)?;

        col.free_data_page_id =
            self.pager
                .free_list_ensure(col.free_data_page_id, addr.page_id, DATA_FREE_LIST_MIN)?;

        Ok(addr)
    }

    /// Read a document's bytes, reassembling the chain. Memory is bounded
    /// by the length declared on the first block.
    pub fn read(&self, addr: PageAddress) -> Result<Vec<u8>> {
        let page: DataPage = self.pager.get_page(addr.page_id)?;
        let block = page.get_block(addr.slot)?;
        let total = block.total_length as usize;

        if block.next_block.is_empty() {
            if block.data.len() != total {
                return Err(SoloError::Corrupted(format!(
                    "data block {addr} holds {} bytes, declared {total}",
                    block.data.len()
                )));
            }
            return Ok(block.data.clone());
        }

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&block.data);
        let mut cur = block.next_block;

        while !cur.is_empty() {
            if out.len() >= total {
                return Err(SoloError::Corrupted(format!(
                    "data chain at {addr} exceeds its declared length {total}"
                )));
            }
            let ext: ExtendPage = self.pager.get_page(cur.page_id)?;
            if cur.slot != 0 {
                return Err(SoloError::Corrupted(format!(
                    "extend block reference with non-zero slot: {cur}"
                )));
            }
            out.extend_from_slice(&ext.data);
            cur = ext.next_block;
        }

        if out.len() != total {
            return Err(SoloError::Corrupted(format!(
                "data chain at {addr} reassembled {} bytes, declared {total}",
                out.len()
            )));
        }
        Ok(out)
    }

    /// Rewrite a document in place. The first block's address stays valid;
    /// its payload grows into the page's free space or shrinks, and the
    /// extend chain is rebuilt to match the new length.
    pub fn update(&self, col: &mut CollectionPage, addr: PageAddress, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_DOCUMENT_SIZE {
            return Err(SoloError::DocumentTooLarge {
                size: bytes.len(),
                max: MAX_DOCUMENT_SIZE,
            });
        }

        let mut page: DataPage = self.pager.get_page(addr.page_id)?;
        let block = page.get_block(addr.slot)?;
        let old_chain = block.next_block;

        // The first block may reclaim the page's remaining free space
        let capacity = page.free_bytes() as usize + block.data.len();
        let first_chunk = bytes.len().min(capacity);

        let new_chain = if first_chunk < bytes.len() {
            self.write_extend_chain(&bytes[first_chunk..])?
        } else {
            PageAddress::EMPTY
        };

        let block = page
            .blocks
            .get_mut(&addr.slot)
            .ok_or_else(|| SoloError::Corrupted(format!("data block {addr} not found")))?;
        block.data = bytes[..first_chunk].to_vec();
        block.total_length = bytes.len() as u32;
        block.next_block = new_chain;
        self.pager.save(page)?;

        if !old_chain.is_empty() {
            self.pager.delete_page(old_chain.page_id, true)?;
        }

        col.free_data_page_id =
            self.pager
                .free_list_ensure(col.free_data_page_id, addr.page_id, DATA_FREE_LIST_MIN)?;
        Ok(())
    }

    /// Release a document's blocks.
    pub fn delete(&self, col: &mut CollectionPage, addr: PageAddress) -> Result<()> {
        let mut page: DataPage = self.pager.get_page(addr.page_id)?;
        let block = page
            .blocks
            .remove(&addr.slot)
            .ok_or_else(|| SoloError::Corrupted(format!("data block {addr} not found")))?;
        let emptied = page.blocks.is_empty();
        self.pager.save(page)?;

        if emptied {
            col.free_data_page_id = self
                .pager
                .free_list_remove(col.free_data_page_id, addr.page_id)?;
            self.pager.delete_page(addr.page_id, false)?;
        } else {
            col.free_data_page_id = self.pager.free_list_ensure(
                col.free_data_page_id,
                addr.page_id,
                DATA_FREE_LIST_MIN,
            )?;
        }

        if !block.next_block.is_empty() {
            self.pager.delete_page(block.next_block.page_id, true)?;
        }
        Ok(())
    }

    /// Build an extend-page chain for overflow bytes, returning the address
    /// of its first block.
    fn write_extend_chain(&self, bytes: &[u8]) -> Result<PageAddress> {
        let mut pages: Vec<ExtendPage> = Vec::new();
        for chunk in bytes.chunks(EXTEND_PAGE_DATA) {
            let mut ext: ExtendPage = self.pager.new_page()?;
            ext.data = chunk.to_vec();
            pages.push(ext);
        }

        for i in 0..pages.len() - 1 {
            let next_block = pages[i + 1].block_address();
            let next_id = pages[i + 1].page_id();
            pages[i].next_block = next_block;
            pages[i].base.next_page_id = next_id;
        }

        let first = pages[0].block_address();
        for ext in pages {
            self.pager.save(ext)?;
        }
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::serialize_page;
    use crate::storage::{DiskManager, HeaderPage, PageId};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup() -> (Arc<PagerService>, CollectionPage, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let (disk, _) = DiskManager::open(&path, None).unwrap();
        disk.write_page(
            PageId::HEADER,
            &serialize_page(&HeaderPage::new(PageId::HEADER)).unwrap(),
        )
        .unwrap();

        let pager = Arc::new(PagerService::new(Arc::new(disk), true));
        let mut col: CollectionPage = pager.new_page().unwrap();
        col.name = "test".into();
        pager.save(col.clone()).unwrap();

        (pager, col, dir)
    }

    #[test]
    fn test_single_block_round_trip() {
        let (pager, mut col, _dir) = setup();
        let data = DataService::new(&pager);

        let bytes = vec![0xA5u8; 200];
        let addr = data.insert(&mut col, &bytes).unwrap();
        assert_eq!(data.read(addr).unwrap(), bytes);
    }

    #[test]
    fn test_chained_document_round_trip() {
        let (pager, mut col, _dir) = setup();
        let data = DataService::new(&pager);

        // Three pages worth of bytes, patterned to catch reassembly bugs
        let bytes: Vec<u8> = (0..12_000u32).map(|i| (i % 251) as u8).collect();
        let addr = data.insert(&mut col, &bytes).unwrap();
        assert_eq!(data.read(addr).unwrap(), bytes);
    }

    #[test]
    fn test_small_documents_share_a_page() {
        let (pager, mut col, _dir) = setup();
        let data = DataService::new(&pager);

        let a = data.insert(&mut col, &[1u8; 100]).unwrap();
        let b = data.insert(&mut col, &[2u8; 100]).unwrap();
        assert_eq!(a.page_id, b.page_id);
        assert_ne!(a.slot, b.slot);
    }

    #[test]
    fn test_update_in_place_keeps_address() {
        let (pager, mut col, _dir) = setup();
        let data = DataService::new(&pager);

        let addr = data.insert(&mut col, &[1u8; 100]).unwrap();

        // Grow within the page
        data.update(&mut col, addr, &[2u8; 500]).unwrap();
        assert_eq!(data.read(addr).unwrap(), vec![2u8; 500]);

        // Grow past the page into a chain
        data.update(&mut col, addr, &[3u8; 9_000]).unwrap();
        assert_eq!(data.read(addr).unwrap(), vec![3u8; 9_000]);

        // Shrink back to a single block; the chain is released
        data.update(&mut col, addr, &[4u8; 50]).unwrap();
        assert_eq!(data.read(addr).unwrap(), vec![4u8; 50]);

        let header = pager.header().unwrap();
        assert!(header.free_empty_page_id.is_valid());
    }

    #[test]
    fn test_delete_releases_pages() {
        let (pager, mut col, _dir) = setup();
        let data = DataService::new(&pager);

        let addr = data.insert(&mut col, &vec![9u8; 10_000]).unwrap();
        data.delete(&mut col, addr).unwrap();

        assert!(data.read(addr).is_err());
        // The data page and its extend chain all reached the empty list
        let header = pager.header().unwrap();
        let empties = pager.free_list_pages(header.free_empty_page_id).unwrap();
        assert!(empties.len() >= 3);
        assert!(!col.free_data_page_id.is_valid());
    }

    #[test]
    fn test_oversized_document_rejected_untouched() {
        let (pager, mut col, _dir) = setup();
        let data = DataService::new(&pager);

        let before = pager.header().unwrap().last_page_id;
        let err = data
            .insert(&mut col, &vec![0u8; MAX_DOCUMENT_SIZE + 1])
            .unwrap_err();
        assert!(matches!(err, SoloError::DocumentTooLarge { .. }));
        assert_eq!(pager.header().unwrap().last_page_id, before);
    }
}
