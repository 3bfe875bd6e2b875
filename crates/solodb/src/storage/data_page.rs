//! Data and extend pages: slotted storage for document bytes.
//!
//! A document's serialized bytes live in one or more chained blocks. The
//! first block sits in a [`DataPage`] and is the document's stable address
//! (stored in every index node). When a document does not fit its first
//! block, the remaining bytes continue in a chain of [`ExtendPage`]s, one
//! block per page, linked through `next_block`.

use std::collections::BTreeMap;

use solodb_common::{Result, SoloError};

use super::page::{
    CachedPage, PageAddress, PageBase, PageId, PageType, Serializable, TypedPage,
    PAGE_AVAILABLE_BYTES,
};

/// Fixed per-block overhead: slot, next block, total length, data length.
pub const BLOCK_FIXED_SIZE: usize = 2 + PageAddress::SERIALIZED_SIZE + 4 + 4;

/// Largest first-block payload a single data page can hold.
pub const MAX_BLOCK_DATA: usize = PAGE_AVAILABLE_BYTES - 2 - BLOCK_FIXED_SIZE;

/// Payload capacity of one extend page.
pub const EXTEND_PAGE_DATA: usize = PAGE_AVAILABLE_BYTES - PageAddress::SERIALIZED_SIZE - 4;

/// One document block inside a data page.
#[derive(Debug, Clone)]
pub struct DataBlock {
    /// This block's own address (owning page + slot).
    pub position: PageAddress,
    /// Next block of the same document, or EMPTY at the end of the chain.
    pub next_block: PageAddress,
    /// Total serialized document length; set on the first block of a chain.
    pub total_length: u32,
    pub data: Vec<u8>,
}

impl DataBlock {
    pub fn new(position: PageAddress, total_length: u32, data: Vec<u8>) -> Self {
        Self {
            position,
            next_block: PageAddress::EMPTY,
            total_length,
            data,
        }
    }

    pub fn serialized_size(&self) -> usize {
        BLOCK_FIXED_SIZE + self.data.len()
    }

    fn serialize(&self, buf: &mut Vec<u8>) {
        self.position.slot.serialize(buf);
        self.next_block.serialize(buf);
        self.total_length.serialize(buf);
        self.data.serialize(buf);
    }

    fn deserialize(page_id: PageId, buf: &[u8]) -> Result<(Self, usize)> {
        let (slot, mut offset) = u16::deserialize(buf)?;
        let (next_block, n) = PageAddress::deserialize(&buf[offset..])?;
        offset += n;
        let (total_length, n) = u32::deserialize(&buf[offset..])?;
        offset += n;
        let (data, n) = Vec::<u8>::deserialize(&buf[offset..])?;
        offset += n;

        Ok((
            Self {
                position: PageAddress::new(page_id, slot),
                next_block,
                total_length,
                data,
            },
            offset,
        ))
    }
}

/// A page of document blocks.
#[derive(Debug, Clone)]
pub struct DataPage {
    pub base: PageBase,
    pub blocks: BTreeMap<u16, DataBlock>,
}

impl DataPage {
    /// Lowest unused slot number.
    pub fn next_free_slot(&self) -> u16 {
        (0..=u16::MAX)
            .find(|slot| !self.blocks.contains_key(slot))
            .unwrap_or(u16::MAX)
    }

    pub fn get_block(&self, slot: u16) -> Result<&DataBlock> {
        self.blocks.get(&slot).ok_or_else(|| {
            SoloError::Corrupted(format!(
                "data block {}:{} not found",
                self.base.page_id, slot
            ))
        })
    }

    fn content_size(&self) -> usize {
        2 + self
            .blocks
            .values()
            .map(|b| b.serialized_size())
            .sum::<usize>()
    }
}

impl TypedPage for DataPage {
    const PAGE_TYPE: PageType = PageType::Data;

    fn new(page_id: PageId) -> Self {
        Self {
            base: PageBase::new(page_id),
            blocks: BTreeMap::new(),
        }
    }

    fn base(&self) -> &PageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut PageBase {
        &mut self.base
    }

    fn read_content(base: PageBase, body: &[u8]) -> Result<Self> {
        let (count, mut offset) = u16::deserialize(body)?;
        let mut blocks = BTreeMap::new();

        for _ in 0..count {
            let (block, n) = DataBlock::deserialize(base.page_id, &body[offset..])?;
            offset += n;
            blocks.insert(block.position.slot, block);
        }

        Ok(Self { base, blocks })
    }

    fn write_content(&self, body: &mut [u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(self.content_size());

        (self.blocks.len() as u16).serialize(&mut buf);
        for block in self.blocks.values() {
            block.serialize(&mut buf);
        }

        if buf.len() > body.len() {
            return Err(SoloError::Storage(format!(
                "data page {} overflow",
                self.base.page_id
            )));
        }
        body[..buf.len()].copy_from_slice(&buf);
        Ok(())
    }

    fn item_count(&self) -> u16 {
        self.blocks.len() as u16
    }

    fn free_bytes(&self) -> u16 {
        (PAGE_AVAILABLE_BYTES.saturating_sub(self.content_size())) as u16
    }

    fn from_cached(page: CachedPage) -> Option<Self> {
        match page {
            CachedPage::Data(p) => Some(p),
            _ => None,
        }
    }
}

impl From<DataPage> for CachedPage {
    fn from(page: DataPage) -> Self {
        CachedPage::Data(page)
    }
}

/// An overflow page holding one continuation block of an oversized document.
///
/// Extend pages never join a free list; each belongs wholly to one document
/// and is released with it. Its block address is always slot 0.
#[derive(Debug, Clone)]
pub struct ExtendPage {
    pub base: PageBase,
    /// Next block in the document chain, or EMPTY at the end.
    pub next_block: PageAddress,
    pub data: Vec<u8>,
}

impl ExtendPage {
    /// Address of this page's single block.
    pub fn block_address(&self) -> PageAddress {
        PageAddress::new(self.base.page_id, 0)
    }
}

impl TypedPage for ExtendPage {
    const PAGE_TYPE: PageType = PageType::Extend;

    fn new(page_id: PageId) -> Self {
        Self {
            base: PageBase::new(page_id),
            next_block: PageAddress::EMPTY,
            data: Vec::new(),
        }
    }

    fn base(&self) -> &PageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut PageBase {
        &mut self.base
    }

    fn read_content(base: PageBase, body: &[u8]) -> Result<Self> {
        let (next_block, offset) = PageAddress::deserialize(body)?;
        let (data, _) = Vec::<u8>::deserialize(&body[offset..])?;

        Ok(Self {
            base,
            next_block,
            data,
        })
    }

    fn write_content(&self, body: &mut [u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(PageAddress::SERIALIZED_SIZE + 4 + self.data.len());
        self.next_block.serialize(&mut buf);
        self.data.serialize(&mut buf);

        if buf.len() > body.len() {
            return Err(SoloError::Storage(format!(
                "extend page {} overflow",
                self.base.page_id
            )));
        }
        body[..buf.len()].copy_from_slice(&buf);
        Ok(())
    }

    fn item_count(&self) -> u16 {
        1
    }

    fn free_bytes(&self) -> u16 {
        (EXTEND_PAGE_DATA.saturating_sub(self.data.len())) as u16
    }

    fn from_cached(page: CachedPage) -> Option<Self> {
        match page {
            CachedPage::Extend(p) => Some(p),
            _ => None,
        }
    }
}

impl From<ExtendPage> for CachedPage {
    fn from(page: ExtendPage) -> Self {
        CachedPage::Extend(page)
    }
}
