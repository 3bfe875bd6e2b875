//! Collection page: per-collection metadata.
//!
//! One page per collection, referenced from the header directory. Holds the
//! document count, the heads of the collection's two free lists (data pages
//! and index pages), and up to [`MAX_INDEXES`] index slots. Slot 0 is always
//! the unique `_id` primary key, created with the collection.

use std::collections::BTreeMap;

use solodb_common::{Result, SoloError};

use super::page::{
    CachedPage, PageAddress, PageBase, PageId, PageType, Serializable, TypedPage,
    PAGE_AVAILABLE_BYTES,
};

/// Maximum number of indexes per collection (including the primary key).
pub const MAX_INDEXES: usize = 16;

/// Reserved index slot of the primary key.
pub const PK_SLOT: u8 = 0;

/// Name of the primary-key index.
pub const PK_INDEX_NAME: &str = "_id_";

/// Metadata for one index of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionIndex {
    /// Index slot in the collection (0 = primary key).
    pub slot: u8,
    /// Index name, unique within the collection.
    pub name: String,
    /// Dotted field path this index covers.
    pub field: String,
    /// Unique indexes reject duplicate keys.
    pub unique: bool,
    /// Head sentinel node (MinValue key).
    pub head: PageAddress,
    /// Tail sentinel node (MaxValue key).
    pub tail: PageAddress,
}

impl Serializable for CollectionIndex {
    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.push(self.slot);
        self.name.serialize(buf);
        self.field.serialize(buf);
        buf.push(self.unique as u8);
        self.head.serialize(buf);
        self.tail.serialize(buf);
    }

    fn deserialize(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.is_empty() {
            return Err(SoloError::Corrupted("truncated index entry".into()));
        }
        let slot = buf[0];
        let mut offset = 1;
        let (name, n) = String::deserialize(&buf[offset..])?;
        offset += n;
        let (field, n) = String::deserialize(&buf[offset..])?;
        offset += n;
        if buf.len() <= offset {
            return Err(SoloError::Corrupted("truncated index entry".into()));
        }
        let unique = buf[offset] != 0;
        offset += 1;
        let (head, n) = PageAddress::deserialize(&buf[offset..])?;
        offset += n;
        let (tail, n) = PageAddress::deserialize(&buf[offset..])?;
        offset += n;

        Ok((
            Self {
                slot,
                name,
                field,
                unique,
                head,
                tail,
            },
            offset,
        ))
    }

    fn serialized_size(&self) -> usize {
        1 + self.name.serialized_size() + self.field.serialized_size() + 1
            + 2 * PageAddress::SERIALIZED_SIZE
    }
}

/// Per-collection metadata page.
#[derive(Debug, Clone)]
pub struct CollectionPage {
    pub base: PageBase,
    pub name: String,
    pub document_count: u64,
    /// Head of the free list of data pages with spare capacity.
    pub free_data_page_id: PageId,
    /// Head of the free list of index pages with spare capacity.
    pub free_index_page_id: PageId,
    /// Index slots, keyed by slot number.
    pub indexes: BTreeMap<u8, CollectionIndex>,
}

impl CollectionPage {
    /// The primary-key index. Every persisted collection page has one.
    pub fn pk_index(&self) -> Result<&CollectionIndex> {
        self.indexes.get(&PK_SLOT).ok_or_else(|| {
            SoloError::Corrupted(format!(
                "collection \"{}\" is missing its primary-key index",
                self.name
            ))
        })
    }

    /// Find an index by name.
    pub fn index_by_name(&self, name: &str) -> Option<&CollectionIndex> {
        self.indexes.values().find(|i| i.name == name)
    }

    /// Find an index covering a field path.
    pub fn index_by_field(&self, field: &str) -> Option<&CollectionIndex> {
        self.indexes.values().find(|i| i.field == field)
    }

    /// Lowest unused index slot, if the collection has room for another.
    pub fn next_index_slot(&self) -> Option<u8> {
        (0..MAX_INDEXES as u8).find(|slot| !self.indexes.contains_key(slot))
    }

    fn content_size(&self) -> usize {
        self.name.serialized_size()
            + 8 // document_count
            + 4 // free_data_page_id
            + 4 // free_index_page_id
            + 1 // index count
            + self
                .indexes
                .values()
                .map(|i| i.serialized_size())
                .sum::<usize>()
    }
}

impl TypedPage for CollectionPage {
    const PAGE_TYPE: PageType = PageType::Collection;

    fn new(page_id: PageId) -> Self {
        Self {
            base: PageBase::new(page_id),
            name: String::new(),
            document_count: 0,
            free_data_page_id: PageId::INVALID,
            free_index_page_id: PageId::INVALID,
            indexes: BTreeMap::new(),
        }
    }

    fn base(&self) -> &PageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut PageBase {
        &mut self.base
    }

    fn read_content(base: PageBase, body: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let (name, n) = String::deserialize(&body[offset..])?;
        offset += n;
        let (document_count, n) = u64::deserialize(&body[offset..])?;
        offset += n;
        let (free_data_page_id, n) = PageId::deserialize(&body[offset..])?;
        offset += n;
        let (free_index_page_id, n) = PageId::deserialize(&body[offset..])?;
        offset += n;

        let count = body[offset] as usize;
        offset += 1;
        let mut indexes = BTreeMap::new();
        for _ in 0..count {
            let (index, n) = CollectionIndex::deserialize(&body[offset..])?;
            offset += n;
            indexes.insert(index.slot, index);
        }

        Ok(Self {
            base,
            name,
            document_count,
            free_data_page_id,
            free_index_page_id,
            indexes,
        })
    }

    fn write_content(&self, body: &mut [u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(self.content_size());

        self.name.serialize(&mut buf);
        self.document_count.serialize(&mut buf);
        self.free_data_page_id.serialize(&mut buf);
        self.free_index_page_id.serialize(&mut buf);
        buf.push(self.indexes.len() as u8);
        for index in self.indexes.values() {
            index.serialize(&mut buf);
        }

        if buf.len() > body.len() {
            return Err(SoloError::Storage(format!(
                "collection page overflow for \"{}\"",
                self.name
            )));
        }
        body[..buf.len()].copy_from_slice(&buf);
        Ok(())
    }

    fn item_count(&self) -> u16 {
        self.indexes.len() as u16
    }

    fn free_bytes(&self) -> u16 {
        (PAGE_AVAILABLE_BYTES - self.content_size()) as u16
    }

    fn from_cached(page: CachedPage) -> Option<Self> {
        match page {
            CachedPage::Collection(p) => Some(p),
            _ => None,
        }
    }
}

impl From<CollectionPage> for CachedPage {
    fn from(page: CollectionPage) -> Self {
        CachedPage::Collection(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{deserialize_page, serialize_page};

    fn sample_index(slot: u8, name: &str, field: &str, unique: bool) -> CollectionIndex {
        CollectionIndex {
            slot,
            name: name.into(),
            field: field.into(),
            unique,
            head: PageAddress::new(PageId(4), 0),
            tail: PageAddress::new(PageId(4), 1),
        }
    }

    #[test]
    fn test_round_trip() {
        let mut page = CollectionPage::new(PageId(2));
        page.name = "users".into();
        page.document_count = 123;
        page.free_data_page_id = PageId(7);
        page.indexes
            .insert(PK_SLOT, sample_index(PK_SLOT, PK_INDEX_NAME, "_id", true));
        page.indexes.insert(1, sample_index(1, "email_1", "email", true));

        let raw = serialize_page(&page).unwrap();
        let decoded: CollectionPage = deserialize_page(&raw).unwrap();

        assert_eq!(decoded.name, "users");
        assert_eq!(decoded.document_count, 123);
        assert_eq!(decoded.indexes.len(), 2);
        assert_eq!(decoded.pk_index().unwrap().field, "_id");
        assert_eq!(decoded.index_by_field("email").unwrap().name, "email_1");
        assert!(decoded.index_by_name("missing_1").is_none());
    }

    #[test]
    fn test_next_index_slot() {
        let mut page = CollectionPage::new(PageId(2));
        page.indexes
            .insert(PK_SLOT, sample_index(PK_SLOT, PK_INDEX_NAME, "_id", true));
        page.indexes.insert(2, sample_index(2, "a_1", "a", false));

        // Lowest gap wins, slot 1 before slot 3
        assert_eq!(page.next_index_slot(), Some(1));

        for slot in 0..MAX_INDEXES as u8 {
            page.indexes
                .entry(slot)
                .or_insert_with(|| sample_index(slot, "x_1", "x", false));
        }
        assert_eq!(page.next_index_slot(), None);
    }
}
