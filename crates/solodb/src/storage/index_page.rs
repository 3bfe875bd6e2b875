//! Index pages: slotted storage for skip-list nodes.
//!
//! Each index page holds a set of [`IndexNode`]s keyed by slot number. A
//! node belongs to one index of one collection and carries its key, its
//! per-level neighbor addresses, the address of the document's first data
//! block, and the link to the next index node of the same document.

use smallvec::SmallVec;
use solodb_common::{Result, SoloError, Value};

use super::page::{
    CachedPage, PageAddress, PageBase, PageId, PageType, Serializable, TypedPage,
    PAGE_AVAILABLE_BYTES,
};

/// Maximum height of a skip-list node.
pub const MAX_INDEX_LEVELS: usize = 32;

/// Maximum serialized size of an index key.
pub const MAX_INDEX_KEY_SIZE: usize = 512;

/// Fixed per-node overhead: slot, index slot, levels, data block, next node,
/// key length prefix.
const NODE_FIXED_SIZE: usize = 2 + 1 + 1 + 2 * PageAddress::SERIALIZED_SIZE + 2;

/// Largest possible node; pages with at least this much free space can take
/// any node, which keeps the head of the index free list always usable.
pub const MAX_NODE_SIZE: usize =
    NODE_FIXED_SIZE + MAX_INDEX_KEY_SIZE + MAX_INDEX_LEVELS * 2 * PageAddress::SERIALIZED_SIZE;

type LevelLinks = SmallVec<[PageAddress; 4]>;

/// One skip-list node.
#[derive(Debug, Clone)]
pub struct IndexNode {
    /// This node's own address (owning page + slot).
    pub position: PageAddress,
    /// Which index of the collection this node belongs to.
    pub index_slot: u8,
    /// The node's key.
    pub key: Value,
    /// First data block of the owning document.
    pub data_block: PageAddress,
    /// Next index node of the same document (ascending index slot order).
    pub next_node: PageAddress,
    /// Previous neighbor per level; length is the node's height.
    pub prev: LevelLinks,
    /// Next neighbor per level; length is the node's height.
    pub next: LevelLinks,
}

impl IndexNode {
    pub fn new(position: PageAddress, index_slot: u8, levels: u8, key: Value) -> Self {
        let levels = levels as usize;
        Self {
            position,
            index_slot,
            key,
            data_block: PageAddress::EMPTY,
            next_node: PageAddress::EMPTY,
            prev: smallvec::smallvec![PageAddress::EMPTY; levels],
            next: smallvec::smallvec![PageAddress::EMPTY; levels],
        }
    }

    /// The node's height (number of levels).
    #[inline]
    pub fn levels(&self) -> u8 {
        self.prev.len() as u8
    }

    /// Serialized size for a node of the given shape.
    pub fn size_for(levels: u8, key_len: usize) -> usize {
        NODE_FIXED_SIZE + key_len + levels as usize * 2 * PageAddress::SERIALIZED_SIZE
    }

    pub fn serialized_size(&self) -> usize {
        Self::size_for(self.levels(), self.key.encoded_len())
    }

    fn serialize(&self, buf: &mut Vec<u8>) {
        self.position.slot.serialize(buf);
        buf.push(self.index_slot);
        buf.push(self.levels());
        self.data_block.serialize(buf);
        self.next_node.serialize(buf);

        let key_bytes = self.key.to_bytes();
        (key_bytes.len() as u16).serialize(buf);
        buf.extend_from_slice(&key_bytes);

        for level in 0..self.prev.len() {
            self.prev[level].serialize(buf);
            self.next[level].serialize(buf);
        }
    }

    fn deserialize(page_id: PageId, buf: &[u8]) -> Result<(Self, usize)> {
        let (slot, mut offset) = u16::deserialize(buf)?;
        if buf.len() < offset + 2 {
            return Err(SoloError::Corrupted("truncated index node".into()));
        }
        let index_slot = buf[offset];
        let levels = buf[offset + 1] as usize;
        offset += 2;

        if levels == 0 || levels > MAX_INDEX_LEVELS {
            return Err(SoloError::Corrupted(format!(
                "index node has invalid level count {levels}"
            )));
        }

        let (data_block, n) = PageAddress::deserialize(&buf[offset..])?;
        offset += n;
        let (next_node, n) = PageAddress::deserialize(&buf[offset..])?;
        offset += n;

        let (key_len, n) = u16::deserialize(&buf[offset..])?;
        offset += n;
        if buf.len() < offset + key_len as usize {
            return Err(SoloError::Corrupted("truncated index key".into()));
        }
        let (key, _) = Value::from_bytes(&buf[offset..offset + key_len as usize])?;
        offset += key_len as usize;

        let mut prev: LevelLinks = SmallVec::with_capacity(levels);
        let mut next: LevelLinks = SmallVec::with_capacity(levels);
        for _ in 0..levels {
            let (p, n) = PageAddress::deserialize(&buf[offset..])?;
            offset += n;
            prev.push(p);
            let (q, n) = PageAddress::deserialize(&buf[offset..])?;
            offset += n;
            next.push(q);
        }

        Ok((
            Self {
                position: PageAddress::new(page_id, slot),
                index_slot,
                key,
                data_block,
                next_node,
                prev,
                next,
            },
            offset,
        ))
    }
}

/// A page of skip-list nodes.
#[derive(Debug, Clone)]
pub struct IndexPage {
    pub base: PageBase,
    pub nodes: std::collections::BTreeMap<u16, IndexNode>,
}

impl IndexPage {
    /// Lowest unused slot number.
    pub fn next_free_slot(&self) -> u16 {
        (0..=u16::MAX)
            .find(|slot| !self.nodes.contains_key(slot))
            .unwrap_or(u16::MAX)
    }

    pub fn get_node(&self, slot: u16) -> Result<&IndexNode> {
        self.nodes.get(&slot).ok_or_else(|| {
            SoloError::Corrupted(format!(
                "index node {}:{} not found",
                self.base.page_id, slot
            ))
        })
    }

    fn content_size(&self) -> usize {
        2 + self
            .nodes
            .values()
            .map(|n| n.serialized_size())
            .sum::<usize>()
    }
}

impl TypedPage for IndexPage {
    const PAGE_TYPE: PageType = PageType::Index;

    fn new(page_id: PageId) -> Self {
        Self {
            base: PageBase::new(page_id),
            nodes: std::collections::BTreeMap::new(),
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
        let mut nodes = std::collections::BTreeMap::new();

        for _ in 0..count {
            let (node, n) = IndexNode::deserialize(base.page_id, &body[offset..])?;
            offset += n;
            nodes.insert(node.position.slot, node);
        }

        Ok(Self { base, nodes })
    }

    fn write_content(&self, body: &mut [u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(self.content_size());

        (self.nodes.len() as u16).serialize(&mut buf);
        for node in self.nodes.values() {
            node.serialize(&mut buf);
        }

        if buf.len() > body.len() {
            return Err(SoloError::Storage(format!(
                "index page {} overflow",
                self.base.page_id
            )));
        }
        body[..buf.len()].copy_from_slice(&buf);
        Ok(())
    }

    fn item_count(&self) -> u16 {
        self.nodes.len() as u16
    }

    fn free_bytes(&self) -> u16 {
        (PAGE_AVAILABLE_BYTES.saturating_sub(self.content_size())) as u16
    }

    fn from_cached(page: CachedPage) -> Option<Self> {
        match page {
            CachedPage::Index(p) => Some(p),
            _ => None,
        }
    }
}

impl From<IndexPage> for CachedPage {
    fn from(page: IndexPage) -> Self {
        CachedPage::Index(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{deserialize_page, serialize_page};

    #[test]
    fn test_node_round_trip() {
        let mut page = IndexPage::new(PageId(5));

        let mut node = IndexNode::new(
            PageAddress::new(PageId(5), 0),
            1,
            3,
            Value::String("ada".into()),
        );
        node.data_block = PageAddress::new(PageId(8), 2);
        node.next_node = PageAddress::new(PageId(6), 0);
        node.prev[0] = PageAddress::new(PageId(4), 0);
        node.next[2] = PageAddress::new(PageId(4), 1);
        page.nodes.insert(0, node.clone());

        let raw = serialize_page(&page).unwrap();
        let decoded: IndexPage = deserialize_page(&raw).unwrap();

        let got = decoded.get_node(0).unwrap();
        assert_eq!(got.levels(), 3);
        assert_eq!(got.key, Value::String("ada".into()));
        assert_eq!(got.data_block, PageAddress::new(PageId(8), 2));
        assert_eq!(got.next_node, PageAddress::new(PageId(6), 0));
        assert_eq!(got.prev[0], PageAddress::new(PageId(4), 0));
        assert_eq!(got.next[2], PageAddress::new(PageId(4), 1));
        assert!(got.next[0].is_empty());
    }

    #[test]
    fn test_slot_reuse_picks_lowest_gap() {
        let mut page = IndexPage::new(PageId(5));
        for slot in [0u16, 1, 3] {
            page.nodes.insert(
                slot,
                IndexNode::new(PageAddress::new(PageId(5), slot), 0, 1, Value::Int32(1)),
            );
        }
        assert_eq!(page.next_free_slot(), 2);
        page.nodes.remove(&0);
        assert_eq!(page.next_free_slot(), 0);
    }

    #[test]
    fn test_free_bytes_accounting() {
        let mut page = IndexPage::new(PageId(5));
        let before = page.free_bytes();

        let node = IndexNode::new(PageAddress::new(PageId(5), 0), 0, 2, Value::Int32(7));
        let size = node.serialized_size();
        page.nodes.insert(0, node);

        assert_eq!(page.free_bytes(), before - size as u16);
    }

    #[test]
    fn test_max_node_fits_in_page() {
        // A full-height node with the largest allowed key must fit a page
        // together with the slot-count prefix.
        assert!(MAX_NODE_SIZE + 2 <= PAGE_AVAILABLE_BYTES);
    }
}
