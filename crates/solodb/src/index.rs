//! Index service: one on-disk skip list per index.
//!
//! Every index owns a Head (MinValue) and Tail (MaxValue) sentinel node,
//! created with the index, full height, and linked to each other on every
//! level. Real nodes get a geometric height from an injected RNG and sit
//! between the sentinels in key order. All node references are
//! [`PageAddress`] handles; every mutation loads a fresh copy of the owning
//! page, applies the change and saves it back.
//!
//! The index nodes of one document form a second, singly-linked chain
//! through `next_node`, kept in ascending index-slot order; deleting a
//! document walks this chain to drop every index entry it owns.

use std::cmp::Ordering as CmpOrdering;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::RngCore;
use solodb_common::{Result, SoloError, Value};

use crate::storage::{
    CollectionIndex, CollectionPage, IndexNode, IndexPage, PageAddress, PagerService, TypedPage,
    MAX_INDEX_KEY_SIZE, MAX_INDEX_LEVELS, MAX_NODE_SIZE,
};

/// Scan direction over an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// Index pages with at least this much spare room stay in the collection's
/// free list; the head of the list can then always take any node.
pub const INDEX_FREE_LIST_MIN: usize = MAX_NODE_SIZE;

/// Skip-list operations over a collection's indexes.
pub struct IndexService<'a> {
    pager: &'a PagerService,
    rng: &'a Mutex<StdRng>,
}

impl<'a> IndexService<'a> {
    pub fn new(pager: &'a PagerService, rng: &'a Mutex<StdRng>) -> Self {
        Self { pager, rng }
    }

    /// Draw a node height: 1 plus the number of consecutive set low bits of
    /// a random word, capped at [`MAX_INDEX_LEVELS`]. Expected fan-out 1/2
    /// per level.
    pub fn flip(&self) -> u8 {
        let mut r = self.rng.lock().next_u32();
        let mut levels = 1u8;
        while r & 1 == 1 && (levels as usize) < MAX_INDEX_LEVELS {
            levels += 1;
            r >>= 1;
        }
        levels
    }

    /// Create a new index on the collection: claims a slot and builds the
    /// sentinel pair. The caller persists the collection page.
    pub fn create_index(
        &self,
        col: &mut CollectionPage,
        name: &str,
        field: &str,
        unique: bool,
    ) -> Result<CollectionIndex> {
        let slot = col
            .next_index_slot()
            .ok_or_else(|| SoloError::IndexLimit(col.name.clone()))?;

        let head_size = IndexNode::size_for(MAX_INDEX_LEVELS as u8, Value::MinValue.encoded_len());
        let tail_size = IndexNode::size_for(MAX_INDEX_LEVELS as u8, Value::MaxValue.encoded_len());

        let mut page: IndexPage = self
            .pager
            .get_free_page(col.free_index_page_id, head_size + tail_size)?;

        let head_slot = page.next_free_slot();
        let head_addr = PageAddress::new(page.page_id(), head_slot);
        let mut head = IndexNode::new(head_addr, slot, MAX_INDEX_LEVELS as u8, Value::MinValue);

        // Head and tail cannot share a slot; insert head before asking again
        page.nodes.insert(head_slot, head.clone());
        let tail_slot = page.next_free_slot();
        let tail_addr = PageAddress::new(page.page_id(), tail_slot);
        let mut tail = IndexNode::new(tail_addr, slot, MAX_INDEX_LEVELS as u8, Value::MaxValue);

        for level in 0..MAX_INDEX_LEVELS {
            head.next[level] = tail_addr;
            tail.prev[level] = head_addr;
        }
        page.nodes.insert(head_slot, head);
        page.nodes.insert(tail_slot, tail);
        self.pager.save(page.clone())?;

        col.free_index_page_id =
            self.pager
                .free_list_ensure(col.free_index_page_id, page.page_id(), INDEX_FREE_LIST_MIN)?;

        let index = CollectionIndex {
            slot,
            name: name.to_string(),
            field: field.to_string(),
            unique,
            head: head_addr,
            tail: tail_addr,
        };
        col.indexes.insert(slot, index.clone());

        tracing::debug!(collection = %col.name, index = name, field, unique, "index created");
        Ok(index)
    }

    /// Load a node by handle.
    pub fn get_node(&self, addr: PageAddress) -> Result<IndexNode> {
        let page: IndexPage = self.pager.get_page(addr.page_id)?;
        page.get_node(addr.slot).cloned()
    }

    /// Load, mutate and save a node in place.
    fn update_node(&self, addr: PageAddress, f: impl FnOnce(&mut IndexNode)) -> Result<()> {
        let mut page: IndexPage = self.pager.get_page(addr.page_id)?;
        let node = page.nodes.get_mut(&addr.slot).ok_or_else(|| {
            SoloError::Corrupted(format!("index node {addr} not found"))
        })?;
        f(node);
        self.pager.save(page)
    }

    /// Link a node into its document's chain after `prev`.
    pub fn set_next_node(&self, addr: PageAddress, target: PageAddress) -> Result<()> {
        self.update_node(addr, |n| n.next_node = target)
    }

    /// Insert a key into an index, returning the new node.
    ///
    /// Walks top-down from Head collecting the rightmost node before the
    /// key per level, then splices the new node in at every level below its
    /// drawn height. Unique indexes reject an equal key anywhere on the
    /// walk.
    pub fn add_node(
        &self,
        col: &mut CollectionPage,
        index: &CollectionIndex,
        key: Value,
        data_block: PageAddress,
    ) -> Result<IndexNode> {
        if key.is_sentinel() {
            return Err(SoloError::InvalidOperation(
                "MinValue/MaxValue cannot be used as index keys".into(),
            ));
        }
        let key_len = key.encoded_len();
        if key_len > MAX_INDEX_KEY_SIZE {
            return Err(SoloError::IndexKeyTooLarge {
                size: key_len,
                max: MAX_INDEX_KEY_SIZE,
            });
        }

        let levels = self.flip();

        // Collect, per level, the node we will insert after
        let mut update = [index.head; MAX_INDEX_LEVELS];
        let mut cur = self.get_node(index.head)?;
        for level in (0..MAX_INDEX_LEVELS).rev() {
            loop {
                let next_addr = cur.next[level];
                let next = self.get_node(next_addr)?;
                match next.key.compare(&key) {
                    CmpOrdering::Less => cur = next,
                    CmpOrdering::Equal => {
                        if index.unique {
                            return Err(SoloError::DuplicateKey {
                                index: index.name.clone(),
                                key: key.to_string(),
                            });
                        }
                        break;
                    }
                    CmpOrdering::Greater => break,
                }
            }
            update[level] = cur.position;
        }

        // Place the node
        let node_size = IndexNode::size_for(levels, key_len);
        let mut page: IndexPage = self.pager.get_free_page(col.free_index_page_id, node_size)?;
        let slot = page.next_free_slot();
        let addr = PageAddress::new(page.page_id(), slot);

        let mut node = IndexNode::new(addr, index.slot, levels, key);
        node.data_block = data_block;
        for level in 0..levels as usize {
            let prev = self.get_node(update[level])?;
            node.prev[level] = prev.position;
            node.next[level] = prev.next[level];
        }
        page.nodes.insert(slot, node.clone());
        self.pager.save(page)?;

        // Fix the neighbors
        for level in 0..levels as usize {
            self.update_node(node.prev[level], |n| n.next[level] = addr)?;
            self.update_node(node.next[level], |n| n.prev[level] = addr)?;
        }

        col.free_index_page_id =
            self.pager
                .free_list_ensure(col.free_index_page_id, addr.page_id, INDEX_FREE_LIST_MIN)?;

        Ok(node)
    }

    /// Find the node with `key`. With `sibling`, a missing key yields the
    /// nearest node in scan direction instead. Sentinels are never returned.
    pub fn find(
        &self,
        index: &CollectionIndex,
        key: &Value,
        sibling: bool,
        order: Order,
    ) -> Result<Option<IndexNode>> {
        let candidate = match order {
            Order::Ascending => {
                // Rightmost node strictly before the key, then one right
                let mut cur = self.get_node(index.head)?;
                for level in (0..MAX_INDEX_LEVELS).rev() {
                    loop {
                        let next = self.get_node(cur.next[level])?;
                        if next.key.compare(key) == CmpOrdering::Less {
                            cur = next;
                        } else {
                            break;
                        }
                    }
                }
                self.get_node(cur.next[0])?
            }
            Order::Descending => {
                let mut cur = self.get_node(index.tail)?;
                for level in (0..MAX_INDEX_LEVELS).rev() {
                    loop {
                        let prev = self.get_node(cur.prev[level])?;
                        if prev.key.compare(key) == CmpOrdering::Greater {
                            cur = prev;
                        } else {
                            break;
                        }
                    }
                }
                self.get_node(cur.prev[0])?
            }
        };

        if candidate.key.is_sentinel() {
            return Ok(None);
        }
        if candidate.key.compare(key) == CmpOrdering::Equal || sibling {
            Ok(Some(candidate))
        } else {
            Ok(None)
        }
    }

    /// First real node in scan order, if the index is not empty.
    pub fn first(&self, index: &CollectionIndex, order: Order) -> Result<Option<IndexNode>> {
        let node = match order {
            Order::Ascending => {
                let head = self.get_node(index.head)?;
                self.get_node(head.next[0])?
            }
            Order::Descending => {
                let tail = self.get_node(index.tail)?;
                self.get_node(tail.prev[0])?
            }
        };
        Ok((!node.key.is_sentinel()).then_some(node))
    }

    /// Level-0 successor in scan order, stopping before the sentinel.
    pub fn sibling(&self, node: &IndexNode, order: Order) -> Result<Option<IndexNode>> {
        let addr = match order {
            Order::Ascending => node.next[0],
            Order::Descending => node.prev[0],
        };
        let next = self.get_node(addr)?;
        Ok((!next.key.is_sentinel()).then_some(next))
    }

    /// Delete every index node of one document, walking its `next_node`
    /// chain from the primary-key node.
    pub fn delete_all(&self, col: &mut CollectionPage, pk_node: PageAddress) -> Result<()> {
        let mut cur = pk_node;
        while !cur.is_empty() {
            let next = self.get_node(cur)?.next_node;
            self.delete_node(col, cur)?;
            cur = next;
        }
        Ok(())
    }

    /// Classic skip-list removal: bypass the node on every level it
    /// occupies, then release its slot (and its page when it empties).
    ///
    /// Re-reads the node by address so earlier pointer fixups in the same
    /// operation are honored.
    pub fn delete_node(&self, col: &mut CollectionPage, addr: PageAddress) -> Result<()> {
        let node = self.get_node(addr)?;
        for level in 0..node.levels() as usize {
            let prev = node.prev[level];
            let next = node.next[level];
            self.update_node(prev, |n| n.next[level] = next)?;
            self.update_node(next, |n| n.prev[level] = prev)?;
        }

        let mut page: IndexPage = self.pager.get_page(node.position.page_id)?;
        page.nodes.remove(&node.position.slot);
        let emptied = page.nodes.is_empty();
        self.pager.save(page)?;

        if emptied {
            col.free_index_page_id = self
                .pager
                .free_list_remove(col.free_index_page_id, node.position.page_id)?;
            self.pager.delete_page(node.position.page_id, false)?;
        } else {
            col.free_index_page_id = self.pager.free_list_ensure(
                col.free_index_page_id,
                node.position.page_id,
                INDEX_FREE_LIST_MIN,
            )?;
        }
        Ok(())
    }

    /// Splice a freshly added node into its document's chain, keeping the
    /// chain in ascending index-slot order.
    pub fn chain_insert(&self, pk_node: PageAddress, new_node: &IndexNode) -> Result<()> {
        let mut prev = self.get_node(pk_node)?;
        loop {
            let next_addr = prev.next_node;
            if next_addr.is_empty() {
                break;
            }
            let next = self.get_node(next_addr)?;
            if next.index_slot > new_node.index_slot {
                break;
            }
            prev = next;
        }

        self.update_node(new_node.position, |n| n.next_node = prev.next_node)?;
        self.update_node(prev.position, |n| n.next_node = new_node.position)
    }

    /// Remove an entire index: unchain its nodes from every document and
    /// release every page it occupies (sentinels included). The caller
    /// removes the slot from the collection page and persists it.
    pub fn drop_index(&self, col: &mut CollectionPage, slot: u8) -> Result<()> {
        let index = col
            .indexes
            .get(&slot)
            .cloned()
            .ok_or_else(|| SoloError::Corrupted(format!("index slot {slot} not found")))?;
        let pk = col.pk_index()?.clone();

        // Unchain the dropped index's node from each document
        let mut pk_cur = self.first(&pk, Order::Ascending)?;
        while let Some(pk_node) = pk_cur {
            let mut prev_addr = pk_node.position;
            let mut chain = pk_node.next_node;
            while !chain.is_empty() {
                let chain_node = self.get_node(chain)?;
                let next = chain_node.next_node;
                if chain_node.index_slot == slot {
                    self.update_node(prev_addr, |n| n.next_node = next)?;
                } else {
                    prev_addr = chain_node.position;
                }
                chain = next;
            }
            pk_cur = self.sibling(&pk_node, Order::Ascending)?;
        }

        // Collect every node of the dropped index, sentinels included
        let mut addrs = Vec::new();
        let mut cur = index.head;
        while !cur.is_empty() {
            let node = self.get_node(cur)?;
            addrs.push(node.position);
            cur = node.next[0];
        }

        // Release slots page by page
        let mut by_page: std::collections::BTreeMap<_, Vec<u16>> = std::collections::BTreeMap::new();
        for addr in addrs {
            by_page.entry(addr.page_id).or_default().push(addr.slot);
        }
        for (page_id, slots) in by_page {
            let mut page: IndexPage = self.pager.get_page(page_id)?;
            for s in slots {
                page.nodes.remove(&s);
            }
            let emptied = page.nodes.is_empty();
            self.pager.save(page)?;

            col.free_index_page_id = if emptied {
                let head = self.pager.free_list_remove(col.free_index_page_id, page_id)?;
                self.pager.delete_page(page_id, false)?;
                head
            } else {
                self.pager
                    .free_list_ensure(col.free_index_page_id, page_id, INDEX_FREE_LIST_MIN)?
            };
        }

        col.indexes.remove(&slot);
        tracing::debug!(collection = %col.name, index = %index.name, "index dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::serialize_page;
    use crate::storage::{CollectionPage, DiskManager, HeaderPage, PageId};
    use rand::SeedableRng;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        pager: Arc<PagerService>,
        rng: Mutex<StdRng>,
        _dir: TempDir,
    }

    fn setup() -> (Fixture, CollectionPage, CollectionIndex) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let (disk, _) = DiskManager::open(&path, None).unwrap();
        disk.write_page(
            PageId::HEADER,
            &serialize_page(&HeaderPage::new(PageId::HEADER)).unwrap(),
        )
        .unwrap();

        let fixture = Fixture {
            pager: Arc::new(PagerService::new(Arc::new(disk), true)),
            rng: Mutex::new(StdRng::seed_from_u64(42)),
            _dir: dir,
        };

        let mut col: CollectionPage = fixture.pager.new_page().unwrap();
        col.name = "test".into();

        let service = IndexService::new(&fixture.pager, &fixture.rng);
        let index = service.create_index(&mut col, "key_1", "key", false).unwrap();
        fixture.pager.save(col.clone()).unwrap();

        (fixture, col, index)
    }

    fn collect_keys(service: &IndexService, index: &CollectionIndex, order: Order) -> Vec<Value> {
        let mut keys = Vec::new();
        let mut cur = service.first(index, order).unwrap();
        while let Some(node) = cur {
            keys.push(node.key.clone());
            cur = service.sibling(&node, order).unwrap();
        }
        keys
    }

    #[test]
    fn test_traversal_is_ordered_both_ways() {
        let (fx, mut col, index) = setup();
        let service = IndexService::new(&fx.pager, &fx.rng);

        for i in [5i32, 1, 9, 3, 7, 2, 8, 4, 6, 0] {
            service
                .add_node(&mut col, &index, Value::Int32(i), PageAddress::EMPTY)
                .unwrap();
        }

        let asc = collect_keys(&service, &index, Order::Ascending);
        let expected: Vec<Value> = (0..10).map(Value::Int32).collect();
        assert_eq!(asc, expected);

        let desc = collect_keys(&service, &index, Order::Descending);
        let expected: Vec<Value> = (0..10).rev().map(Value::Int32).collect();
        assert_eq!(desc, expected);
    }

    #[test]
    fn test_unique_index_rejects_duplicates() {
        let (fx, mut col, _) = setup();
        let service = IndexService::new(&fx.pager, &fx.rng);
        let unique = service
            .create_index(&mut col, "email_1", "email", true)
            .unwrap();

        service
            .add_node(&mut col, &unique, Value::from("a@x.com"), PageAddress::EMPTY)
            .unwrap();

        let before = collect_keys(&service, &unique, Order::Ascending).len();
        let err = service
            .add_node(&mut col, &unique, Value::from("a@x.com"), PageAddress::EMPTY)
            .unwrap_err();
        assert!(matches!(err, SoloError::DuplicateKey { .. }));

        // Index unchanged
        let after = collect_keys(&service, &unique, Order::Ascending).len();
        assert_eq!(before, after);
    }

    #[test]
    fn test_non_unique_allows_duplicates() {
        let (fx, mut col, index) = setup();
        let service = IndexService::new(&fx.pager, &fx.rng);

        for _ in 0..3 {
            service
                .add_node(&mut col, &index, Value::Int32(7), PageAddress::EMPTY)
                .unwrap();
        }
        assert_eq!(collect_keys(&service, &index, Order::Ascending).len(), 3);
    }

    #[test]
    fn test_find_exact_and_sibling() {
        let (fx, mut col, index) = setup();
        let service = IndexService::new(&fx.pager, &fx.rng);

        for i in [10i32, 20, 30] {
            service
                .add_node(&mut col, &index, Value::Int32(i), PageAddress::EMPTY)
                .unwrap();
        }

        let exact = service
            .find(&index, &Value::Int32(20), false, Order::Ascending)
            .unwrap()
            .unwrap();
        assert_eq!(exact.key, Value::Int32(20));

        // Missing key without sibling
        assert!(service
            .find(&index, &Value::Int32(15), false, Order::Ascending)
            .unwrap()
            .is_none());

        // Sibling ascending: next key after 15 is 20
        let next = service
            .find(&index, &Value::Int32(15), true, Order::Ascending)
            .unwrap()
            .unwrap();
        assert_eq!(next.key, Value::Int32(20));

        // Sibling descending: previous key before 15 is 10
        let prev = service
            .find(&index, &Value::Int32(15), true, Order::Descending)
            .unwrap()
            .unwrap();
        assert_eq!(prev.key, Value::Int32(10));

        // Beyond either end
        assert!(service
            .find(&index, &Value::Int32(99), true, Order::Ascending)
            .unwrap()
            .is_none());
        assert!(service
            .find(&index, &Value::Int32(-1), true, Order::Descending)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_delete_all_removes_document_chain() {
        let (fx, mut col, index) = setup();
        let service = IndexService::new(&fx.pager, &fx.rng);
        let second = service
            .create_index(&mut col, "name_1", "name", false)
            .unwrap();

        // One document with nodes in both indexes, chained
        let pk_node = service
            .add_node(&mut col, &index, Value::Int32(1), PageAddress::EMPTY)
            .unwrap();
        let name_node = service
            .add_node(&mut col, &second, Value::from("ada"), PageAddress::EMPTY)
            .unwrap();
        service.chain_insert(pk_node.position, &name_node).unwrap();

        // An unrelated document
        service
            .add_node(&mut col, &index, Value::Int32(2), PageAddress::EMPTY)
            .unwrap();

        service.delete_all(&mut col, pk_node.position).unwrap();

        assert_eq!(
            collect_keys(&service, &index, Order::Ascending),
            vec![Value::Int32(2)]
        );
        assert!(collect_keys(&service, &second, Order::Ascending).is_empty());
    }

    #[test]
    fn test_flip_is_deterministic_with_seeded_rng() {
        let (fx, _, _) = setup();
        let service = IndexService::new(&fx.pager, &fx.rng);

        // Sentinel creation draws no levels, so both sequences start fresh
        let a: Vec<u8> = (0..32).map(|_| service.flip()).collect();

        let rng2 = Mutex::new(StdRng::seed_from_u64(42));
        let service2 = IndexService::new(&fx.pager, &rng2);
        let b: Vec<u8> = (0..32).map(|_| service2.flip()).collect();

        assert_eq!(a, b);
        assert!(a.iter().all(|&l| (1..=MAX_INDEX_LEVELS as u8).contains(&l)));
    }

    #[test]
    fn test_drop_index_keeps_other_indexes() {
        let (fx, mut col, index) = setup();
        let service = IndexService::new(&fx.pager, &fx.rng);
        let second = service
            .create_index(&mut col, "name_1", "name", false)
            .unwrap();

        for (id, name) in [(1, "ada"), (2, "bob")] {
            let pk_node = service
                .add_node(&mut col, &index, Value::Int32(id), PageAddress::EMPTY)
                .unwrap();
            let name_node = service
                .add_node(&mut col, &second, Value::from(name), PageAddress::EMPTY)
                .unwrap();
            service.chain_insert(pk_node.position, &name_node).unwrap();
        }

        service.drop_index(&mut col, second.slot).unwrap();

        assert!(!col.indexes.contains_key(&second.slot));
        assert_eq!(collect_keys(&service, &index, Order::Ascending).len(), 2);

        // Chains no longer reference the dropped index
        let mut cur = service.first(&index, Order::Ascending).unwrap();
        while let Some(node) = cur {
            assert!(node.next_node.is_empty());
            cur = service.sibling(&node, Order::Ascending).unwrap();
        }
    }
}
