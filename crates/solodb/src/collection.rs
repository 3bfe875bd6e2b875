//! Collection management: the header directory and per-collection pages.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use solodb_common::{Result, SoloError};

use crate::data::DataService;
use crate::index::{IndexService, Order};
use crate::storage::{
    CollectionPage, PagerService, TypedPage, MAX_COLLECTIONS, MAX_COLLECTION_NAME, PK_INDEX_NAME,
};

/// Collection directory operations.
pub struct CollectionService<'a> {
    pager: &'a PagerService,
    rng: &'a Mutex<StdRng>,
}

impl<'a> CollectionService<'a> {
    pub fn new(pager: &'a PagerService, rng: &'a Mutex<StdRng>) -> Self {
        Self { pager, rng }
    }

    /// Collection names must be short, start with a letter or underscore,
    /// and stick to `[A-Za-z0-9_$-]`.
    pub fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name.len() <= MAX_COLLECTION_NAME
            && name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '$'));

        if valid {
            Ok(())
        } else {
            Err(SoloError::InvalidName(name.to_string()))
        }
    }

    /// Look up a collection's page.
    pub fn get(&self, name: &str) -> Result<Option<CollectionPage>> {
        let header = self.pager.header()?;
        match header.collections.get(name) {
            Some(page_id) => Ok(Some(self.pager.get_page(*page_id)?)),
            None => Ok(None),
        }
    }

    /// Look up a collection, creating it (with its `_id` primary key) on
    /// first use.
    pub fn get_or_create(&self, name: &str) -> Result<CollectionPage> {
        if let Some(col) = self.get(name)? {
            return Ok(col);
        }
        self.create(name)
    }

    fn create(&self, name: &str) -> Result<CollectionPage> {
        Self::validate_name(name)?;

        let header = self.pager.header()?;
        if header.collections.len() >= MAX_COLLECTIONS
            || (header.free_bytes() as usize) < name.len() + 1 + 4
        {
            return Err(SoloError::CollectionLimit);
        }

        let mut col: CollectionPage = self.pager.new_page()?;
        col.name = name.to_string();

        let index_service = IndexService::new(self.pager, self.rng);
        index_service.create_index(&mut col, PK_INDEX_NAME, "_id", true)?;
        self.pager.save(col.clone())?;

        // new_page dirtied the header; reload before adding the entry
        let mut header = self.pager.header()?;
        header.collections.insert(name.to_string(), col.page_id());
        self.pager.save(header)?;

        tracing::info!(collection = name, "collection created");
        Ok(col)
    }

    /// Persist a mutated collection page.
    pub fn save(&self, col: &CollectionPage) -> Result<()> {
        self.pager.save(col.clone())
    }

    /// All collection names in the directory.
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self.pager.header()?.collections.keys().cloned().collect())
    }

    /// Drop a collection: release every data, extend, index and metadata
    /// page it owns and remove it from the directory.
    pub fn drop(&self, name: &str) -> Result<bool> {
        let Some(mut col) = self.get(name)? else {
            return Ok(false);
        };

        let index_service = IndexService::new(self.pager, self.rng);
        let data_service = DataService::new(self.pager);

        // Document payloads first, walking the primary key
        let pk = col.pk_index()?.clone();
        let mut cur = index_service.first(&pk, Order::Ascending)?;
        while let Some(node) = cur {
            cur = index_service.sibling(&node, Order::Ascending)?;
            data_service.delete(&mut col, node.data_block)?;
        }

        // Then every index page, sentinels included. Nodes of one index can
        // revisit a page, so collect the distinct set before deleting.
        let mut pages = std::collections::BTreeSet::new();
        for index in col.indexes.values() {
            let mut cur = index.head;
            while !cur.is_empty() {
                pages.insert(cur.page_id);
                cur = index_service.get_node(cur)?.next[0];
            }
        }
        for page_id in pages {
            col.free_index_page_id = self
                .pager
                .free_list_remove(col.free_index_page_id, page_id)?;
            self.pager.delete_page(page_id, false)?;
        }

        self.pager.delete_page(col.page_id(), false)?;

        let mut header = self.pager.header()?;
        header.collections.remove(name);
        self.pager.save(header)?;

        tracing::info!(collection = name, "collection dropped");
        Ok(true)
    }

    /// Rename a collection in the directory (its pages stay where they are).
    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<bool> {
        Self::validate_name(new_name)?;

        let mut header = self.pager.header()?;
        if header.collections.contains_key(new_name) {
            return Err(SoloError::InvalidOperation(format!(
                "collection \"{new_name}\" already exists"
            )));
        }
        let Some(page_id) = header.collections.remove(old_name) else {
            return Ok(false);
        };
        header.collections.insert(new_name.to_string(), page_id);
        self.pager.save(header)?;

        let mut col: CollectionPage = self.pager.get_page(page_id)?;
        col.name = new_name.to_string();
        self.pager.save(col)?;

        Ok(true)
    }
}
