//! Storage engine: pages, cache, journal, locking and transactions.

pub mod cache;
pub mod collection_page;
pub mod data_page;
pub mod disk;
pub mod header;
pub mod index_page;
pub mod journal;
pub mod lock;
pub mod page;
pub mod pager;
pub mod transaction;

// Re-export core types
pub use cache::{CacheService, CACHE_CHECKPOINT_SIZE};
pub use collection_page::{CollectionIndex, CollectionPage, MAX_INDEXES, PK_INDEX_NAME, PK_SLOT};
pub use data_page::{
    DataBlock, DataPage, ExtendPage, BLOCK_FIXED_SIZE, EXTEND_PAGE_DATA, MAX_BLOCK_DATA,
};
pub use disk::{Cipher, DiskManager};
pub use header::{HeaderPage, FILE_VERSION, MAX_COLLECTIONS, MAX_COLLECTION_NAME};
pub use index_page::{IndexNode, IndexPage, MAX_INDEX_KEY_SIZE, MAX_INDEX_LEVELS, MAX_NODE_SIZE};
pub use journal::{recover, JournalShadow, Recovery};
pub use lock::{CrossProcessLock, LockService, DEFAULT_LOCK_TIMEOUT};
pub use page::{
    CachedPage, EmptyPage, PageAddress, PageBase, PageId, PageType, Serializable, TypedPage,
    PAGE_AVAILABLE_BYTES, PAGE_SIZE,
};
pub use pager::PagerService;
pub use transaction::TransactionService;
