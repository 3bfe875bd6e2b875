//! SoloDB - embedded single-file document database engine
//!
//! Documents live in named collections inside one growable paged file.
//! Every collection has a unique `_id` primary key and optional secondary
//! indexes, all stored as on-disk skip lists. Commits are crash-safe
//! through an undo journal, writers are serialized against concurrent
//! readers, and declarative queries run as cost-optimized index pipelines.
//!
//! ```no_run
//! use solodb::{Query, SoloDb};
//! use solodb_common::doc;
//!
//! let db = SoloDb::open("app.db")?;
//! db.ensure_index("users", "email", true)?;
//! db.insert("users", doc! { "_id" => 1, "email" => "a@x.com" })?;
//!
//! for doc in db.find("users", Query::eq("email", "a@x.com"))? {
//!     println!("{}", doc?);
//! }
//! # solodb_common::Result::Ok(())
//! ```

pub mod collection;
pub mod data;
pub mod engine;
pub mod index;
pub mod query;
pub mod storage;

// Re-export the public surface at the crate root
pub use engine::{DatabaseStats, Engine, EngineOptions, IndexInfo, SoloDb};
pub use index::Order;
pub use query::{FindCursor, FindOptions, Query};
pub use solodb_common::{doc, Document, ObjectId, Result, SoloError, Value};
pub use storage::Cipher;
