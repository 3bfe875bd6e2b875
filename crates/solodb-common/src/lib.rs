//! Common library for SoloDB
//!
//! This crate provides the types shared by the storage engine and by the
//! layers that sit on top of it (shells, object mappers, import/export
//! tools). It defines the error taxonomy, the document value model with its
//! binary codec, and the document type itself.
//!
//! Modules:
//! * `error`: Defines error types and handling.
//! * `value`: Defines the ordered value model and its byte codec.
//! * `document`: Defines the document type stored in collections.

pub mod document;
pub mod error;
pub mod value;

// Re-export commonly used types at the base
pub use document::Document;
pub use error::{Result, SoloError};
pub use value::{ObjectId, Value, ValueType};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
