//! Error definitions for SoloDB

use thiserror::Error;

/// Represents errors that can occur during SoloDB operations.
///
/// Three broad classes share this enum: user/request errors (duplicate keys,
/// invalid names, oversized documents) that leave the database intact,
/// environment errors (wrong password, lock timeouts, unsupported files),
/// and corruption errors that indicate a damaged data file or an engine bug.
#[derive(Error, Debug, Clone)]
pub enum SoloError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Data file corrupted: {0}")]
    Corrupted(String),

    #[error("Duplicate key in unique index \"{index}\": {key}")]
    DuplicateKey { index: String, key: String },

    #[error("Invalid name: \"{0}\"")]
    InvalidName(String),

    #[error("Invalid _id value: {0}")]
    InvalidId(String),

    #[error("Document size {size} exceeds the maximum of {max} bytes")]
    DocumentTooLarge { size: usize, max: usize },

    #[error("Index key size {size} exceeds the maximum of {max} bytes")]
    IndexKeyTooLarge { size: usize, max: usize },

    #[error("Collection \"{0}\" already has the maximum number of indexes")]
    IndexLimit(String),

    #[error("Database already has the maximum number of collections")]
    CollectionLimit,

    #[error("Collection \"{0}\" not found")]
    CollectionNotFound(String),

    #[error("Index \"{0}\" not found")]
    IndexNotFound(String),

    #[error("Invalid database password")]
    WrongPassword,

    #[error("Unsupported data file version: {0}")]
    UnsupportedVersion(u8),

    #[error("Timeout waiting for database lock after {0:?}")]
    LockTimeout(std::time::Duration),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Database is read-only")]
    ReadOnly,
}

pub type Result<T> = std::result::Result<T, SoloError>;

impl SoloError {
    /// Get a short error kind name
    pub fn kind(&self) -> &'static str {
        match self {
            SoloError::Io(_) => "io_error",
            SoloError::Storage(_) => "storage_error",
            SoloError::Parse(_) => "parse_error",
            SoloError::Corrupted(_) => "corrupted",
            SoloError::DuplicateKey { .. } => "duplicate_key",
            SoloError::InvalidName(_) => "invalid_name",
            SoloError::InvalidId(_) => "invalid_id",
            SoloError::DocumentTooLarge { .. } => "document_too_large",
            SoloError::IndexKeyTooLarge { .. } => "index_key_too_large",
            SoloError::IndexLimit(_) => "index_limit",
            SoloError::CollectionLimit => "collection_limit",
            SoloError::CollectionNotFound(_) => "collection_not_found",
            SoloError::IndexNotFound(_) => "index_not_found",
            SoloError::WrongPassword => "wrong_password",
            SoloError::UnsupportedVersion(_) => "unsupported_version",
            SoloError::LockTimeout(_) => "lock_timeout",
            SoloError::Transaction(_) => "transaction_error",
            SoloError::InvalidOperation(_) => "invalid_operation",
            SoloError::ReadOnly => "read_only",
        }
    }

    /// True when the error indicates a damaged data file rather than a bad
    /// request; callers should stop using the file and run a repair.
    pub fn is_corruption(&self) -> bool {
        matches!(self, SoloError::Corrupted(_))
    }
}

/// Convert std::io::Error to SoloError
///
/// Shortcut as it's a common error we need
/// to convert from.
impl From<std::io::Error> for SoloError {
    fn from(err: std::io::Error) -> Self {
        SoloError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = SoloError::DuplicateKey {
            index: "email".into(),
            key: "\"a@x.com\"".into(),
        };
        assert_eq!(
            err.to_string(),
            "Duplicate key in unique index \"email\": \"a@x.com\""
        );
        assert_eq!(err.kind(), "duplicate_key");
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: SoloError = io_err.into();
        assert_eq!(err.kind(), "io_error");
    }
}
