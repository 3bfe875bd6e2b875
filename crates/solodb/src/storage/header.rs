//! Header page: page 0 of every data file.
//!
//! Holds the file version, the commit counter used for cross-process change
//! detection, the empty-page free list head, the allocation high-water mark,
//! the optional password salt + hash, and the collection directory.

use std::collections::BTreeMap;

use rand::{rngs::OsRng, TryRngCore};
use sha1::{Digest, Sha1};
use solodb_common::{Result, SoloError};

use super::page::{
    CachedPage, PageBase, PageId, PageType, Serializable, TypedPage, PAGE_AVAILABLE_BYTES,
};

/// Current data file format version.
pub const FILE_VERSION: u8 = 1;

/// Maximum number of collections per database.
pub const MAX_COLLECTIONS: usize = 64;

/// Maximum collection name length in bytes.
pub const MAX_COLLECTION_NAME: usize = 60;

const SALT_SIZE: usize = 16;
const HASH_SIZE: usize = 20; // SHA-1

// version + change_id + free list head + last page + creation time
const FIXED_SIZE: usize = 1 + 2 + 4 + 4 + 8 + SALT_SIZE + HASH_SIZE + 1;

/// The header page (page 0).
#[derive(Debug, Clone)]
pub struct HeaderPage {
    pub base: PageBase,
    pub file_version: u8,
    /// Bumped (wrapping) on every commit that flushed dirty pages. Readers
    /// compare their cached value against disk to detect foreign commits.
    pub change_id: u16,
    /// Head of the empty-page free list.
    pub free_empty_page_id: PageId,
    /// Highest allocated page id; the file holds `last_page_id + 1` pages.
    pub last_page_id: PageId,
    /// Creation timestamp, microseconds since the epoch.
    pub creation_time: i64,
    pub salt: [u8; SALT_SIZE],
    pub password_hash: [u8; HASH_SIZE],
    /// Collection directory: name -> first collection page.
    pub collections: BTreeMap<String, PageId>,
}

impl HeaderPage {
    /// Bump the change counter, wrapping at `u16::MAX`.
    pub fn bump_change_id(&mut self) {
        self.change_id = self.change_id.wrapping_add(1);
    }

    /// True when the file was created with a password.
    pub fn has_password(&self) -> bool {
        self.password_hash != [0u8; HASH_SIZE]
    }

    /// Store the salted hash of a new password.
    pub fn set_password(&mut self, password: &str) -> Result<()> {
        let mut rng = OsRng;
        rng.try_fill_bytes(&mut self.salt)
            .map_err(|e| SoloError::Io(format!("entropy source failed: {e}")))?;
        self.password_hash = Self::hash_password(&self.salt, password);
        Ok(())
    }

    /// Check a password attempt against the stored hash.
    pub fn verify_password(&self, password: Option<&str>) -> Result<()> {
        if !self.has_password() {
            return Ok(());
        }
        match password {
            Some(p) if Self::hash_password(&self.salt, p) == self.password_hash => Ok(()),
            _ => Err(SoloError::WrongPassword),
        }
    }

    fn hash_password(salt: &[u8; SALT_SIZE], password: &str) -> [u8; HASH_SIZE] {
        let mut hasher = Sha1::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&digest);
        out
    }

    fn directory_size(&self) -> usize {
        self.collections
            .keys()
            .map(|name| 1 + name.len() + 4)
            .sum::<usize>()
    }
}

impl TypedPage for HeaderPage {
    const PAGE_TYPE: PageType = PageType::Header;

    fn new(page_id: PageId) -> Self {
        let creation_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);

        Self {
            base: PageBase::new(page_id),
            file_version: FILE_VERSION,
            change_id: 0,
            free_empty_page_id: PageId::INVALID,
            last_page_id: PageId(0),
            creation_time,
            salt: [0u8; SALT_SIZE],
            password_hash: [0u8; HASH_SIZE],
            collections: BTreeMap::new(),
        }
    }

    fn base(&self) -> &PageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut PageBase {
        &mut self.base
    }

    fn read_content(base: PageBase, body: &[u8]) -> Result<Self> {
        let file_version = body[0];
        if file_version != FILE_VERSION {
            return Err(SoloError::UnsupportedVersion(file_version));
        }

        let mut offset = 1;
        let (change_id, n) = u16::deserialize(&body[offset..])?;
        offset += n;
        let (free_empty_page_id, n) = PageId::deserialize(&body[offset..])?;
        offset += n;
        let (last_page_id, n) = PageId::deserialize(&body[offset..])?;
        offset += n;
        let (creation_time, n) = u64::deserialize(&body[offset..])?;
        offset += n;

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&body[offset..offset + SALT_SIZE]);
        offset += SALT_SIZE;
        let mut password_hash = [0u8; HASH_SIZE];
        password_hash.copy_from_slice(&body[offset..offset + HASH_SIZE]);
        offset += HASH_SIZE;

        let count = body[offset] as usize;
        offset += 1;
        let mut collections = BTreeMap::new();
        for _ in 0..count {
            let (name, n) = String::deserialize(&body[offset..])?;
            offset += n;
            let (page_id, n) = PageId::deserialize(&body[offset..])?;
            offset += n;
            collections.insert(name, page_id);
        }

        Ok(Self {
            base,
            file_version,
            change_id,
            free_empty_page_id,
            last_page_id,
            creation_time: creation_time as i64,
            salt,
            password_hash,
            collections,
        })
    }

    fn write_content(&self, body: &mut [u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(FIXED_SIZE + self.directory_size());

        buf.push(self.file_version);
        self.change_id.serialize(&mut buf);
        self.free_empty_page_id.serialize(&mut buf);
        self.last_page_id.serialize(&mut buf);
        (self.creation_time as u64).serialize(&mut buf);
        buf.extend_from_slice(&self.salt);
        buf.extend_from_slice(&self.password_hash);

        buf.push(self.collections.len() as u8);
        for (name, page_id) in &self.collections {
            name.serialize(&mut buf);
            page_id.serialize(&mut buf);
        }

        if buf.len() > body.len() {
            return Err(SoloError::Storage(
                "header page overflow: too many collections".into(),
            ));
        }
        body[..buf.len()].copy_from_slice(&buf);
        Ok(())
    }

    fn item_count(&self) -> u16 {
        self.collections.len() as u16
    }

    fn free_bytes(&self) -> u16 {
        (PAGE_AVAILABLE_BYTES - FIXED_SIZE - self.directory_size()) as u16
    }

    fn from_cached(page: CachedPage) -> Option<Self> {
        match page {
            CachedPage::Header(p) => Some(p),
            _ => None,
        }
    }
}

impl From<HeaderPage> for CachedPage {
    fn from(page: HeaderPage) -> Self {
        CachedPage::Header(page)
    }
}
