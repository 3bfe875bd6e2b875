//! Page structures for disk-based storage.
//!
//! Pages are 4KB units containing a 32-byte header and a typed body.
//! Every cross-reference between pages uses a [`PageAddress`] handle
//! resolved through the pager, never an in-memory pointer.

use solodb_common::{Result, SoloError};

// Page format constants

/// Page size in bytes (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Page header size in bytes (32 bytes).
pub const PAGE_HEADER_SIZE: usize = 32;

/// Usable body area in a page.
pub const PAGE_AVAILABLE_BYTES: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Magic number for page validation.
pub const PAGE_MAGIC: u32 = u32::from_be_bytes(*b"SOLO");

/// Raw on-disk page image.
pub type RawPage = [u8; PAGE_SIZE];

// Page identifiers

/// Unique identifier for a page (page 0 is reserved for the header page).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PageId(pub u32);

impl PageId {
    /// Invalid page ID sentinel value ("no page").
    pub const INVALID: PageId = PageId(u32::MAX);

    /// Header page (always page 0).
    pub const HEADER: PageId = PageId(0);

    /// Check if this is a valid page ID.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 != u32::MAX
    }

    /// Get the byte offset of this page in a file.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.0 as u64 * PAGE_SIZE as u64
    }
}

impl From<u32> for PageId {
    #[inline]
    fn from(id: u32) -> Self {
        PageId(id)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == PageId::INVALID {
            write!(f, "INVALID")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Stable handle to a slot inside a page: `(page id, slot index)`.
///
/// Index nodes, data blocks, free-list links and same-document chains all
/// reference each other through these handles; they stay valid across
/// cache eviction and reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageAddress {
    pub page_id: PageId,
    pub slot: u16,
}

impl PageAddress {
    /// "No address" sentinel value.
    pub const EMPTY: PageAddress = PageAddress {
        page_id: PageId::INVALID,
        slot: u16::MAX,
    };

    /// Serialized size in bytes.
    pub const SERIALIZED_SIZE: usize = 6;

    pub fn new(page_id: PageId, slot: u16) -> Self {
        Self { page_id, slot }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl std::fmt::Display for PageAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_id, self.slot)
    }
}

// Page Type

/// Type of page, stored in byte 4 of the page header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Empty = 0,
    Header = 1,
    Collection = 2,
    Index = 3,
    Data = 4,
    Extend = 5,
}

impl TryFrom<u8> for PageType {
    type Error = SoloError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageType::Empty),
            1 => Ok(PageType::Header),
            2 => Ok(PageType::Collection),
            3 => Ok(PageType::Index),
            4 => Ok(PageType::Data),
            5 => Ok(PageType::Extend),
            other => Err(SoloError::Corrupted(format!(
                "unknown page type tag: {other}"
            ))),
        }
    }
}

// Page base header

/// Fields common to every page, serialized into the 32-byte page header.
///
/// `prev_page_id`/`next_page_id` link pages into free lists and sequences;
/// `PageId::INVALID` means "none".
///
/// Header layout:
/// ```text
/// [00..04) magic       [04]     page type    [05]     reserved
/// [06..10) page id     [10..14) prev page    [14..18) next page
/// [18..20) item count  [20..22) free bytes   [22..28) reserved
/// [28..32) crc32 over the page with this field zeroed
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageBase {
    pub page_id: PageId,
    pub prev_page_id: PageId,
    pub next_page_id: PageId,
}

impl PageBase {
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            prev_page_id: PageId::INVALID,
            next_page_id: PageId::INVALID,
        }
    }
}

// Typed page contract

/// A parsed, typed view over a raw page.
///
/// Typed pages are value types: callers load a clone through the pager,
/// mutate the local copy, and save it back to the dirty set. They are never
/// aliased in place.
pub trait TypedPage: Clone + Into<CachedPage> {
    const PAGE_TYPE: PageType;

    /// Create an empty page of this type.
    fn new(page_id: PageId) -> Self;

    fn base(&self) -> &PageBase;

    fn base_mut(&mut self) -> &mut PageBase;

    /// Parse the body area. The page header has already been verified.
    fn read_content(base: PageBase, body: &[u8]) -> Result<Self>;

    /// Serialize the body area. `body` is zero-filled, `PAGE_AVAILABLE_BYTES`
    /// long.
    fn write_content(&self, body: &mut [u8]) -> Result<()>;

    /// Number of items (slots, entries) stored in the body.
    fn item_count(&self) -> u16;

    /// Free bytes left in the body, used for free-list ordering.
    fn free_bytes(&self) -> u16;

    /// Downcast from the cache's tagged representation.
    fn from_cached(page: CachedPage) -> Option<Self>;

    #[inline]
    fn page_id(&self) -> PageId {
        self.base().page_id
    }
}

// Page serialization driver

/// Serialize a typed page into its raw on-disk image.
pub fn serialize_page<T: TypedPage>(page: &T) -> Result<RawPage> {
    let mut buf = [0u8; PAGE_SIZE];
    let base = page.base();

    buf[0..4].copy_from_slice(&PAGE_MAGIC.to_le_bytes());
    buf[4] = T::PAGE_TYPE as u8;
    buf[6..10].copy_from_slice(&base.page_id.0.to_le_bytes());
    buf[10..14].copy_from_slice(&base.prev_page_id.0.to_le_bytes());
    buf[14..18].copy_from_slice(&base.next_page_id.0.to_le_bytes());
    buf[18..20].copy_from_slice(&page.item_count().to_le_bytes());
    buf[20..22].copy_from_slice(&page.free_bytes().to_le_bytes());

    page.write_content(&mut buf[PAGE_HEADER_SIZE..])?;

    let checksum = page_checksum(&buf);
    buf[28..32].copy_from_slice(&checksum.to_le_bytes());

    Ok(buf)
}

/// Parse and verify a raw page image into a typed page.
///
/// Fails with a corruption error when the magic, checksum or type tag does
/// not match.
pub fn deserialize_page<T: TypedPage>(buf: &RawPage) -> Result<T> {
    let (base, page_type) = verify_page(buf)?;

    if page_type != T::PAGE_TYPE {
        return Err(SoloError::Corrupted(format!(
            "page {} has type {:?}, expected {:?}",
            base.page_id,
            page_type,
            T::PAGE_TYPE
        )));
    }

    T::read_content(base, &buf[PAGE_HEADER_SIZE..])
}

/// Verify magic and checksum, returning the base header and type tag.
pub fn verify_page(buf: &RawPage) -> Result<(PageBase, PageType)> {
    let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if magic != PAGE_MAGIC {
        return Err(SoloError::Corrupted("invalid page magic number".into()));
    }

    let stored = u32::from_le_bytes(buf[28..32].try_into().unwrap());
    if stored != page_checksum(buf) {
        return Err(SoloError::Corrupted("page checksum mismatch".into()));
    }

    let page_type = PageType::try_from(buf[4])?;
    let base = PageBase {
        page_id: PageId(u32::from_le_bytes(buf[6..10].try_into().unwrap())),
        prev_page_id: PageId(u32::from_le_bytes(buf[10..14].try_into().unwrap())),
        next_page_id: PageId(u32::from_le_bytes(buf[14..18].try_into().unwrap())),
    };

    Ok((base, page_type))
}

/// CRC32 over the full page with the checksum field treated as zero.
fn page_checksum(buf: &RawPage) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[0..28]);
    hasher.update(&[0u8; 4]);
    hasher.update(&buf[32..]);
    hasher.finalize()
}

/// Read the page type tag from a raw image without full verification.
pub fn peek_page_type(buf: &RawPage) -> Result<PageType> {
    PageType::try_from(buf[4])
}

// Serialization trait for on-page structures

/// Trait for structures serialized into page bodies.
///
/// Little-endian, length-prefixed, variable-width encoding; `deserialize`
/// returns the value together with the number of bytes consumed.
pub trait Serializable: Sized {
    /// Serialize this value, appending bytes to the buffer.
    fn serialize(&self, buf: &mut Vec<u8>);

    /// Deserialize from bytes, returning (value, bytes_consumed).
    fn deserialize(buf: &[u8]) -> Result<(Self, usize)>;

    /// Get the serialized size in bytes without actually serializing.
    fn serialized_size(&self) -> usize;
}

impl Serializable for u16 {
    #[inline]
    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }

    #[inline]
    fn deserialize(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 2 {
            return Err(SoloError::Corrupted("insufficient bytes for u16".into()));
        }
        Ok((u16::from_le_bytes([buf[0], buf[1]]), 2))
    }

    #[inline]
    fn serialized_size(&self) -> usize {
        2
    }
}

impl Serializable for u32 {
    #[inline]
    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }

    #[inline]
    fn deserialize(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 4 {
            return Err(SoloError::Corrupted("insufficient bytes for u32".into()));
        }
        Ok((u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]), 4))
    }

    #[inline]
    fn serialized_size(&self) -> usize {
        4
    }
}

impl Serializable for u64 {
    #[inline]
    fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_le_bytes());
    }

    #[inline]
    fn deserialize(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 8 {
            return Err(SoloError::Corrupted("insufficient bytes for u64".into()));
        }
        Ok((
            u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            8,
        ))
    }

    #[inline]
    fn serialized_size(&self) -> usize {
        8
    }
}

impl Serializable for PageId {
    #[inline]
    fn serialize(&self, buf: &mut Vec<u8>) {
        self.0.serialize(buf);
    }

    #[inline]
    fn deserialize(buf: &[u8]) -> Result<(Self, usize)> {
        let (id, consumed) = u32::deserialize(buf)?;
        Ok((PageId(id), consumed))
    }

    #[inline]
    fn serialized_size(&self) -> usize {
        4
    }
}

impl Serializable for PageAddress {
    #[inline]
    fn serialize(&self, buf: &mut Vec<u8>) {
        self.page_id.serialize(buf);
        self.slot.serialize(buf);
    }

    #[inline]
    fn deserialize(buf: &[u8]) -> Result<(Self, usize)> {
        let (page_id, a) = PageId::deserialize(buf)?;
        let (slot, b) = u16::deserialize(&buf[a..])?;
        Ok((PageAddress { page_id, slot }, a + b))
    }

    #[inline]
    fn serialized_size(&self) -> usize {
        Self::SERIALIZED_SIZE
    }
}

/// Variable-length byte slice serialization with length prefix.
impl Serializable for Vec<u8> {
    fn serialize(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).serialize(buf);
        buf.extend_from_slice(self);
    }

    fn deserialize(buf: &[u8]) -> Result<(Self, usize)> {
        let (len, consumed) = u32::deserialize(buf)?;
        let len = len as usize;
        if buf.len() < consumed + len {
            return Err(SoloError::Corrupted(
                "insufficient bytes for byte slice".into(),
            ));
        }
        Ok((buf[consumed..consumed + len].to_vec(), consumed + len))
    }

    fn serialized_size(&self) -> usize {
        4 + self.len()
    }
}

/// Short strings (names) use a single-byte length prefix.
impl Serializable for String {
    fn serialize(&self, buf: &mut Vec<u8>) {
        debug_assert!(self.len() <= u8::MAX as usize);
        buf.push(self.len() as u8);
        buf.extend_from_slice(self.as_bytes());
    }

    fn deserialize(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.is_empty() {
            return Err(SoloError::Corrupted("insufficient bytes for string".into()));
        }
        let len = buf[0] as usize;
        if buf.len() < 1 + len {
            return Err(SoloError::Corrupted("insufficient bytes for string".into()));
        }
        let s = std::str::from_utf8(&buf[1..1 + len])
            .map_err(|e| SoloError::Corrupted(format!("invalid UTF-8 in name: {e}")))?;
        Ok((s.to_owned(), 1 + len))
    }

    fn serialized_size(&self) -> usize {
        1 + self.len()
    }
}

// Cached page representation

use super::collection_page::CollectionPage;
use super::data_page::{DataPage, ExtendPage};
use super::header::HeaderPage;
use super::index_page::IndexPage;

/// An unused page awaiting reuse through the header free list.
#[derive(Debug, Clone)]
pub struct EmptyPage {
    pub base: PageBase,
}

impl TypedPage for EmptyPage {
    const PAGE_TYPE: PageType = PageType::Empty;

    fn new(page_id: PageId) -> Self {
        Self {
            base: PageBase::new(page_id),
        }
    }

    fn base(&self) -> &PageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut PageBase {
        &mut self.base
    }

    fn read_content(base: PageBase, _body: &[u8]) -> Result<Self> {
        Ok(Self { base })
    }

    fn write_content(&self, _body: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn item_count(&self) -> u16 {
        0
    }

    fn free_bytes(&self) -> u16 {
        PAGE_AVAILABLE_BYTES as u16
    }

    fn from_cached(page: CachedPage) -> Option<Self> {
        match page {
            CachedPage::Empty(p) => Some(p),
            _ => None,
        }
    }
}

impl From<EmptyPage> for CachedPage {
    fn from(page: EmptyPage) -> Self {
        CachedPage::Empty(page)
    }
}

/// Tagged union of every typed page, as stored in the page cache.
#[derive(Debug, Clone)]
pub enum CachedPage {
    Header(HeaderPage),
    Collection(CollectionPage),
    Index(IndexPage),
    Data(DataPage),
    Extend(ExtendPage),
    Empty(EmptyPage),
}

impl CachedPage {
    pub fn page_id(&self) -> PageId {
        self.base().page_id
    }

    pub fn page_type(&self) -> PageType {
        match self {
            CachedPage::Header(_) => PageType::Header,
            CachedPage::Collection(_) => PageType::Collection,
            CachedPage::Index(_) => PageType::Index,
            CachedPage::Data(_) => PageType::Data,
            CachedPage::Extend(_) => PageType::Extend,
            CachedPage::Empty(_) => PageType::Empty,
        }
    }

    pub fn base(&self) -> &PageBase {
        match self {
            CachedPage::Header(p) => &p.base,
            CachedPage::Collection(p) => &p.base,
            CachedPage::Index(p) => &p.base,
            CachedPage::Data(p) => &p.base,
            CachedPage::Extend(p) => &p.base,
            CachedPage::Empty(p) => &p.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut PageBase {
        match self {
            CachedPage::Header(p) => &mut p.base,
            CachedPage::Collection(p) => &mut p.base,
            CachedPage::Index(p) => &mut p.base,
            CachedPage::Data(p) => &mut p.base,
            CachedPage::Extend(p) => &mut p.base,
            CachedPage::Empty(p) => &mut p.base,
        }
    }

    pub fn free_bytes(&self) -> u16 {
        match self {
            CachedPage::Header(p) => p.free_bytes(),
            CachedPage::Collection(p) => p.free_bytes(),
            CachedPage::Index(p) => p.free_bytes(),
            CachedPage::Data(p) => p.free_bytes(),
            CachedPage::Extend(p) => p.free_bytes(),
            CachedPage::Empty(p) => p.free_bytes(),
        }
    }

    /// Serialize to the raw on-disk image.
    pub fn to_raw(&self) -> Result<RawPage> {
        match self {
            CachedPage::Header(p) => serialize_page(p),
            CachedPage::Collection(p) => serialize_page(p),
            CachedPage::Index(p) => serialize_page(p),
            CachedPage::Data(p) => serialize_page(p),
            CachedPage::Extend(p) => serialize_page(p),
            CachedPage::Empty(p) => serialize_page(p),
        }
    }

    /// Parse a raw image into the typed page named by its type tag.
    pub fn from_raw(buf: &RawPage) -> Result<Self> {
        let (_, page_type) = verify_page(buf)?;
        Ok(match page_type {
            PageType::Header => CachedPage::Header(deserialize_page(buf)?),
            PageType::Collection => CachedPage::Collection(deserialize_page(buf)?),
            PageType::Index => CachedPage::Index(deserialize_page(buf)?),
            PageType::Data => CachedPage::Data(deserialize_page(buf)?),
            PageType::Extend => CachedPage::Extend(deserialize_page(buf)?),
            PageType::Empty => CachedPage::Empty(deserialize_page(buf)?),
        })
    }
}
