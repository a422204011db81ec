//! Binary layout shared by the four storage files of a container.
//!
//! Every file starts with the same header:
//!
//! ```text
//! magic       [u8; 4]   "FLGS"
//! version     u32
//! file_type   u8
//! container   u32 length + utf8 bytes
//! file_size   u32       total length of the file
//! num_entries u32
//! ```
//!
//! Map files follow it with `bucket_offset: u32, node_offset: u32`, value and
//! info files with `value_offset: u32`. All integers are little-endian.

use sha1::{Digest, Sha1};

use crate::error::StorageError;

pub const MAGIC: [u8; 4] = *b"FLGS";
pub const FILE_VERSION: u32 = 1;

/// Marks an empty bucket or the end of a node chain.
pub const NO_OFFSET: u32 = u32::MAX;

const BUCKET_PRIMES: [u32; 20] = [
    7, 17, 29, 53, 97, 193, 389, 769, 1543, 3079, 6151, 12289, 24593, 49157, 98317, 196613,
    393241, 786433, 1572869, 3145739,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    PackageMap = 0,
    FlagMap = 1,
    FlagVal = 2,
    FlagInfo = 3,
}

impl TryFrom<u8> for FileType {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FileType::PackageMap),
            1 => Ok(FileType::FlagMap),
            2 => Ok(FileType::FlagVal),
            3 => Ok(FileType::FlagInfo),
            other => Err(StorageError::Malformed(format!("unknown file type {}", other))),
        }
    }
}

/// How a flag is stored, which also decides whether it may be overridden locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StoredFlagType {
    ReadWriteBoolean = 0,
    ReadOnlyBoolean = 1,
    FixedReadOnlyBoolean = 2,
}

impl StoredFlagType {
    pub fn is_readwrite(&self) -> bool {
        matches!(self, StoredFlagType::ReadWriteBoolean)
    }
}

impl TryFrom<u16> for StoredFlagType {
    type Error = StorageError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StoredFlagType::ReadWriteBoolean),
            1 => Ok(StoredFlagType::ReadOnlyBoolean),
            2 => Ok(StoredFlagType::FixedReadOnlyBoolean),
            other => Err(StorageError::Malformed(format!("unknown flag type {}", other))),
        }
    }
}

/// Parsed common header. Borrowed from the mapped bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader<'a> {
    pub version: u32,
    pub file_type: FileType,
    pub container: &'a str,
    pub file_size: u32,
    pub num_entries: u32,
    /// Offset of the first byte after the common header.
    pub end: usize,
}

impl<'a> FileHeader<'a> {
    /// Parses and validates the header of `buf`, which must be a file of `expected` type.
    pub fn parse(buf: &'a [u8], expected: FileType) -> Result<Self, StorageError> {
        let mut reader = ByteReader::new(buf, 0);
        let magic = reader.read_bytes(4)?;
        if magic != MAGIC {
            return Err(StorageError::Malformed(format!("bad magic {:02x?}", magic)));
        }
        let version = reader.read_u32()?;
        if version != FILE_VERSION {
            return Err(StorageError::UnsupportedVersion {
                path: String::new(),
                version,
            });
        }
        let file_type = FileType::try_from(reader.read_u8()?)?;
        if file_type != expected {
            return Err(StorageError::Malformed(format!(
                "expected {:?} file, found {:?}",
                expected, file_type
            )));
        }
        let container = reader.read_str()?;
        let file_size = reader.read_u32()?;
        if file_size as usize != buf.len() {
            return Err(StorageError::Malformed(format!(
                "file size {} in header does not match {} mapped bytes",
                file_size,
                buf.len()
            )));
        }
        let num_entries = reader.read_u32()?;
        Ok(FileHeader {
            version,
            file_type,
            container,
            file_size,
            num_entries,
            end: reader.position(),
        })
    }
}

/// Bounds-checked little-endian cursor over a mapped file.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], StorageError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                StorageError::Malformed(format!(
                    "read of {} bytes at offset {} past end of file ({} bytes)",
                    len,
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, StorageError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, StorageError> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.read_bytes(2)?);
        Ok(u16::from_le_bytes(raw))
    }

    pub fn read_u32(&mut self) -> Result<u32, StorageError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.read_bytes(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn read_u64(&mut self) -> Result<u64, StorageError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read_bytes(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_str(&mut self) -> Result<&'a str, StorageError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map_err(|e| StorageError::Malformed(format!("invalid utf8 string: {}", e)))
    }
}

pub(crate) fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_str(out: &mut Vec<u8>, value: &str) {
    put_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}

/// Writes a common header with a zero file size; patch it with [`patch_file_size`].
pub(crate) fn put_header(out: &mut Vec<u8>, file_type: FileType, container: &str, entries: u32) {
    out.extend_from_slice(&MAGIC);
    put_u32(out, FILE_VERSION);
    out.push(file_type as u8);
    put_str(out, container);
    put_u32(out, 0);
    put_u32(out, entries);
}

pub(crate) fn patch_file_size(out: &mut [u8], container: &str) {
    let at = 4 + 4 + 1 + 4 + container.len();
    let size = (out.len() as u32).to_le_bytes();
    out[at..at + 4].copy_from_slice(&size);
}

/// Length of the common header for a given container name.
pub(crate) fn header_len(container: &str) -> usize {
    4 + 4 + 1 + 4 + container.len() + 4 + 4
}

/// First eight bytes of the SHA-1 of the concatenated parts.
pub fn sha1_u64(parts: &[&[u8]]) -> u64 {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(raw)
}

pub fn package_bucket(package: &str, num_buckets: u32) -> u32 {
    (sha1_u64(&[package.as_bytes()]) % num_buckets as u64) as u32
}

pub fn flag_bucket(package_id: u32, flag: &str, num_buckets: u32) -> u32 {
    (sha1_u64(&[&package_id.to_le_bytes(), flag.as_bytes()]) % num_buckets as u64) as u32
}

/// Smallest table size from the prime list that keeps the load factor at or below 0.5.
pub fn bucket_count(entries: usize) -> u32 {
    let wanted = (entries as u64).saturating_mul(2);
    BUCKET_PRIMES
        .iter()
        .copied()
        .find(|p| *p as u64 >= wanted)
        .unwrap_or(BUCKET_PRIMES[BUCKET_PRIMES.len() - 1])
}

/// Default package fingerprint: hash over the sorted flag names.
pub fn package_fingerprint<'a>(flag_names: impl IntoIterator<Item = &'a str>) -> u64 {
    let mut names: Vec<&str> = flag_names.into_iter().collect();
    names.sort_unstable();
    let joined = names.join("\n");
    sha1_u64(&[joined.as_bytes()])
}
