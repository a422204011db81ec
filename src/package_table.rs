use crate::error::StorageError;
use crate::format::{package_bucket, ByteReader, FileHeader, FileType, NO_OFFSET};

/// Location of a package's flags inside its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageInfo {
    pub package_id: u32,
    pub boolean_start_index: u32,
    pub fingerprint: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageNode<'a> {
    pub name: &'a str,
    pub info: PackageInfo,
    pub next_offset: u32,
}

impl<'a> PackageNode<'a> {
    fn read(buf: &'a [u8], offset: usize) -> Result<(Self, usize), StorageError> {
        let mut reader = ByteReader::new(buf, offset);
        let name = reader.read_str()?;
        let package_id = reader.read_u32()?;
        let fingerprint = reader.read_u64()?;
        let boolean_start_index = reader.read_u32()?;
        let next_offset = reader.read_u32()?;
        let node = PackageNode {
            name,
            info: PackageInfo {
                package_id,
                boolean_start_index,
                fingerprint,
            },
            next_offset,
        };
        Ok((node, reader.position()))
    }
}

/// Table offsets read from the header once per mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapLayout {
    pub num_entries: u32,
    pub bucket_offset: u32,
    pub num_buckets: u32,
    pub node_offset: u32,
}

impl MapLayout {
    pub(crate) fn parse(buf: &[u8], file_type: FileType) -> Result<(Self, &str), StorageError> {
        let header = FileHeader::parse(buf, file_type)?;
        let mut reader = ByteReader::new(buf, header.end);
        let bucket_offset = reader.read_u32()?;
        let node_offset = reader.read_u32()?;
        if bucket_offset as usize != reader.position()
            || node_offset < bucket_offset
            || (node_offset - bucket_offset) % 4 != 0
            || node_offset as usize > buf.len()
        {
            return Err(StorageError::Malformed(format!(
                "invalid table offsets: buckets at {}, nodes at {}",
                bucket_offset, node_offset
            )));
        }
        let num_buckets = (node_offset - bucket_offset) / 4;
        if num_buckets == 0 {
            return Err(StorageError::Malformed("hash table has no buckets".into()));
        }
        let layout = MapLayout {
            num_entries: header.num_entries,
            bucket_offset,
            num_buckets,
            node_offset,
        };
        Ok((layout, header.container))
    }

    pub(crate) fn bucket_head(&self, buf: &[u8], bucket: u32) -> Result<u32, StorageError> {
        ByteReader::new(buf, (self.bucket_offset + bucket * 4) as usize).read_u32()
    }
}

/// Package-name lookup over a mapped package map file.
#[derive(Debug, Clone, Copy)]
pub struct PackageTable<'a> {
    buf: &'a [u8],
    container: &'a str,
    layout: MapLayout,
}

impl<'a> PackageTable<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, StorageError> {
        let (layout, container) = MapLayout::parse(buf, FileType::PackageMap)?;
        Ok(Self {
            buf,
            container,
            layout,
        })
    }

    pub fn container(&self) -> &'a str {
        self.container
    }

    pub fn num_packages(&self) -> u32 {
        self.layout.num_entries
    }

    /// Returns `Ok(None)` when the package is absent.
    pub fn find(&self, package: &str) -> Result<Option<PackageInfo>, StorageError> {
        let bucket = package_bucket(package, self.layout.num_buckets);
        let mut offset = self.layout.bucket_head(self.buf, bucket)?;
        // a chain can never be longer than the table
        let mut remaining = self.layout.num_entries;
        while offset != NO_OFFSET {
            if remaining == 0 {
                return Err(StorageError::Malformed(
                    "package hash chain does not terminate".into(),
                ));
            }
            remaining -= 1;
            let (node, _) = PackageNode::read(self.buf, offset as usize)?;
            if node.name == package {
                return Ok(Some(node.info));
            }
            offset = node.next_offset;
        }
        Ok(None)
    }

    /// Walks every package node in file order.
    pub fn iter(&self) -> PackageIter<'a> {
        PackageIter {
            buf: self.buf,
            offset: self.layout.node_offset as usize,
            remaining: self.layout.num_entries,
        }
    }
}

pub struct PackageIter<'a> {
    buf: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> Iterator for PackageIter<'a> {
    type Item = Result<PackageNode<'a>, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match PackageNode::read(self.buf, self.offset) {
            Ok((node, end)) => {
                self.offset = end;
                Some(Ok(node))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}
