use crate::error::StorageError;
use crate::format::{flag_bucket, ByteReader, FileType, StoredFlagType, NO_OFFSET};
use crate::package_table::MapLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagEntry {
    pub flag_type: StoredFlagType,
    /// Position within the owning package's boolean run.
    pub flag_index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagNode<'a> {
    pub package_id: u32,
    pub name: &'a str,
    pub entry: FlagEntry,
    pub next_offset: u32,
}

impl<'a> FlagNode<'a> {
    fn read(buf: &'a [u8], offset: usize) -> Result<(Self, usize), StorageError> {
        let mut reader = ByteReader::new(buf, offset);
        let package_id = reader.read_u32()?;
        let name = reader.read_str()?;
        let flag_type = StoredFlagType::try_from(reader.read_u16()?)?;
        let flag_index = reader.read_u16()?;
        let next_offset = reader.read_u32()?;
        let node = FlagNode {
            package_id,
            name,
            entry: FlagEntry {
                flag_type,
                flag_index,
            },
            next_offset,
        };
        Ok((node, reader.position()))
    }
}

/// `(package id, flag name)` lookup over a mapped flag map file.
#[derive(Debug, Clone, Copy)]
pub struct FlagTable<'a> {
    buf: &'a [u8],
    container: &'a str,
    layout: MapLayout,
}

impl<'a> FlagTable<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, StorageError> {
        let (layout, container) = MapLayout::parse(buf, FileType::FlagMap)?;
        Ok(Self {
            buf,
            container,
            layout,
        })
    }

    pub fn container(&self) -> &'a str {
        self.container
    }

    pub fn num_flags(&self) -> u32 {
        self.layout.num_entries
    }

    pub fn find(&self, package_id: u32, flag: &str) -> Result<Option<FlagEntry>, StorageError> {
        let bucket = flag_bucket(package_id, flag, self.layout.num_buckets);
        let mut offset = self.layout.bucket_head(self.buf, bucket)?;
        let mut remaining = self.layout.num_entries;
        while offset != NO_OFFSET {
            if remaining == 0 {
                return Err(StorageError::Malformed(
                    "flag hash chain does not terminate".into(),
                ));
            }
            remaining -= 1;
            let (node, _) = FlagNode::read(self.buf, offset as usize)?;
            if node.package_id == package_id && node.name == flag {
                return Ok(Some(node.entry));
            }
            offset = node.next_offset;
        }
        Ok(None)
    }

    pub fn iter(&self) -> FlagIter<'a> {
        FlagIter {
            buf: self.buf,
            offset: self.layout.node_offset as usize,
            remaining: self.layout.num_entries,
        }
    }
}

pub struct FlagIter<'a> {
    buf: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> Iterator for FlagIter<'a> {
    type Item = Result<FlagNode<'a>, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match FlagNode::read(self.buf, self.offset) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::create_builder;

    #[test]
    fn test_find_flag() {
        let files = create_builder("system")
            .package("com.android.a")
            .flag("enabled", true, StoredFlagType::ReadWriteBoolean)
            .flag("disabled", false, StoredFlagType::ReadOnlyBoolean)
            .package("com.android.b")
            .flag("enabled", false, StoredFlagType::FixedReadOnlyBoolean)
            .build()
            .unwrap();
        let table = FlagTable::parse(&files.flag_map).unwrap();
        assert_eq!(table.num_flags(), 3);

        let entry = table.find(0, "disabled").unwrap().unwrap();
        assert_eq!(entry.flag_index, 1);
        assert_eq!(entry.flag_type, StoredFlagType::ReadOnlyBoolean);

        // same flag name in another package
        let entry = table.find(1, "enabled").unwrap().unwrap();
        assert_eq!(entry.flag_index, 0);
        assert_eq!(entry.flag_type, StoredFlagType::FixedReadOnlyBoolean);

        assert_eq!(table.find(1, "disabled").unwrap(), None);
        assert_eq!(table.find(7, "enabled").unwrap(), None);
    }

    #[test]
    fn test_many_flags_share_buckets() {
        let mut builder = create_builder("vendor").package("com.vendor.big");
        for i in 0..200 {
            builder = builder.flag(&format!("flag_{}", i), i % 2 == 0, StoredFlagType::ReadWriteBoolean);
        }
        let files = builder.build().unwrap();
        let table = FlagTable::parse(&files.flag_map).unwrap();
        for i in 0..200 {
            let entry = table.find(0, &format!("flag_{}", i)).unwrap().unwrap();
            assert_eq!(entry.flag_index, i as u16);
        }
        assert_eq!(table.iter().count(), 200);
    }

    #[test]
    fn test_iter_yields_package_ids() {
        let files = create_builder("system")
            .package("a")
            .flag("one", true, StoredFlagType::ReadWriteBoolean)
            .package("b")
            .flag("two", true, StoredFlagType::ReadWriteBoolean)
            .build()
            .unwrap();
        let table = FlagTable::parse(&files.flag_map).unwrap();
        let nodes: Vec<(u32, &str)> = table
            .iter()
            .map(|n| n.map(|n| (n.package_id, n.name)).unwrap())
            .collect();
        assert_eq!(nodes, vec![(0, "one"), (1, "two")]);
    }
}
