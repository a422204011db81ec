use crate::error::StorageError;
use crate::format::{ByteReader, FileHeader, FileType};

/// Parses a value or info file header and returns the container name and the entry bytes.
pub(crate) fn parse_entries(
    buf: &[u8],
    file_type: FileType,
) -> Result<(&str, &[u8]), StorageError> {
    let header = FileHeader::parse(buf, file_type)?;
    let mut reader = ByteReader::new(buf, header.end);
    let value_offset = reader.read_u32()?;
    if value_offset as usize != reader.position() {
        return Err(StorageError::Malformed(format!(
            "invalid value offset {}",
            value_offset
        )));
    }
    let entries = reader.read_bytes(header.num_entries as usize)?;
    if reader.position() != buf.len() {
        return Err(StorageError::Malformed(format!(
            "{} trailing bytes after values",
            buf.len() - reader.position()
        )));
    }
    Ok((header.container, entries))
}

/// One boolean per byte, addressed by `boolean_start_index + flag_index`.
#[derive(Debug, Clone, Copy)]
pub struct FlagValueList<'a> {
    container: &'a str,
    values: &'a [u8],
}

impl<'a> FlagValueList<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, StorageError> {
        let (container, values) = parse_entries(buf, FileType::FlagVal)?;
        Ok(Self { container, values })
    }

    pub fn container(&self) -> &'a str {
        self.container
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, offset: u32) -> Result<bool, StorageError> {
        match self.values.get(offset as usize) {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            Some(other) => Err(StorageError::Malformed(format!(
                "invalid boolean byte {} at offset {}",
                other, offset
            ))),
            None => Err(StorageError::Malformed(format!(
                "flag value offset {} out of range ({} values)",
                offset,
                self.values.len()
            ))),
        }
    }
}
