use crate::error::StorageError;
use crate::flag_value::parse_entries;
use crate::format::FileType;

pub const IS_READWRITE: u8 = 1;
pub const HAS_SERVER_OVERRIDE: u8 = 1 << 1;
pub const HAS_LOCAL_OVERRIDE: u8 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlagInfoBits(pub u8);

impl FlagInfoBits {
    pub fn new(is_readwrite: bool, has_server_override: bool, has_local_override: bool) -> Self {
        let mut bits = 0;
        if is_readwrite {
            bits |= IS_READWRITE;
        }
        if has_server_override {
            bits |= HAS_SERVER_OVERRIDE;
        }
        if has_local_override {
            bits |= HAS_LOCAL_OVERRIDE;
        }
        FlagInfoBits(bits)
    }

    pub fn is_readwrite(&self) -> bool {
        self.0 & IS_READWRITE != 0
    }

    pub fn has_server_override(&self) -> bool {
        self.0 & HAS_SERVER_OVERRIDE != 0
    }

    pub fn has_local_override(&self) -> bool {
        self.0 & HAS_LOCAL_OVERRIDE != 0
    }
}

/// Per-flag attribute bits, laid out in parallel with the value file.
#[derive(Debug, Clone, Copy)]
pub struct FlagInfoList<'a> {
    container: &'a str,
    infos: &'a [u8],
}

impl<'a> FlagInfoList<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, StorageError> {
        let (container, infos) = parse_entries(buf, FileType::FlagInfo)?;
        Ok(Self { container, infos })
    }

    pub fn container(&self) -> &'a str {
        self.container
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn get(&self, offset: u32) -> Result<FlagInfoBits, StorageError> {
        let bits = self.infos.get(offset as usize).ok_or_else(|| {
            StorageError::Malformed(format!(
                "flag info offset {} out of range ({} entries)",
                offset,
                self.infos.len()
            ))
        })?;
        if bits & !(IS_READWRITE | HAS_SERVER_OVERRIDE | HAS_LOCAL_OVERRIDE) != 0 {
            return Err(StorageError::Malformed(format!(
                "unknown flag info bits {:#04x} at offset {}",
                bits, offset
            )));
        }
        Ok(FlagInfoBits(*bits))
    }
}
