use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use log::debug;
use memmap2::Mmap;

use crate::builder::StorageFilePaths;
use crate::error::StorageError;
use crate::flag_info::{FlagInfoBits, FlagInfoList};
use crate::flag_table::{FlagEntry, FlagTable};
use crate::flag_value::FlagValueList;
use crate::package_table::{PackageInfo, PackageTable};

/// Maps a storage file read-only.
#[allow(unsafe_code)]
pub fn map_file(path: &Path) -> Result<Mmap, StorageError> {
    let file = File::open(path).map_err(|e| StorageError::unreadable(path, e))?;
    // SAFETY: storage files are replaced by rename and never written in place,
    // so the mapped pages stay valid for the lifetime of the mapping.
    unsafe { Mmap::map(&file) }.map_err(|e| StorageError::unreadable(path, e))
}

fn with_path(err: StorageError, path: &Path) -> StorageError {
    match err {
        StorageError::UnsupportedVersion { version, .. } => StorageError::UnsupportedVersion {
            path: path.display().to_string(),
            version,
        },
        StorageError::Malformed(reason) => {
            StorageError::Malformed(format!("{}: {}", path.display(), reason))
        }
        other => other,
    }
}

/// Read context over one container's mapped files.
///
/// Headers are validated once here; lookups afterwards resolve directly
/// against the mappings.
pub struct ContainerStorage {
    container: String,
    package_map: Mmap,
    flag_map: Mmap,
    flag_val: Mmap,
    flag_info: Mmap,
}

impl std::fmt::Debug for ContainerStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerStorage")
            .field("container", &self.container)
            .finish()
    }
}

impl ContainerStorage {
    /// Maps and validates all four files, including the index invariant
    /// `boolean_start_index + flag_index < num_values` for every flag.
    pub fn open(paths: &StorageFilePaths) -> Result<Self, StorageError> {
        let package_map = map_file(&paths.package_map)?;
        let flag_map = map_file(&paths.flag_map)?;
        let flag_val = map_file(&paths.flag_val)?;
        let flag_info = map_file(&paths.flag_info)?;

        let packages =
            PackageTable::parse(&package_map).map_err(|e| with_path(e, &paths.package_map))?;
        let flags = FlagTable::parse(&flag_map).map_err(|e| with_path(e, &paths.flag_map))?;
        let values = FlagValueList::parse(&flag_val).map_err(|e| with_path(e, &paths.flag_val))?;
        let infos = FlagInfoList::parse(&flag_info).map_err(|e| with_path(e, &paths.flag_info))?;

        let container = packages.container().to_string();
        for other in [flags.container(), values.container(), infos.container()] {
            if other != container {
                return Err(StorageError::Malformed(format!(
                    "storage files disagree on container: {} vs {}",
                    container, other
                )));
            }
        }
        if values.len() != infos.len() {
            return Err(StorageError::Malformed(format!(
                "{} values but {} info entries in container {}",
                values.len(),
                infos.len(),
                container
            )));
        }

        let mut starts = HashMap::new();
        for node in packages.iter() {
            let node = node?;
            starts.insert(node.info.package_id, node.info.boolean_start_index);
        }
        for node in flags.iter() {
            let node = node?;
            let start = starts.get(&node.package_id).ok_or_else(|| {
                StorageError::Malformed(format!(
                    "flag {} refers to unknown package id {}",
                    node.name, node.package_id
                ))
            })?;
            let offset = *start as u64 + node.entry.flag_index as u64;
            if offset >= values.len() as u64 {
                return Err(StorageError::Malformed(format!(
                    "flag {} at offset {} outside {} values",
                    node.name,
                    offset,
                    values.len()
                )));
            }
        }

        debug!(
            "mapped container {} ({} packages, {} flags)",
            container,
            packages.num_packages(),
            flags.num_flags()
        );

        Ok(Self {
            container,
            package_map,
            flag_map,
            flag_val,
            flag_info,
        })
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn package_table(&self) -> Result<PackageTable<'_>, StorageError> {
        PackageTable::parse(&self.package_map)
    }

    pub fn flag_table(&self) -> Result<FlagTable<'_>, StorageError> {
        FlagTable::parse(&self.flag_map)
    }

    pub fn values(&self) -> Result<FlagValueList<'_>, StorageError> {
        FlagValueList::parse(&self.flag_val)
    }

    pub fn infos(&self) -> Result<FlagInfoList<'_>, StorageError> {
        FlagInfoList::parse(&self.flag_info)
    }

    pub fn find_package(&self, package: &str) -> Result<Option<PackageInfo>, StorageError> {
        self.package_table()?.find(package)
    }

    pub fn find_flag(&self, package_id: u32, flag: &str) -> Result<Option<FlagEntry>, StorageError> {
        self.flag_table()?.find(package_id, flag)
    }

    pub fn value(&self, offset: u32) -> Result<bool, StorageError> {
        self.values()?.get(offset)
    }

    pub fn info(&self, offset: u32) -> Result<FlagInfoBits, StorageError> {
        self.infos()?.get(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::create_builder;
    use crate::error::ErrorCode;
    use crate::format::StoredFlagType;

    #[test]
    fn test_open_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let paths = create_builder("system")
            .package("com.android.a")
            .flag("x", true, StoredFlagType::ReadWriteBoolean)
            .flag("y", false, StoredFlagType::ReadOnlyBoolean)
            .write_to(dir.path())
            .unwrap();
        let storage = ContainerStorage::open(&paths).unwrap();
        assert_eq!(storage.container(), "system");

        let package = storage.find_package("com.android.a").unwrap().unwrap();
        let flag = storage.find_flag(package.package_id, "y").unwrap().unwrap();
        let offset = package.boolean_start_index + flag.flag_index as u32;
        assert!(!storage.value(offset).unwrap());
        assert!(!storage.info(offset).unwrap().is_readwrite());

        // mapping twice gives the same view
        let again = ContainerStorage::open(&paths).unwrap();
        assert_eq!(
            again.find_package("com.android.a").unwrap(),
            Some(package)
        );
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorageFilePaths::in_dir(dir.path(), "system");
        let err = ContainerStorage::open(&paths).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CannotReadStorageFile);
    }

    #[test]
    fn test_index_invariant_violation() {
        let dir = tempfile::tempdir().unwrap();
        let paths = create_builder("system")
            .package("com.android.a")
            .flag("x", true, StoredFlagType::ReadWriteBoolean)
            .flag("y", true, StoredFlagType::ReadWriteBoolean)
            .write_to(dir.path())
            .unwrap();
        // swap in a value file that is one entry short
        let short = crate::builder::encode_flag_values("system", &[true]);
        std::fs::write(&paths.flag_val, short).unwrap();
        let short_info =
            crate::builder::encode_flag_infos("system", &[FlagInfoBits::new(true, false, false)]);
        std::fs::write(&paths.flag_info, short_info).unwrap();

        let err = ContainerStorage::open(&paths).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Generic);
    }

    #[test]
    fn test_container_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let paths = create_builder("system")
            .package("com.android.a")
            .flag("x", true, StoredFlagType::ReadWriteBoolean)
            .write_to(dir.path())
            .unwrap();
        let other = crate::builder::encode_flag_values("vendor", &[true]);
        std::fs::write(&paths.flag_val, other).unwrap();
        assert!(ContainerStorage::open(&paths).is_err());
    }

    #[test]
    fn test_version_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = create_builder("system")
            .package("com.android.a")
            .flag("x", true, StoredFlagType::ReadWriteBoolean)
            .write_to(dir.path())
            .unwrap();
        let mut bytes = std::fs::read(&paths.flag_map).unwrap();
        bytes[4..8].copy_from_slice(&2u32.to_le_bytes());
        std::fs::write(&paths.flag_map, bytes).unwrap();

        let err = ContainerStorage::open(&paths).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CannotReadStorageFile);
        assert!(err.to_string().contains("system.flag.map"));
    }
}
