use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::flag_info::FlagInfoBits;
use crate::format::{
    bucket_count, flag_bucket, header_len, package_bucket, package_fingerprint, patch_file_size,
    put_header, put_str, put_u16, put_u32, put_u64, FileType, StoredFlagType, NO_OFFSET,
};
use crate::util::write_atomic;

struct FlagDecl {
    name: String,
    index: Option<u16>,
    value: bool,
    flag_type: StoredFlagType,
}

struct PackageDecl {
    name: String,
    package_id: Option<u32>,
    boolean_start_index: Option<u32>,
    fingerprint: Option<u64>,
    flags: Vec<FlagDecl>,
}

/// Writes the four storage files of one container.
///
/// Packages get dense ids and consecutive boolean runs in declaration order
/// unless set explicitly; `flag` calls attach to the last declared package.
pub struct StorageFilesBuilder {
    container: String,
    packages: Vec<PackageDecl>,
}

/// Encoded contents of a container's storage files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageFileSet {
    pub package_map: Vec<u8>,
    pub flag_map: Vec<u8>,
    pub flag_val: Vec<u8>,
    pub flag_info: Vec<u8>,
}

/// Paths of one container's storage files on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageFilePaths {
    pub package_map: PathBuf,
    pub flag_map: PathBuf,
    pub flag_val: PathBuf,
    pub flag_info: PathBuf,
}

impl StorageFilePaths {
    /// `<dir>/<container>.package.map` and friends.
    pub fn in_dir(dir: &Path, container: &str) -> Self {
        Self {
            package_map: dir.join(format!("{}.package.map", container)),
            flag_map: dir.join(format!("{}.flag.map", container)),
            flag_val: dir.join(format!("{}.val", container)),
            flag_info: dir.join(format!("{}.info", container)),
        }
    }
}

pub fn create_builder(container: &str) -> StorageFilesBuilder {
    StorageFilesBuilder {
        container: container.to_string(),
        packages: Vec::new(),
    }
}

impl StorageFilesBuilder {
    pub fn package(mut self, name: &str) -> Self {
        self.packages.push(PackageDecl {
            name: name.to_string(),
            package_id: None,
            boolean_start_index: None,
            fingerprint: None,
            flags: Vec::new(),
        });
        self
    }

    pub fn package_id(mut self, id: u32) -> Self {
        if let Some(p) = self.packages.last_mut() {
            p.package_id = Some(id);
        }
        self
    }

    pub fn boolean_start_index(mut self, index: u32) -> Self {
        if let Some(p) = self.packages.last_mut() {
            p.boolean_start_index = Some(index);
        }
        self
    }

    pub fn fingerprint(mut self, fingerprint: u64) -> Self {
        if let Some(p) = self.packages.last_mut() {
            p.fingerprint = Some(fingerprint);
        }
        self
    }

    pub fn flag(self, name: &str, value: bool, flag_type: StoredFlagType) -> Self {
        self.push_flag(name, None, value, flag_type)
    }

    pub fn flag_at(self, name: &str, index: u16, value: bool, flag_type: StoredFlagType) -> Self {
        self.push_flag(name, Some(index), value, flag_type)
    }

    fn push_flag(
        mut self,
        name: &str,
        index: Option<u16>,
        value: bool,
        flag_type: StoredFlagType,
    ) -> Self {
        if let Some(p) = self.packages.last_mut() {
            p.flags.push(FlagDecl {
                name: name.to_string(),
                index,
                value,
                flag_type,
            });
        }
        self
    }

    pub fn build(&self) -> Result<StorageFileSet, StorageError> {
        let layout = self.layout()?;
        let total = layout
            .iter()
            .flat_map(|p| {
                p.flags
                    .iter()
                    .map(move |(_, index, _)| (p.start + *index as u32 + 1) as usize)
            })
            .max()
            .unwrap_or(0);

        let mut values = vec![false; total];
        let mut infos = vec![FlagInfoBits::default(); total];
        for package in &layout {
            for (decl, index, _) in &package.flags {
                let offset = (package.start + *index as u32) as usize;
                values[offset] = decl.value;
                infos[offset] = FlagInfoBits::new(decl.flag_type.is_readwrite(), false, false);
            }
        }

        Ok(StorageFileSet {
            package_map: self.encode_package_map(&layout),
            flag_map: self.encode_flag_map(&layout),
            flag_val: encode_flag_values(&self.container, &values),
            flag_info: encode_flag_infos(&self.container, &infos),
        })
    }

    /// Builds the files and writes them into `dir` as `<container>.*`.
    pub fn write_to(&self, dir: &Path) -> Result<StorageFilePaths, StorageError> {
        let files = self.build()?;
        let paths = StorageFilePaths::in_dir(dir, &self.container);
        write_atomic(&paths.package_map, &files.package_map)?;
        write_atomic(&paths.flag_map, &files.flag_map)?;
        write_atomic(&paths.flag_val, &files.flag_val)?;
        write_atomic(&paths.flag_info, &files.flag_info)?;
        Ok(paths)
    }

    fn layout(&self) -> Result<Vec<PackageLayout<'_>>, StorageError> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        let mut next_start = 0u32;
        let mut layout = Vec::with_capacity(self.packages.len());

        for (position, decl) in self.packages.iter().enumerate() {
            if !names.insert(decl.name.as_str()) {
                return Err(StorageError::InvalidRequest(format!(
                    "duplicate package {}",
                    decl.name
                )));
            }
            let package_id = decl.package_id.unwrap_or(position as u32);
            if !ids.insert(package_id) {
                return Err(StorageError::InvalidRequest(format!(
                    "duplicate package id {}",
                    package_id
                )));
            }

            let mut flags = Vec::with_capacity(decl.flags.len());
            let mut flag_names = HashSet::new();
            for (position, flag) in decl.flags.iter().enumerate() {
                if !flag_names.insert(flag.name.as_str()) {
                    return Err(StorageError::InvalidRequest(format!(
                        "duplicate flag {}.{}",
                        decl.name, flag.name
                    )));
                }
                let index = flag.index.unwrap_or(position as u16);
                if flags.iter().any(|(_, i, _)| *i == index) {
                    return Err(StorageError::InvalidRequest(format!(
                        "flag {}.{} reuses index {}",
                        decl.name, flag.name, index
                    )));
                }
                flags.push((flag, index, flag.flag_type));
            }

            let start = decl.boolean_start_index.unwrap_or(next_start);
            let run = flags.iter().map(|(_, i, _)| *i as u32 + 1).max().unwrap_or(0);
            next_start = next_start.max(start + run);

            let fingerprint = decl
                .fingerprint
                .unwrap_or_else(|| package_fingerprint(decl.flags.iter().map(|f| f.name.as_str())));

            layout.push(PackageLayout {
                name: &decl.name,
                package_id,
                start,
                fingerprint,
                flags,
            });
        }
        Ok(layout)
    }

    fn encode_package_map(&self, layout: &[PackageLayout<'_>]) -> Vec<u8> {
        let nodes: Vec<(u32, Vec<u8>)> = layout
            .iter()
            .map(|p| {
                let bucket = package_bucket(p.name, bucket_count(layout.len()));
                let mut node = Vec::new();
                put_str(&mut node, p.name);
                put_u32(&mut node, p.package_id);
                put_u64(&mut node, p.fingerprint);
                put_u32(&mut node, p.start);
                (bucket, node)
            })
            .collect();
        encode_map(FileType::PackageMap, &self.container, layout.len(), nodes)
    }

    fn encode_flag_map(&self, layout: &[PackageLayout<'_>]) -> Vec<u8> {
        let count: usize = layout.iter().map(|p| p.flags.len()).sum();
        let num_buckets = bucket_count(count);
        let mut nodes = Vec::with_capacity(count);
        for package in layout {
            for (decl, index, flag_type) in &package.flags {
                let bucket = flag_bucket(package.package_id, &decl.name, num_buckets);
                let mut node = Vec::new();
                put_u32(&mut node, package.package_id);
                put_str(&mut node, &decl.name);
                put_u16(&mut node, *flag_type as u16);
                put_u16(&mut node, *index);
                nodes.push((bucket, node));
            }
        }
        encode_map(FileType::FlagMap, &self.container, count, nodes)
    }
}

struct PackageLayout<'a> {
    name: &'a str,
    package_id: u32,
    start: u32,
    fingerprint: u64,
    flags: Vec<(&'a FlagDecl, u16, StoredFlagType)>,
}

/// Lays out header, bucket array and chained nodes. Each node body is
/// followed by its `next_offset`, filled in here.
fn encode_map(
    file_type: FileType,
    container: &str,
    entries: usize,
    nodes: Vec<(u32, Vec<u8>)>,
) -> Vec<u8> {
    let num_buckets = bucket_count(entries);
    let bucket_offset = (header_len(container) + 8) as u32;
    let node_offset = bucket_offset + num_buckets * 4;

    let mut offsets = Vec::with_capacity(nodes.len());
    let mut at = node_offset;
    for (_, body) in &nodes {
        offsets.push(at);
        at += body.len() as u32 + 4;
    }

    let mut heads = vec![NO_OFFSET; num_buckets as usize];
    let mut tails: Vec<Option<usize>> = vec![None; num_buckets as usize];
    let mut next = vec![NO_OFFSET; nodes.len()];
    for (i, (bucket, _)) in nodes.iter().enumerate() {
        let b = *bucket as usize;
        match tails[b] {
            Some(prev) => next[prev] = offsets[i],
            None => heads[b] = offsets[i],
        }
        tails[b] = Some(i);
    }

    let mut out = Vec::with_capacity(at as usize);
    put_header(&mut out, file_type, container, entries as u32);
    put_u32(&mut out, bucket_offset);
    put_u32(&mut out, node_offset);
    for head in heads {
        put_u32(&mut out, head);
    }
    for (i, (_, body)) in nodes.iter().enumerate() {
        out.extend_from_slice(body);
        put_u32(&mut out, next[i]);
    }
    patch_file_size(&mut out, container);
    out
}

fn encode_entries(file_type: FileType, container: &str, entries: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header_len(container) + 4 + entries.len());
    put_header(&mut out, file_type, container, entries.len() as u32);
    put_u32(&mut out, (header_len(container) + 4) as u32);
    out.extend_from_slice(entries);
    patch_file_size(&mut out, container);
    out
}

pub fn encode_flag_values(container: &str, values: &[bool]) -> Vec<u8> {
    let bytes: Vec<u8> = values.iter().map(|v| *v as u8).collect();
    encode_entries(FileType::FlagVal, container, &bytes)
}

pub fn encode_flag_infos(container: &str, infos: &[FlagInfoBits]) -> Vec<u8> {
    let bytes: Vec<u8> = infos.iter().map(|i| i.0).collect();
    encode_entries(FileType::FlagInfo, container, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag_value::FlagValueList;
    use crate::package_table::PackageTable;

    #[test]
    fn test_explicit_layout() {
        let files = create_builder("com.example")
            .package("pkg.a")
            .package_id(3)
            .boolean_start_index(10)
            .fingerprint(0xABCD)
            .flag_at("f1", 2, false, StoredFlagType::ReadWriteBoolean)
            .build()
            .unwrap();
        let values = FlagValueList::parse(&files.flag_val).unwrap();
        assert_eq!(values.len(), 13);
        assert!(!values.get(12).unwrap());

        let table = PackageTable::parse(&files.package_map).unwrap();
        assert_eq!(table.container(), "com.example");
        assert_eq!(table.find("pkg.a").unwrap().unwrap().fingerprint, 0xABCD);
    }

    #[test]
    fn test_default_fingerprint() {
        let files = create_builder("system")
            .package("com.android.a")
            .flag("x", true, StoredFlagType::ReadWriteBoolean)
            .flag("y", true, StoredFlagType::ReadWriteBoolean)
            .build()
            .unwrap();
        let table = PackageTable::parse(&files.package_map).unwrap();
        let info = table.find("com.android.a").unwrap().unwrap();
        assert_eq!(info.fingerprint, package_fingerprint(["y", "x"]));
    }

    #[test]
    fn test_duplicates_rejected() {
        let result = create_builder("system")
            .package("a")
            .flag("x", true, StoredFlagType::ReadWriteBoolean)
            .flag("x", false, StoredFlagType::ReadWriteBoolean)
            .build();
        assert!(result.is_err());

        let result = create_builder("system").package("a").package("a").build();
        assert!(result.is_err());

        let result = create_builder("system")
            .package("a")
            .package("b")
            .package_id(0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_container() {
        let files = create_builder("empty").build().unwrap();
        let table = PackageTable::parse(&files.package_map).unwrap();
        assert_eq!(table.num_packages(), 0);
        assert_eq!(table.find("anything").unwrap(), None);
        assert!(FlagValueList::parse(&files.flag_val).unwrap().is_empty());
    }

    #[test]
    fn test_write_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = create_builder("system")
            .package("com.android.a")
            .flag("x", true, StoredFlagType::ReadWriteBoolean)
            .write_to(dir.path())
            .unwrap();
        assert_eq!(paths.flag_val, dir.path().join("system.val"));
        assert!(paths.package_map.exists());
        assert!(paths.flag_map.exists());
        assert!(paths.flag_info.exists());
    }
}
