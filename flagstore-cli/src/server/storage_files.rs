use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use flagstore_lib::builder::{encode_flag_infos, encode_flag_values};
use flagstore_lib::flag_info::{FlagInfoBits, FlagInfoList};
use flagstore_lib::flag_value::FlagValueList;
use flagstore_lib::mapped::map_file;
use flagstore_lib::proto::{
    FlagOverride, FlagOverrideType, LocalFlagOverrides, PersistStorageRecord, RemoveOverrideType,
};
use flagstore_lib::records::RECORD_VERSION;
use flagstore_lib::util::{
    copy_file_atomic, files_digest, read_pb_from_file, write_atomic, write_in_place,
    write_pb_to_file,
};
use flagstore_lib::{
    format_flag_value, parse_flag_value, pick_value, reader_paths, ContainerStorage,
    StorageError, StorageFilePaths, ValueSources,
};
use log::{debug, error, info, warn};
use memmap2::Mmap;

/// Where the daemon keeps one container's files. Everything but the reader
/// files lives in a per-generation directory, so a new generation can be
/// staged next to the active one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPaths {
    pub generation: PathBuf,
    /// Copies of the installed files; never modified after copying.
    pub default: StorageFilePaths,
    /// Values as materialized for this boot, before immediate overrides.
    pub booted_val: PathBuf,
    pub booted_info: PathBuf,
    pub local_overrides: PathBuf,
    pub server_overrides: PathBuf,
    /// What readers map: `maps/<c>.*` and the live `boot/<c>.*` values.
    pub reader: StorageFilePaths,
}

impl ContainerPaths {
    /// `<root>/generations/<container>/<digest prefix>`.
    pub fn generation_dir(root: &Path, container: &str, digest: &str) -> PathBuf {
        let id = digest.get(..16).unwrap_or(digest);
        root.join("generations").join(container).join(id)
    }

    pub fn new(root: &Path, container: &str, generation: &Path) -> Self {
        Self {
            generation: generation.to_path_buf(),
            default: StorageFilePaths::in_dir(generation, container),
            booted_val: generation.join("boot.val"),
            booted_info: generation.join("boot.info"),
            local_overrides: generation.join("local_overrides.pb"),
            server_overrides: generation.join("server_overrides.pb"),
            reader: reader_paths(root, container),
        }
    }
}

/// Read model of one flag, recomputed for every query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagSnapshot {
    pub container: String,
    pub package: String,
    pub flag: String,
    pub server_value: Option<String>,
    pub local_value: Option<String>,
    pub boot_value: String,
    pub default_value: String,
    pub is_readwrite: bool,
    pub has_server_override: bool,
    pub has_local_override: bool,
    pub has_boot_local_override: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagContext {
    pub package_id: u32,
    pub flag_index: u16,
    pub offset: u32,
    pub is_readwrite: bool,
    pub default_value: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LocalValues {
    immediate: Option<bool>,
    on_reboot: Option<bool>,
}

impl LocalValues {
    fn current(&self) -> Option<bool> {
        self.immediate.or(self.on_reboot)
    }

    fn is_empty(&self) -> bool {
        self.immediate.is_none() && self.on_reboot.is_none()
    }
}

type OverrideKey = (String, String);

struct BootCopy {
    val: Mmap,
    info: Mmap,
}

/// One container generation as the daemon manages it: default files, staged
/// overrides and the boot copy readers map.
pub struct ContainerFiles {
    container: String,
    paths: ContainerPaths,
    record: PersistStorageRecord,
    local: BTreeMap<OverrideKey, LocalValues>,
    server: BTreeMap<OverrideKey, bool>,
    storage: OnceLock<Arc<ContainerStorage>>,
    boot: OnceLock<Arc<BootCopy>>,
    corrupted: AtomicBool,
}

impl ContainerFiles {
    /// Copies a validated generation into its own directory. Staged overrides
    /// start empty; carry them over with [`ContainerFiles::restage_from`].
    /// Nothing readers map is touched until [`ContainerFiles::publish`].
    pub fn stage(
        root: &Path,
        container: &str,
        src: &StorageFilePaths,
        digest: String,
    ) -> Result<Self, StorageError> {
        let generation = ContainerPaths::generation_dir(root, container, &digest);
        if generation.exists() {
            // leftovers of an install that failed before its record switched
            std::fs::remove_dir_all(&generation).map_err(|e| StorageError::io(&generation, e))?;
        }
        let paths = ContainerPaths::new(root, container, &generation);
        copy_file_atomic(&src.package_map, &paths.default.package_map)?;
        copy_file_atomic(&src.flag_map, &paths.default.flag_map)?;
        copy_file_atomic(&src.flag_val, &paths.default.flag_val)?;
        copy_file_atomic(&src.flag_info, &paths.default.flag_info)?;

        let copied = files_digest(&[
            &paths.default.package_map,
            &paths.default.flag_map,
            &paths.default.flag_val,
            &paths.default.flag_info,
        ])?;
        if copied != digest {
            return Err(StorageError::DigestMismatch {
                container: container.to_string(),
            });
        }

        let record = PersistStorageRecord {
            version: RECORD_VERSION,
            container: container.to_string(),
            package_map: paths.default.package_map.display().to_string(),
            flag_map: paths.default.flag_map.display().to_string(),
            flag_val: paths.default.flag_val.display().to_string(),
            digest,
            flag_info: paths.default.flag_info.display().to_string(),
        };
        Ok(Self::with_overrides(
            container,
            paths,
            record,
            BTreeMap::new(),
            BTreeMap::new(),
        ))
    }

    /// Rebuilds the container from its persisted record and override files.
    pub fn from_record(root: &Path, record: &PersistStorageRecord) -> Result<Self, StorageError> {
        let generation = Path::new(&record.package_map).parent().ok_or_else(|| {
            StorageError::Malformed(format!(
                "record of {} has no generation directory",
                record.container
            ))
        })?;
        let mut paths = ContainerPaths::new(root, &record.container, generation);
        paths.default = StorageFilePaths {
            package_map: PathBuf::from(&record.package_map),
            flag_map: PathBuf::from(&record.flag_map),
            flag_val: PathBuf::from(&record.flag_val),
            flag_info: PathBuf::from(&record.flag_info),
        };

        let local_pb: LocalFlagOverrides = read_pb_from_file(&paths.local_overrides)?;
        let mut local: BTreeMap<OverrideKey, LocalValues> = BTreeMap::new();
        for entry in local_pb.overrides {
            let value = parse_flag_value(&entry.flag_value)?;
            let slot = local
                .entry((entry.package_name, entry.flag_name))
                .or_default();
            match FlagOverrideType::try_from(entry.override_type) {
                Ok(FlagOverrideType::LocalImmediate) => slot.immediate = Some(value),
                Ok(FlagOverrideType::LocalOnReboot) => slot.on_reboot = Some(value),
                _ => {
                    return Err(StorageError::Malformed(format!(
                        "{} holds override type {}",
                        paths.local_overrides.display(),
                        entry.override_type
                    )))
                }
            }
        }

        let server_pb: LocalFlagOverrides = read_pb_from_file(&paths.server_overrides)?;
        let mut server = BTreeMap::new();
        for entry in server_pb.overrides {
            let value = parse_flag_value(&entry.flag_value)?;
            server.insert((entry.package_name, entry.flag_name), value);
        }

        Ok(Self::with_overrides(
            &record.container,
            paths,
            record.clone(),
            local,
            server,
        ))
    }

    fn with_overrides(
        container: &str,
        paths: ContainerPaths,
        record: PersistStorageRecord,
        local: BTreeMap<OverrideKey, LocalValues>,
        server: BTreeMap<OverrideKey, bool>,
    ) -> Self {
        Self {
            container: container.to_string(),
            paths,
            record,
            local,
            server,
            storage: OnceLock::new(),
            boot: OnceLock::new(),
            corrupted: AtomicBool::new(false),
        }
    }

    pub fn record(&self) -> &PersistStorageRecord {
        &self.record
    }

    pub fn generation(&self) -> &Path {
        &self.paths.generation
    }

    /// Booted values are materialized and readers have value files to map.
    pub fn has_boot_copy(&self) -> bool {
        [
            &self.paths.booted_val,
            &self.paths.booted_info,
            &self.paths.reader.flag_val,
            &self.paths.reader.flag_info,
        ]
        .iter()
        .all(|p| p.exists())
    }

    /// Maps the default files on first use after checking them against the
    /// record digest. A mismatch marks the container corrupted for good.
    pub fn storage(&self) -> Result<Arc<ContainerStorage>, StorageError> {
        if self.corrupted.load(Ordering::Acquire) {
            return Err(StorageError::DigestMismatch {
                container: self.container.clone(),
            });
        }
        if let Some(storage) = self.storage.get() {
            return Ok(Arc::clone(storage));
        }

        let digest = files_digest(&[
            &self.paths.default.package_map,
            &self.paths.default.flag_map,
            &self.paths.default.flag_val,
            &self.paths.default.flag_info,
        ])?;
        if digest != self.record.digest {
            error!(
                "container {} storage files do not match their record digest",
                self.container
            );
            self.corrupted.store(true, Ordering::Release);
            return Err(StorageError::DigestMismatch {
                container: self.container.clone(),
            });
        }

        let storage = Arc::new(ContainerStorage::open(&self.paths.default)?);
        Ok(Arc::clone(self.storage.get_or_init(|| storage)))
    }

    fn boot_copy(&self) -> Result<Option<Arc<BootCopy>>, StorageError> {
        if let Some(boot) = self.boot.get() {
            return Ok(Some(Arc::clone(boot)));
        }
        if !self.paths.booted_val.exists() || !self.paths.booted_info.exists() {
            return Ok(None);
        }
        let boot = Arc::new(BootCopy {
            val: map_file(&self.paths.booted_val)?,
            info: map_file(&self.paths.booted_info)?,
        });
        Ok(Some(Arc::clone(self.boot.get_or_init(|| boot))))
    }

    pub fn has_package(&self, package: &str) -> Result<bool, StorageError> {
        Ok(self.storage()?.find_package(package)?.is_some())
    }

    pub fn flag_context(&self, package: &str, flag: &str) -> Result<Option<FlagContext>, StorageError> {
        let storage = self.storage()?;
        let Some(pkg) = storage.find_package(package)? else {
            return Ok(None);
        };
        let Some(entry) = storage.find_flag(pkg.package_id, flag)? else {
            return Ok(None);
        };
        let offset = pkg.boolean_start_index + entry.flag_index as u32;
        Ok(Some(FlagContext {
            package_id: pkg.package_id,
            flag_index: entry.flag_index,
            offset,
            is_readwrite: entry.flag_type.is_readwrite(),
            default_value: storage.value(offset)?,
        }))
    }

    /// Validates and persists one override. Local overrides require a
    /// read-write flag; immediate ones are written to the live values too.
    pub fn stage_override(
        &mut self,
        package: &str,
        flag: &str,
        value: bool,
        override_type: FlagOverrideType,
    ) -> Result<FlagContext, StorageError> {
        let context = self
            .flag_context(package, flag)?
            .ok_or_else(|| StorageError::FlagNotFound {
                package: package.to_string(),
                flag: flag.to_string(),
            })?;
        let key = (package.to_string(), flag.to_string());

        match override_type {
            FlagOverrideType::LocalImmediate | FlagOverrideType::LocalOnReboot => {
                if !context.is_readwrite {
                    return Err(StorageError::FlagIsReadOnly {
                        package: package.to_string(),
                        flag: flag.to_string(),
                    });
                }
                let mut local = self.local.clone();
                let slot = local.entry(key).or_default();
                if override_type == FlagOverrideType::LocalImmediate {
                    slot.immediate = Some(value);
                } else {
                    slot.on_reboot = Some(value);
                }
                self.commit_local(local)?;
                if override_type == FlagOverrideType::LocalImmediate {
                    self.refresh_live_values()?;
                }
            }
            FlagOverrideType::ServerOnReboot => {
                let mut server = self.server.clone();
                server.insert(key, value);
                self.commit_server(server)?;
            }
            FlagOverrideType::Unspecified => {
                return Err(StorageError::InvalidRequest(
                    "override type must be set".into(),
                ))
            }
        }
        Ok(context)
    }

    /// Drops local overrides of `remove_type` for one flag or, with no flag,
    /// the whole package. Absent overrides are not an error.
    pub fn remove_local(
        &mut self,
        package: &str,
        flag: Option<&str>,
        remove_type: RemoveOverrideType,
    ) -> Result<(), StorageError> {
        let mut local = self.local.clone();
        for ((p, f), slot) in local.iter_mut() {
            if p == package && flag.map_or(true, |flag| flag == f) {
                clear_slot(slot, remove_type);
            }
        }
        local.retain(|_, slot| !slot.is_empty());
        self.commit_local(local)?;
        self.after_local_removal(remove_type)
    }

    pub fn remove_all_local(&mut self, remove_type: RemoveOverrideType) -> Result<(), StorageError> {
        let mut local = self.local.clone();
        for slot in local.values_mut() {
            clear_slot(slot, remove_type);
        }
        local.retain(|_, slot| !slot.is_empty());
        self.commit_local(local)?;
        self.after_local_removal(remove_type)
    }

    fn after_local_removal(&self, remove_type: RemoveOverrideType) -> Result<(), StorageError> {
        match remove_type {
            RemoveOverrideType::RemoveLocalImmediate => self.refresh_live_values(),
            _ => Ok(()),
        }
    }

    /// Discards every local and server override. Booted values are left
    /// alone; the live values drop immediate overrides.
    pub fn reset(&mut self) -> Result<(), StorageError> {
        self.commit_local(BTreeMap::new())?;
        self.commit_server(BTreeMap::new())?;
        self.refresh_live_values()
    }

    /// Folds immediate local overrides into the on-reboot set once they are
    /// part of the boot values.
    pub fn mark_local_applied(&mut self) -> Result<(), StorageError> {
        if self.local.values().all(|slot| slot.immediate.is_none()) {
            return Ok(());
        }
        let local = self
            .local
            .iter()
            .map(|(key, slot)| {
                let folded = LocalValues {
                    immediate: None,
                    on_reboot: slot.current(),
                };
                (key.clone(), folded)
            })
            .collect();
        self.commit_local(local)
    }

    /// Carries overrides from the previous generation whose flags still exist
    /// (and, for local ones, are still read-write).
    pub fn restage_from(&mut self, old: &ContainerFiles) -> Result<usize, StorageError> {
        let mut local = BTreeMap::new();
        let mut server = BTreeMap::new();
        let mut dropped = 0;

        for ((package, flag), slot) in &old.local {
            match self.flag_context(package, flag)? {
                Some(context) if context.is_readwrite => {
                    local.insert((package.clone(), flag.clone()), *slot);
                }
                _ => dropped += 1,
            }
        }
        for ((package, flag), value) in &old.server {
            match self.flag_context(package, flag)? {
                Some(_) => {
                    server.insert((package.clone(), flag.clone()), *value);
                }
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            info!(
                "dropped {} overrides no longer matching container {}",
                dropped, self.container
            );
        }
        self.commit_local(local)?;
        self.commit_server(server)?;
        Ok(dropped)
    }

    pub fn persist_overrides(&self) -> Result<(), StorageError> {
        write_pb_to_file(&local_pb(&self.local), &self.paths.local_overrides)?;
        write_pb_to_file(&server_pb(&self.server), &self.paths.server_overrides)
    }

    fn commit_local(&mut self, local: BTreeMap<OverrideKey, LocalValues>) -> Result<(), StorageError> {
        write_pb_to_file(&local_pb(&local), &self.paths.local_overrides)?;
        self.local = local;
        Ok(())
    }

    fn commit_server(&mut self, server: BTreeMap<OverrideKey, bool>) -> Result<(), StorageError> {
        write_pb_to_file(&server_pb(&server), &self.paths.server_overrides)?;
        self.server = server;
        Ok(())
    }

    /// Writes the booted values of this generation from defaults and every
    /// staged override except immediate ones.
    pub fn materialize_boot(&mut self) -> Result<(), StorageError> {
        let storage = self.storage()?;
        let defaults = storage.values()?;
        let default_infos = storage.infos()?;

        let mut values = Vec::with_capacity(defaults.len());
        let mut infos = Vec::with_capacity(defaults.len());
        for offset in 0..defaults.len() as u32 {
            values.push(defaults.get(offset)?);
            infos.push(default_infos.get(offset)?);
        }

        let packages = package_names(&storage)?;
        for node in storage.flag_table()?.iter() {
            let node = node?;
            let Some((package, start)) = packages.get(&node.package_id) else {
                continue;
            };
            let offset = (*start + node.entry.flag_index as u32) as usize;
            let key = (package.clone(), node.name.to_string());
            let local = self.local.get(&key).copied().unwrap_or_default();
            let server = self.server.get(&key).copied();
            let is_readwrite = node.entry.flag_type.is_readwrite();

            let resolution = pick_value(
                &ValueSources {
                    local_immediate: None,
                    local_on_reboot: local.on_reboot,
                    server_on_reboot: server,
                    default: values[offset],
                },
                is_readwrite,
            );
            if resolution.ignored_local_override {
                error!(
                    "ignoring local override on read only flag {}.{} in {}",
                    package, node.name, self.container
                );
            }
            values[offset] = resolution.value;
            infos[offset] = FlagInfoBits::new(
                is_readwrite,
                server.is_some(),
                is_readwrite && local.on_reboot.is_some(),
            );
        }

        write_atomic(&self.paths.booted_val, &encode_flag_values(&self.container, &values))?;
        write_atomic(&self.paths.booted_info, &encode_flag_infos(&self.container, &infos))?;
        self.boot = OnceLock::new();
        info!("materialized boot values for container {}", self.container);
        Ok(())
    }

    /// Booted values with immediate local overrides laid over them, encoded
    /// as the value and info files readers map.
    fn live_files(&self) -> Result<(Vec<u8>, Vec<u8>), StorageError> {
        let boot = self
            .boot_copy()?
            .ok_or_else(|| StorageError::CannotReadStorageFile {
                path: self.paths.booted_val.display().to_string(),
                reason: "boot values were never materialized".into(),
            })?;
        let booted_values = FlagValueList::parse(&boot.val)?;
        let booted_infos = FlagInfoList::parse(&boot.info)?;
        let mut values = Vec::with_capacity(booted_values.len());
        let mut infos = Vec::with_capacity(booted_values.len());
        for offset in 0..booted_values.len() as u32 {
            values.push(booted_values.get(offset)?);
            infos.push(booted_infos.get(offset)?);
        }

        for ((package, flag), slot) in &self.local {
            let Some(value) = slot.immediate else {
                continue;
            };
            let context = match self.flag_context(package, flag)? {
                Some(context) if context.is_readwrite => context,
                _ => {
                    warn!(
                        "skipping immediate override for {}.{} in {}",
                        package, flag, self.container
                    );
                    continue;
                }
            };
            let offset = context.offset as usize;
            let (Some(v), Some(i)) = (values.get_mut(offset), infos.get_mut(offset)) else {
                return Err(StorageError::Malformed(format!(
                    "boot values of {} have no offset {}",
                    self.container, offset
                )));
            };
            *v = value;
            *i = FlagInfoBits::new(true, i.has_server_override(), true);
        }

        Ok((
            encode_flag_values(&self.container, &values),
            encode_flag_infos(&self.container, &infos),
        ))
    }

    /// Makes this generation what readers map: the tables under `maps/` and
    /// the live values under `boot/`, each replaced by rename.
    pub fn publish(&self) -> Result<(), StorageError> {
        let (values, infos) = self.live_files()?;
        copy_file_atomic(&self.paths.default.package_map, &self.paths.reader.package_map)?;
        copy_file_atomic(&self.paths.default.flag_map, &self.paths.reader.flag_map)?;
        write_atomic(&self.paths.reader.flag_val, &values)?;
        write_atomic(&self.paths.reader.flag_info, &infos)?;
        info!("published container {}", self.container);
        Ok(())
    }

    /// Rewrites the live values in place so readers holding a mapping see
    /// immediate overrides without remapping.
    pub fn refresh_live_values(&self) -> Result<(), StorageError> {
        if !self.has_boot_copy() {
            debug!("container {} is not published yet", self.container);
            return Ok(());
        }
        let (values, infos) = self.live_files()?;
        write_in_place(&self.paths.reader.flag_val, &values)?;
        write_in_place(&self.paths.reader.flag_info, &infos)
    }

    pub fn snapshot(&self, package: &str, flag: &str) -> Result<Option<FlagSnapshot>, StorageError> {
        let Some(context) = self.flag_context(package, flag)? else {
            return Ok(None);
        };
        let boot = self.boot_copy()?;
        Ok(Some(self.build_snapshot(package, flag, &context, boot.as_deref())?))
    }

    /// Snapshots of every flag in the container, or only in `package`.
    pub fn list_flags(&self, package: Option<&str>) -> Result<Vec<FlagSnapshot>, StorageError> {
        let storage = self.storage()?;
        let packages = package_names(&storage)?;
        let boot = self.boot_copy()?;
        let mut snapshots = Vec::new();
        for node in storage.flag_table()?.iter() {
            let node = node?;
            let Some((name, start)) = packages.get(&node.package_id) else {
                continue;
            };
            if package.is_some_and(|p| p != name.as_str()) {
                continue;
            }
            let offset = start + node.entry.flag_index as u32;
            let context = FlagContext {
                package_id: node.package_id,
                flag_index: node.entry.flag_index,
                offset,
                is_readwrite: node.entry.flag_type.is_readwrite(),
                default_value: storage.value(offset)?,
            };
            snapshots.push(self.build_snapshot(name, node.name, &context, boot.as_deref())?);
        }
        snapshots.sort_by(|a, b| (&a.package, &a.flag).cmp(&(&b.package, &b.flag)));
        Ok(snapshots)
    }

    fn build_snapshot(
        &self,
        package: &str,
        flag: &str,
        context: &FlagContext,
        boot: Option<&BootCopy>,
    ) -> Result<FlagSnapshot, StorageError> {
        let key = (package.to_string(), flag.to_string());
        let local = self.local.get(&key).copied().unwrap_or_default();
        let server = self.server.get(&key).copied();

        let (boot_value, has_boot_local_override) = match boot {
            Some(boot) => (
                FlagValueList::parse(&boot.val)?.get(context.offset)?,
                FlagInfoList::parse(&boot.info)?
                    .get(context.offset)?
                    .has_local_override(),
            ),
            None => (context.default_value, false),
        };

        Ok(FlagSnapshot {
            container: self.container.clone(),
            package: package.to_string(),
            flag: flag.to_string(),
            server_value: server.map(format_flag_value),
            local_value: local.current().map(format_flag_value),
            boot_value: format_flag_value(boot_value),
            default_value: format_flag_value(context.default_value),
            is_readwrite: context.is_readwrite,
            has_server_override: server.is_some(),
            has_local_override: !local.is_empty(),
            has_boot_local_override,
        })
    }
}

fn clear_slot(slot: &mut LocalValues, remove_type: RemoveOverrideType) {
    match remove_type {
        RemoveOverrideType::RemoveLocalImmediate => slot.immediate = None,
        RemoveOverrideType::RemoveLocalOnReboot => slot.on_reboot = None,
        RemoveOverrideType::Unspecified => {}
    }
}

fn package_names(storage: &ContainerStorage) -> Result<HashMap<u32, (String, u32)>, StorageError> {
    let mut packages = HashMap::new();
    for node in storage.package_table()?.iter() {
        let node = node?;
        packages.insert(
            node.info.package_id,
            (node.name.to_string(), node.info.boolean_start_index),
        );
    }
    Ok(packages)
}

fn local_pb(local: &BTreeMap<OverrideKey, LocalValues>) -> LocalFlagOverrides {
    let mut overrides = Vec::new();
    for ((package, flag), slot) in local {
        let entries = [
            (slot.immediate, FlagOverrideType::LocalImmediate),
            (slot.on_reboot, FlagOverrideType::LocalOnReboot),
        ];
        for (value, override_type) in entries {
            if let Some(value) = value {
                overrides.push(FlagOverride {
                    package_name: package.clone(),
                    flag_name: flag.clone(),
                    flag_value: format_flag_value(value),
                    override_type: override_type as i32,
                });
            }
        }
    }
    LocalFlagOverrides { overrides }
}

fn server_pb(server: &BTreeMap<OverrideKey, bool>) -> LocalFlagOverrides {
    LocalFlagOverrides {
        overrides: server
            .iter()
            .map(|((package, flag), value)| FlagOverride {
                package_name: package.clone(),
                flag_name: flag.clone(),
                flag_value: format_flag_value(*value),
                override_type: FlagOverrideType::ServerOnReboot as i32,
            })
            .collect(),
    }
}
