use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use flagstore_lib::proto::{FlagOverrideType, OtaFlagStagingMessage, RemoveOverrideType};
use flagstore_lib::util::{files_digest, read_pb_from_file, remove_file_if_exists, write_pb_to_file};
use flagstore_lib::{
    parse_flag_value, ContainerStorage, StorageError, StorageFilePaths, StorageRecords,
    PLATFORM_CONTAINERS,
};
use log::{debug, error, info, warn};

use super::storage_files::{ContainerFiles, ContainerPaths, FlagSnapshot};

pub enum RemoveTarget<'a> {
    Flag { package: &'a str, flag: &'a str },
    Package(&'a str),
    All,
}

pub enum ListSelection<'a> {
    All,
    Container(&'a str),
    Package(&'a str),
}

/// Owns every container generation, the record store and the staged
/// overrides. Callers serialize mutations by holding `&mut self`.
pub struct StorageManager {
    root: PathBuf,
    records: StorageRecords,
    containers: BTreeMap<String, ContainerFiles>,
    package_to_container: RwLock<HashMap<String, String>>,
}

impl StorageManager {
    /// Reopens the daemon state under `root`. The root must exist; an
    /// unreadable record store is fatal.
    pub fn load(root: &Path, records_path: &Path) -> Result<Self, StorageError> {
        if !root.is_dir() {
            return Err(StorageError::StorageSystemNotFound {
                path: root.display().to_string(),
            });
        }
        for dir in ["maps", "flags", "boot", "generations"] {
            let dir = root.join(dir);
            fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        }

        let records = StorageRecords::load(records_path)?;
        let mut containers = BTreeMap::new();
        for record in records.iter() {
            let files = ContainerFiles::from_record(root, record)?;
            containers.insert(record.container.clone(), files);
        }

        Ok(Self {
            root: root.to_path_buf(),
            records,
            containers,
            package_to_container: RwLock::new(HashMap::new()),
        })
    }

    pub fn containers(&self) -> impl Iterator<Item = &str> {
        self.containers.keys().map(|c| c.as_str())
    }

    fn ota_path(&self) -> PathBuf {
        self.root.join("flags").join("ota.pb")
    }

    /// Installs or replaces a container generation. Returns `false` when the
    /// files are identical to the active generation.
    ///
    /// The new generation is staged in its own directory and becomes active
    /// when its record is durable. A failure before that leaves the previous
    /// generation untouched.
    pub fn add_or_update(
        &mut self,
        container: &str,
        src: &StorageFilePaths,
    ) -> Result<bool, StorageError> {
        if container.is_empty() || container.contains('/') || container.starts_with('.') {
            return Err(StorageError::InvalidRequest(format!(
                "invalid container name {:?}",
                container
            )));
        }

        let digest = files_digest(&[&src.package_map, &src.flag_map, &src.flag_val, &src.flag_info])?;
        if let Some(existing) = self.containers.get_mut(container) {
            // a corrupted generation is replaced even by identical files
            if existing.record().digest == digest && existing.storage().is_ok() {
                if existing.has_boot_copy() {
                    debug!("container {} is unchanged", container);
                    return Ok(false);
                }
                existing.materialize_boot()?;
                existing.publish()?;
                info!("republished unchanged container {}", container);
                return Ok(true);
            }
        }

        // validate before anything under the root is written
        let incoming = ContainerStorage::open(src)?;
        if incoming.container() != container {
            return Err(StorageError::Malformed(format!(
                "files declare container {} but {} was requested",
                incoming.container(),
                container
            )));
        }
        drop(incoming);

        let generation = ContainerPaths::generation_dir(&self.root, container, &digest);
        let staged = self
            .stage_generation(container, src, digest)
            .and_then(|files| {
                self.records.upsert(files.record().clone())?;
                Ok(files)
            });
        let files = match staged {
            Ok(files) => files,
            Err(e) => {
                error!("failed to install container {}: {}", container, e);
                discard_generation(&generation);
                return Err(e);
            }
        };

        let published = files.publish();
        self.package_to_container
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if let Some(old) = self.containers.insert(container.to_string(), files) {
            if old.generation() != generation.as_path() {
                discard_generation(old.generation());
            }
        }
        published?;

        info!("installed storage for container {}", container);
        Ok(true)
    }

    /// Copies, restages and materializes a generation without touching what
    /// readers map or the record list.
    fn stage_generation(
        &self,
        container: &str,
        src: &StorageFilePaths,
        digest: String,
    ) -> Result<ContainerFiles, StorageError> {
        let mut files = ContainerFiles::stage(&self.root, container, src, digest)?;
        match self.containers.get(container) {
            Some(old) => {
                files.restage_from(old)?;
            }
            None => files.persist_overrides()?,
        }
        files.materialize_boot()?;
        Ok(files)
    }

    /// Container declaring `package`, platform containers first.
    pub fn find_container(&self, package: &str) -> Result<String, StorageError> {
        if let Some(container) = self
            .package_to_container
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(package)
        {
            return Ok(container.clone());
        }

        let platform = PLATFORM_CONTAINERS
            .iter()
            .filter_map(|c| self.containers.get_key_value(*c));
        let others = self
            .containers
            .iter()
            .filter(|(c, _)| !PLATFORM_CONTAINERS.contains(&c.as_str()));

        // a broken container may own the package; report it rather than a miss
        let mut first_error = None;
        for (container, files) in platform.chain(others) {
            match files.has_package(package) {
                Ok(true) => {
                    self.package_to_container
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(package.to_string(), container.clone());
                    return Ok(container.clone());
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("skipping container {} while looking for {}: {}", container, package, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.unwrap_or_else(|| StorageError::PackageNotFound {
            package: package.to_string(),
        }))
    }

    fn files_for(&self, package: &str) -> Result<(String, &ContainerFiles), StorageError> {
        let container = self.find_container(package)?;
        let files = self
            .containers
            .get(&container)
            .ok_or_else(|| StorageError::ContainerNotFound {
                container: container.clone(),
            })?;
        Ok((container, files))
    }

    fn files_for_mut(&mut self, package: &str) -> Result<(String, &mut ContainerFiles), StorageError> {
        let container = self.find_container(package)?;
        let files = self
            .containers
            .get_mut(&container)
            .ok_or_else(|| StorageError::ContainerNotFound {
                container: container.clone(),
            })?;
        Ok((container, files))
    }

    pub fn override_flag(
        &mut self,
        package: &str,
        flag: &str,
        value: &str,
        override_type: FlagOverrideType,
    ) -> Result<(), StorageError> {
        let value = parse_flag_value(value)?;
        let (container, files) = self.files_for_mut(package)?;
        files.stage_override(package, flag, value, override_type)?;
        info!(
            "staged {:?} override {}.{}={} in {}",
            override_type, package, flag, value, container
        );
        Ok(())
    }

    pub fn remove_local_override(
        &mut self,
        target: RemoveTarget<'_>,
        remove_type: RemoveOverrideType,
    ) -> Result<(), StorageError> {
        if remove_type == RemoveOverrideType::Unspecified {
            return Err(StorageError::InvalidRequest(
                "remove override type must be set".into(),
            ));
        }
        match target {
            RemoveTarget::Flag { package, flag } => {
                let (_, files) = self.files_for_mut(package)?;
                files.remove_local(package, Some(flag), remove_type)?;
            }
            RemoveTarget::Package(package) => {
                let (_, files) = self.files_for_mut(package)?;
                files.remove_local(package, None, remove_type)?;
            }
            RemoveTarget::All => {
                for files in self.containers.values_mut() {
                    files.remove_all_local(remove_type)?;
                }
            }
        }
        Ok(())
    }

    /// Discards staged overrides of one container, or of all of them.
    pub fn reset(&mut self, container: Option<&str>) -> Result<(), StorageError> {
        match container {
            Some(container) => {
                let files = self.containers.get_mut(container).ok_or_else(|| {
                    StorageError::ContainerNotFound {
                        container: container.to_string(),
                    }
                })?;
                files.reset()?;
            }
            None => {
                for files in self.containers.values_mut() {
                    files.reset()?;
                }
            }
        }
        info!("reset overrides for {}", container.unwrap_or("all containers"));
        Ok(())
    }

    pub fn query(&self, package: &str, flag: &str) -> Result<FlagSnapshot, StorageError> {
        let (_, files) = self.files_for(package)?;
        files
            .snapshot(package, flag)?
            .ok_or_else(|| StorageError::FlagNotFound {
                package: package.to_string(),
                flag: flag.to_string(),
            })
    }

    pub fn list(&self, selection: ListSelection<'_>) -> Result<Vec<FlagSnapshot>, StorageError> {
        match selection {
            ListSelection::All => {
                let mut flags = Vec::new();
                for (container, files) in &self.containers {
                    if !files.has_boot_copy() {
                        debug!("leaving unpublished container {} out of listing", container);
                        continue;
                    }
                    match files.list_flags(None) {
                        Ok(mut listed) => flags.append(&mut listed),
                        Err(e) => warn!("skipping container {} in listing: {}", container, e),
                    }
                }
                Ok(flags)
            }
            ListSelection::Container(container) => self
                .containers
                .get(container)
                .ok_or_else(|| StorageError::ContainerNotFound {
                    container: container.to_string(),
                })?
                .list_flags(None),
            ListSelection::Package(package) => {
                let (_, files) = self.files_for(package)?;
                files.list_flags(Some(package))
            }
        }
    }

    /// Writes `flags/ota.pb` for the next boot of `msg.build_id`.
    pub fn stage_ota(&self, msg: &OtaFlagStagingMessage) -> Result<(), StorageError> {
        if msg.build_id.is_empty() {
            return Err(StorageError::InvalidRequest("build id must be set".into()));
        }
        for entry in &msg.overrides {
            parse_flag_value(&entry.flag_value)?;
        }
        write_pb_to_file(msg, &self.ota_path())?;
        info!(
            "staged {} flags for build {}",
            msg.overrides.len(),
            msg.build_id
        );
        Ok(())
    }

    /// Applies the staged OTA flags as server overrides when `build_id`
    /// matches. Returns how many were applied.
    pub fn apply_ota(&mut self, build_id: Option<&str>) -> Result<usize, StorageError> {
        let path = self.ota_path();
        let staged: OtaFlagStagingMessage = read_pb_from_file(&path)?;
        if staged.build_id.is_empty() {
            remove_file_if_exists(&path)?;
            return Ok(0);
        }
        if build_id != Some(staged.build_id.as_str()) {
            info!(
                "keeping flags staged for build {} (running {})",
                staged.build_id,
                build_id.unwrap_or("unknown")
            );
            return Ok(0);
        }

        let mut applied = 0;
        for entry in &staged.overrides {
            let result = parse_flag_value(&entry.flag_value).and_then(|value| {
                let (_, files) = self.files_for_mut(&entry.package_name)?;
                files.stage_override(
                    &entry.package_name,
                    &entry.flag_name,
                    value,
                    FlagOverrideType::ServerOnReboot,
                )
            });
            match result {
                Ok(_) => applied += 1,
                Err(e) => warn!(
                    "dropping staged flag {}.{}: {}",
                    entry.package_name, entry.flag_name, e
                ),
            }
        }
        remove_file_if_exists(&path)?;
        info!("applied {} flags staged for build {}", applied, staged.build_id);
        Ok(applied)
    }

    /// Boot-time pass: applies OTA flags, folds immediate local overrides
    /// into on-reboot ones, then rewrites and republishes every boot copy.
    pub fn initialize_boot(&mut self, build_id: Option<&str>) -> Result<(), StorageError> {
        self.apply_ota(build_id)?;
        for (container, files) in self.containers.iter_mut() {
            let result = files
                .mark_local_applied()
                .and_then(|_| files.materialize_boot())
                .and_then(|_| files.publish());
            if let Err(e) = result {
                error!("failed to initialize boot values for {}: {}", container, e);
            }
        }
        self.records.persist()
    }
}

/// Removes a generation directory that is no longer, or never became, active.
fn discard_generation(generation: &Path) {
    match fs::remove_dir_all(generation) {
        Ok(()) => debug!("removed generation {}", generation.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("cannot remove generation {}: {}", generation.display(), e),
    }
}
