use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, error, warn};

use crate::builder::StorageFilePaths;
use crate::error::StorageError;
use crate::mapped::ContainerStorage;
use crate::package_table::PackageInfo;

/// Searched before any other container, in this order. A package declared in
/// one of these shadows a same-named package elsewhere.
pub const PLATFORM_CONTAINERS: [&str; 3] = ["system", "product", "vendor"];

/// Which source the effective value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValuePickedFrom {
    LocalImmediate,
    LocalOnReboot,
    ServerOnReboot,
    /// The value stored in the value file.
    Default,
    /// The flag is not in storage; the caller's default was returned.
    CallerDefault,
}

impl ValuePickedFrom {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValuePickedFrom::LocalImmediate => "local",
            ValuePickedFrom::LocalOnReboot => "local (staged)",
            ValuePickedFrom::ServerOnReboot => "server",
            ValuePickedFrom::Default => "default",
            ValuePickedFrom::CallerDefault => "caller default",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueSources {
    pub local_immediate: Option<bool>,
    pub local_on_reboot: Option<bool>,
    pub server_on_reboot: Option<bool>,
    pub default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub value: bool,
    pub picked_from: ValuePickedFrom,
    /// A local value was present on a read-only flag and was skipped.
    pub ignored_local_override: bool,
}

/// Applies override precedence: local immediate, then local on reboot, then
/// server on reboot, then the stored default. Local values never apply to
/// read-only flags.
pub fn pick_value(sources: &ValueSources, is_readwrite: bool) -> Resolution {
    let has_local = sources.local_immediate.is_some() || sources.local_on_reboot.is_some();
    let local = if is_readwrite {
        sources
            .local_immediate
            .map(|v| (v, ValuePickedFrom::LocalImmediate))
            .or(sources
                .local_on_reboot
                .map(|v| (v, ValuePickedFrom::LocalOnReboot)))
    } else {
        None
    };
    let (value, picked_from) = local
        .or(sources
            .server_on_reboot
            .map(|v| (v, ValuePickedFrom::ServerOnReboot)))
        .unwrap_or((sources.default, ValuePickedFrom::Default));
    Resolution {
        value,
        picked_from,
        ignored_local_override: has_local && !is_readwrite,
    }
}

/// Files a reader maps under `root`: the tables under `maps/`, the live
/// values under `boot/`.
pub fn reader_paths(root: &Path, container: &str) -> StorageFilePaths {
    let maps = StorageFilePaths::in_dir(&root.join("maps"), container);
    let boot = StorageFilePaths::in_dir(&root.join("boot"), container);
    StorageFilePaths {
        package_map: maps.package_map,
        flag_map: maps.flag_map,
        flag_val: boot.flag_val,
        flag_info: boot.flag_info,
    }
}

/// Mapped read contexts per container, filled on first use.
pub struct PackageTableCache {
    root: PathBuf,
    contexts: RwLock<HashMap<String, Arc<ContainerStorage>>>,
}

impl PackageTableCache {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            contexts: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn reader_paths(&self, container: &str) -> StorageFilePaths {
        reader_paths(&self.root, container)
    }

    pub fn get(&self, container: &str) -> Result<Arc<ContainerStorage>, StorageError> {
        if let Some(storage) = self
            .contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(container)
        {
            return Ok(Arc::clone(storage));
        }

        if !self.root.is_dir() {
            return Err(StorageError::StorageSystemNotFound {
                path: self.root.display().to_string(),
            });
        }
        let paths = self.reader_paths(container);
        if !paths.package_map.exists() {
            return Err(StorageError::ContainerNotFound {
                container: container.to_string(),
            });
        }
        let storage = Arc::new(ContainerStorage::open(&paths)?);
        debug!("cached read context for container {}", container);

        let mut contexts = self.contexts.write().unwrap_or_else(PoisonError::into_inner);
        let entry = contexts
            .entry(container.to_string())
            .or_insert_with(|| Arc::clone(&storage));
        Ok(Arc::clone(entry))
    }

    pub fn invalidate(&self, container: &str) {
        let removed = self
            .contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(container);
        if removed.is_some() {
            debug!("invalidated read context for container {}", container);
        }
    }

    pub fn invalidate_all(&self) {
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_cached(&self, container: &str) -> bool {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(container)
    }

    /// Platform containers that exist, then every other `maps/*.package.map` by name.
    pub fn search_order(&self) -> Result<Vec<String>, StorageError> {
        let maps_dir = self.root.join("maps");
        let entries = fs::read_dir(&maps_dir).map_err(|_| StorageError::StorageSystemNotFound {
            path: maps_dir.display().to_string(),
        })?;

        let mut others = Vec::new();
        let mut present = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&maps_dir, e))?;
            let name = entry.file_name();
            let Some(container) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".package.map"))
            else {
                continue;
            };
            if PLATFORM_CONTAINERS.contains(&container) {
                present.push(container.to_string());
            } else {
                others.push(container.to_string());
            }
        }
        others.sort();

        let mut order: Vec<String> = PLATFORM_CONTAINERS
            .iter()
            .filter(|c| present.iter().any(|p| p == *c))
            .map(|c| c.to_string())
            .collect();
        order.extend(others);
        Ok(order)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupPath {
    Fingerprint,
    Name,
}

#[derive(Debug)]
pub struct EffectiveValue {
    pub value: bool,
    /// Read from the info bits next to the value. The daemon writes values
    /// with precedence already applied, so any local bit reports
    /// `LocalImmediate`.
    pub picked_from: ValuePickedFrom,
    pub lookup: LookupPath,
    /// Set when a local override on a read-only flag was ignored.
    pub inconsistency: Option<StorageError>,
}

/// Arguments of [`FlagResolver::resolve`].
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub container: Option<&'a str>,
    pub package: &'a str,
    pub flag: &'a str,
    pub default: bool,
    /// Compiled-in `(fingerprint, flag_index)` for the fast path.
    pub fast_path: Option<(u64, u16)>,
}

impl<'a> ResolveRequest<'a> {
    pub fn new(package: &'a str, flag: &'a str, default: bool) -> Self {
        Self {
            container: None,
            package,
            flag,
            default,
            fast_path: None,
        }
    }

    pub fn in_container(mut self, container: &'a str) -> Self {
        self.container = Some(container);
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: u64, flag_index: u16) -> Self {
        self.fast_path = Some((fingerprint, flag_index));
        self
    }
}

#[derive(Debug, Clone)]
pub struct LocatedPackage {
    pub container: String,
    pub package: String,
    pub info: PackageInfo,
    storage: Arc<ContainerStorage>,
}

/// A package whose on-disk fingerprint matched the caller's. Only this type
/// can read values by dense index.
pub struct IndexedPackage<'r> {
    located: LocatedPackage,
    resolver: &'r FlagResolver,
}

impl IndexedPackage<'_> {
    pub fn container(&self) -> &str {
        &self.located.container
    }

    pub fn info(&self) -> PackageInfo {
        self.located.info
    }

    pub fn value_at(&self, flag_index: u16) -> Result<EffectiveValue, StorageError> {
        self.resolver.evaluate(
            &self.located,
            flag_index,
            &format!("#{}", flag_index),
            LookupPath::Fingerprint,
        )
    }
}

/// Answers "what is the effective value of this flag" from mapped storage.
/// Values the daemon rewrites in place are seen through existing mappings.
pub struct FlagResolver {
    cache: PackageTableCache,
}

impl FlagResolver {
    pub fn new(root: &Path) -> Self {
        Self {
            cache: PackageTableCache::new(root),
        }
    }

    pub fn cache(&self) -> &PackageTableCache {
        &self.cache
    }

    /// Finds the container declaring `package`. With no explicit container the
    /// platform containers are tried first, then the rest by name.
    pub fn locate_package(
        &self,
        container: Option<&str>,
        package: &str,
    ) -> Result<LocatedPackage, StorageError> {
        if let Some(container) = container {
            let storage = self.cache.get(container)?;
            return match storage.find_package(package)? {
                Some(info) => Ok(LocatedPackage {
                    container: container.to_string(),
                    package: package.to_string(),
                    info,
                    storage,
                }),
                None => Err(StorageError::PackageNotFound {
                    package: package.to_string(),
                }),
            };
        }

        let mut first_error = None;
        for candidate in self.cache.search_order()? {
            let found = self
                .cache
                .get(&candidate)
                .and_then(|storage| Ok((storage.find_package(package)?, storage)));
            match found {
                Ok((Some(info), storage)) => {
                    return Ok(LocatedPackage {
                        container: candidate,
                        package: package.to_string(),
                        info,
                        storage,
                    })
                }
                Ok((None, _)) => {}
                Err(e) => {
                    warn!("skipping container {} while looking for {}: {}", candidate, package, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.unwrap_or_else(|| StorageError::PackageNotFound {
            package: package.to_string(),
        }))
    }

    /// Fast-path entry: fails with `FileFingerprintMismatch` when the
    /// caller's fingerprint is stale.
    pub fn load_indexed(
        &self,
        container: Option<&str>,
        package: &str,
        fingerprint: u64,
    ) -> Result<IndexedPackage<'_>, StorageError> {
        let located = self.locate_package(container, package)?;
        self.check_fingerprint(located, fingerprint)
    }

    fn check_fingerprint(
        &self,
        located: LocatedPackage,
        fingerprint: u64,
    ) -> Result<IndexedPackage<'_>, StorageError> {
        if located.info.fingerprint != fingerprint {
            return Err(StorageError::FileFingerprintMismatch {
                package: located.package,
                expected: fingerprint,
                actual: located.info.fingerprint,
            });
        }
        Ok(IndexedPackage {
            located,
            resolver: self,
        })
    }

    pub fn resolve(&self, req: &ResolveRequest<'_>) -> Result<EffectiveValue, StorageError> {
        let located = self.locate_package(req.container, req.package)?;

        if let Some((fingerprint, flag_index)) = req.fast_path {
            match self.check_fingerprint(located.clone(), fingerprint) {
                Ok(indexed) => return indexed.value_at(flag_index),
                Err(e) => debug!("falling back to name lookup: {}", e),
            }
        }

        match located.storage.find_flag(located.info.package_id, req.flag)? {
            Some(entry) => self.evaluate(&located, entry.flag_index, req.flag, LookupPath::Name),
            None => Ok(EffectiveValue {
                value: req.default,
                picked_from: ValuePickedFrom::CallerDefault,
                lookup: LookupPath::Name,
                inconsistency: None,
            }),
        }
    }

    fn evaluate(
        &self,
        located: &LocatedPackage,
        flag_index: u16,
        flag: &str,
        lookup: LookupPath,
    ) -> Result<EffectiveValue, StorageError> {
        let offset = located
            .info
            .boolean_start_index
            .checked_add(flag_index as u32)
            .ok_or_else(|| StorageError::Malformed(format!("flag index {} overflows", flag_index)))?;
        let value = located.storage.value(offset)?;
        let info = located.storage.info(offset)?;
        let sources = ValueSources {
            local_immediate: info.has_local_override().then_some(value),
            server_on_reboot: info.has_server_override().then_some(value),
            default: value,
            ..ValueSources::default()
        };
        let resolution = pick_value(&sources, info.is_readwrite());

        let inconsistency = if resolution.ignored_local_override {
            error!(
                "local override bit set on read only flag {}.{} in {}",
                located.package, flag, located.container
            );
            Some(StorageError::FlagIsReadOnly {
                package: located.package.clone(),
                flag: flag.to_string(),
            })
        } else {
            None
        };

        Ok(EffectiveValue {
            value: resolution.value,
            picked_from: resolution.picked_from,
            lookup,
            inconsistency,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{create_builder, encode_flag_infos, encode_flag_values};
    use crate::error::ErrorCode;
    use crate::flag_info::FlagInfoBits;
    use crate::format::StoredFlagType;

    /// Writes maps and boot copies of a container the way the daemon lays them out.
    fn install(root: &Path, builder: crate::builder::StorageFilesBuilder) {
        let files = builder.write_to(&root.join("maps")).unwrap();
        let boot = root.join("boot");
        fs::create_dir_all(&boot).unwrap();
        let name = files.flag_val.file_name().unwrap().to_owned();
        fs::rename(&files.flag_val, boot.join(name)).unwrap();
        let name = files.flag_info.file_name().unwrap().to_owned();
        fs::rename(&files.flag_info, boot.join(name)).unwrap();
    }

    fn example_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        install(
            dir.path(),
            create_builder("com.example")
                .package("pkg.a")
                .package_id(3)
                .boolean_start_index(10)
                .fingerprint(0xABCD)
                .flag_at("f1", 2, false, StoredFlagType::ReadWriteBoolean)
                .flag_at("f0", 0, true, StoredFlagType::ReadOnlyBoolean),
        );
        dir
    }

    #[test]
    fn test_pick_value_precedence() {
        let mut sources = ValueSources {
            default: false,
            ..Default::default()
        };
        assert_eq!(pick_value(&sources, true).picked_from, ValuePickedFrom::Default);

        sources.server_on_reboot = Some(true);
        let r = pick_value(&sources, true);
        assert_eq!((r.value, r.picked_from), (true, ValuePickedFrom::ServerOnReboot));

        sources.local_on_reboot = Some(false);
        let r = pick_value(&sources, true);
        assert_eq!((r.value, r.picked_from), (false, ValuePickedFrom::LocalOnReboot));

        sources.local_immediate = Some(true);
        let r = pick_value(&sources, true);
        assert_eq!((r.value, r.picked_from), (true, ValuePickedFrom::LocalImmediate));
        assert!(!r.ignored_local_override);
    }

    #[test]
    fn test_pick_value_read_only_ignores_local() {
        let sources = ValueSources {
            local_immediate: Some(true),
            server_on_reboot: Some(false),
            default: true,
            ..Default::default()
        };
        let r = pick_value(&sources, false);
        assert_eq!((r.value, r.picked_from), (false, ValuePickedFrom::ServerOnReboot));
        assert!(r.ignored_local_override);
    }

    #[test]
    fn test_fast_and_slow_paths_agree() {
        let root = tempfile::tempdir().unwrap();
        install(
            root.path(),
            create_builder("system")
                .package("com.android.a")
                .flag("x", true, StoredFlagType::ReadWriteBoolean)
                .flag("y", false, StoredFlagType::ReadWriteBoolean)
                .package("com.android.b")
                .flag("z", true, StoredFlagType::ReadOnlyBoolean),
        );
        let resolver = FlagResolver::new(root.path());
        let cases = [("com.android.a", "x", 0u16), ("com.android.a", "y", 1), ("com.android.b", "z", 0)];
        for (package, flag, index) in cases {
            let fingerprint = resolver.locate_package(None, package).unwrap().info.fingerprint;
            let slow = resolver
                .resolve(&ResolveRequest::new(package, flag, false))
                .unwrap();
            let fast = resolver
                .resolve(&ResolveRequest::new(package, flag, false).with_fingerprint(fingerprint, index))
                .unwrap();
            assert_eq!(slow.value, fast.value);
            assert_eq!(slow.lookup, LookupPath::Name);
            assert_eq!(fast.lookup, LookupPath::Fingerprint);
        }
    }

    #[test]
    fn test_fingerprint_mismatch_falls_back_to_name() {
        let root = example_root();
        let resolver = FlagResolver::new(root.path());

        let err = resolver
            .load_indexed(Some("com.example"), "pkg.a", 0x1234)
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::FileFingerprintMismatch);

        // index 0 holds f0 (true); a stale index must not be used
        let value = resolver
            .resolve(&ResolveRequest::new("pkg.a", "f1", true).with_fingerprint(0x1234, 0))
            .unwrap();
        assert!(!value.value);
        assert_eq!(value.lookup, LookupPath::Name);

        let indexed = resolver.load_indexed(None, "pkg.a", 0xABCD).unwrap();
        assert_eq!(indexed.container(), "com.example");
        assert_eq!(indexed.info().boolean_start_index, 10);
        assert!(indexed.value_at(0).unwrap().value);
        assert!(!indexed.value_at(2).unwrap().value);
    }

    #[test]
    fn test_missing_flag_returns_caller_default() {
        let root = example_root();
        let resolver = FlagResolver::new(root.path());
        let value = resolver
            .resolve(&ResolveRequest::new("pkg.a", "nope", true))
            .unwrap();
        assert!(value.value);
        assert_eq!(value.picked_from, ValuePickedFrom::CallerDefault);

        let err = resolver
            .resolve(&ResolveRequest::new("pkg.missing", "f1", true))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PackageNotFound);

        let err = resolver
            .resolve(&ResolveRequest::new("pkg.a", "f1", true).in_container("vendor"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ContainerNotFound);
    }

    fn rewrite_in_place(root: &Path, values: &[bool], infos: &[FlagInfoBits]) {
        let paths = reader_paths(root, "com.example");
        crate::util::write_in_place(&paths.flag_val, &encode_flag_values("com.example", values))
            .unwrap();
        crate::util::write_in_place(&paths.flag_info, &encode_flag_infos("com.example", infos))
            .unwrap();
    }

    fn example_infos() -> Vec<FlagInfoBits> {
        let mut infos = vec![FlagInfoBits::default(); 13];
        infos[12] = FlagInfoBits::new(true, false, false);
        infos
    }

    #[test]
    fn test_in_place_local_value_seen_by_cached_reader() {
        let root = example_root();
        let resolver = FlagResolver::new(root.path());
        let req = ResolveRequest::new("pkg.a", "f1", false);
        assert!(!resolver.resolve(&req).unwrap().value);
        assert!(resolver.cache().is_cached("com.example"));

        let mut values = vec![false; 13];
        values[10] = true;
        values[12] = true;
        let mut infos = example_infos();
        infos[12] = FlagInfoBits::new(true, false, true);
        rewrite_in_place(root.path(), &values, &infos);

        let value = resolver.resolve(&req).unwrap();
        assert!(value.value);
        assert_eq!(value.picked_from, ValuePickedFrom::LocalImmediate);

        values[12] = false;
        infos[12] = FlagInfoBits::new(true, true, false);
        rewrite_in_place(root.path(), &values, &infos);
        let value = resolver.resolve(&req).unwrap();
        assert!(!value.value);
        assert_eq!(value.picked_from, ValuePickedFrom::ServerOnReboot);
    }

    #[test]
    fn test_local_bit_on_read_only_flag_reported() {
        let root = example_root();
        let mut values = vec![false; 13];
        values[10] = true;
        let mut infos = example_infos();
        infos[10] = FlagInfoBits::new(false, false, true);
        rewrite_in_place(root.path(), &values, &infos);

        let resolver = FlagResolver::new(root.path());
        let value = resolver
            .resolve(&ResolveRequest::new("pkg.a", "f0", false))
            .unwrap();
        assert!(value.value);
        assert_eq!(value.picked_from, ValuePickedFrom::Default);
        assert_eq!(
            value.inconsistency.map(|e| e.code()),
            Some(ErrorCode::Generic)
        );
    }

    #[test]
    fn test_platform_containers_win() {
        let root = tempfile::tempdir().unwrap();
        install(
            root.path(),
            create_builder("aaa.mainline")
                .package("com.shared")
                .flag("f", false, StoredFlagType::ReadWriteBoolean),
        );
        install(
            root.path(),
            create_builder("vendor")
                .package("com.shared")
                .flag("f", true, StoredFlagType::ReadWriteBoolean),
        );
        install(
            root.path(),
            create_builder("product")
                .package("com.product")
                .flag("g", true, StoredFlagType::ReadWriteBoolean),
        );
        let resolver = FlagResolver::new(root.path());
        assert_eq!(
            resolver.cache().search_order().unwrap(),
            vec!["product", "vendor", "aaa.mainline"]
        );
        let located = resolver.locate_package(None, "com.shared").unwrap();
        assert_eq!(located.container, "vendor");
        assert!(resolver
            .resolve(&ResolveRequest::new("com.shared", "f", false))
            .unwrap()
            .value);
    }

    #[test]
    fn test_cache_invalidation() {
        let root = example_root();
        let resolver = FlagResolver::new(root.path());
        let req = ResolveRequest::new("pkg.a", "f1", false);
        assert!(!resolver.resolve(&req).unwrap().value);
        assert!(resolver.cache().is_cached("com.example"));

        // replace the boot values by rename, as the daemon does
        let mut values = vec![false; 13];
        values[12] = true;
        let paths = resolver.cache().reader_paths("com.example");
        crate::util::write_atomic(&paths.flag_val, &encode_flag_values("com.example", &values))
            .unwrap();
        let infos = vec![FlagInfoBits::new(true, false, true); 13];
        crate::util::write_atomic(&paths.flag_info, &encode_flag_infos("com.example", &infos))
            .unwrap();

        // the old mapping still serves the old generation
        assert!(!resolver.resolve(&req).unwrap().value);

        resolver.cache().invalidate("com.example");
        assert!(!resolver.cache().is_cached("com.example"));
        assert!(resolver.resolve(&req).unwrap().value);
    }

    #[test]
    fn test_missing_root() {
        let root = tempfile::tempdir().unwrap();
        let resolver = FlagResolver::new(&root.path().join("absent"));
        let err = resolver
            .resolve(&ResolveRequest::new("pkg.a", "f1", false))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageSystemNotFound);
    }
}
