use std::path::PathBuf;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use flagstore_lib::proto::{
    list_storage_message, remove_local_override_message, reset_storage_message,
    storage_request_message, storage_return_message, FlagOverrideMessage, FlagOverrideReturnMessage,
    FlagOverrideType, FlagQueryMessage, FlagQueryReturnMessage, ListStorageMessage,
    ListStorageReturnMessage, NewStorageMessage, NewStorageReturnMessage,
    OtaFlagStagingReturnMessage, RemoveLocalOverrideMessage, RemoveLocalOverrideReturnMessage,
    RemoveOverrideType, ResetStorageMessage, ResetStorageReturnMessage, StorageRequestMessage,
    StorageRequestMessages, StorageReturnMessage, StorageReturnMessages,
};
use flagstore_lib::{StorageError, StorageFilePaths};
use log::{debug, warn};

use super::config::DaemonConfig;
use super::manager::{ListSelection, RemoveTarget, StorageManager};
use super::storage_files::FlagSnapshot;

impl From<FlagSnapshot> for FlagQueryReturnMessage {
    fn from(snapshot: FlagSnapshot) -> Self {
        FlagQueryReturnMessage {
            package_name: snapshot.package,
            flag_name: snapshot.flag,
            server_flag_value: snapshot.server_value,
            local_flag_value: snapshot.local_value,
            boot_flag_value: snapshot.boot_value,
            default_flag_value: snapshot.default_value,
            has_server_override: snapshot.has_server_override,
            is_readwrite: snapshot.is_readwrite,
            has_local_override: snapshot.has_local_override,
            has_boot_local_override: snapshot.has_boot_local_override,
            container: snapshot.container,
        }
    }
}

/// Request dispatch over the storage manager. Mutations take the write
/// lock; queries and listings share the read lock.
pub struct FlagDaemon {
    manager: RwLock<StorageManager>,
}

impl FlagDaemon {
    pub fn open(config: &DaemonConfig) -> Result<Self, StorageError> {
        let manager = StorageManager::load(&config.root_dir(), &config.records_path())?;
        Ok(Self::new(manager))
    }

    pub fn new(manager: StorageManager) -> Self {
        Self {
            manager: RwLock::new(manager),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StorageManager> {
        self.manager.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StorageManager> {
        self.manager.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Boot-time materialization. Returns the number of containers.
    pub fn initialize(&self, build_id: Option<&str>) -> Result<usize, StorageError> {
        let mut manager = self.write();
        manager.initialize_boot(build_id)?;
        Ok(manager.containers().count())
    }

    pub fn handle_batch(&self, requests: StorageRequestMessages) -> StorageReturnMessages {
        StorageReturnMessages {
            msgs: requests
                .msgs
                .into_iter()
                .map(|request| self.handle_request(request))
                .collect(),
        }
    }

    pub fn handle_request(&self, request: StorageRequestMessage) -> StorageReturnMessage {
        match self.dispatch(request) {
            Ok(msg) => StorageReturnMessage::from_msg(msg),
            Err(e) => {
                warn!("request failed: {}", e);
                StorageReturnMessage::error(format!(
                    "failed to handle request: {}: {}",
                    e.code().as_str(),
                    e
                ))
            }
        }
    }

    fn dispatch(
        &self,
        request: StorageRequestMessage,
    ) -> Result<storage_return_message::Msg, StorageError> {
        use storage_request_message::Msg;
        use storage_return_message::Msg as Return;

        let msg = request
            .msg
            .ok_or_else(|| StorageError::InvalidRequest("empty request".into()))?;
        match msg {
            Msg::NewStorageMessage(msg) => self.new_storage(msg).map(Return::NewStorageMessage),
            Msg::FlagOverrideMessage(msg) => {
                self.flag_override(msg).map(Return::FlagOverrideMessage)
            }
            Msg::OtaStagingMessage(msg) => {
                self.read().stage_ota(&msg)?;
                Ok(Return::OtaStagingMessage(OtaFlagStagingReturnMessage {}))
            }
            Msg::FlagQueryMessage(msg) => self.flag_query(msg).map(Return::FlagQueryMessage),
            Msg::RemoveLocalOverrideMessage(msg) => self
                .remove_local_override(msg)
                .map(Return::RemoveLocalOverrideMessage),
            Msg::ResetStorageMessage(msg) => {
                self.reset_storage(msg).map(Return::ResetStorageMessage)
            }
            Msg::ListStorageMessage(msg) => self.list_storage(msg).map(Return::ListStorageMessage),
        }
    }

    fn new_storage(&self, msg: NewStorageMessage) -> Result<NewStorageReturnMessage, StorageError> {
        let paths = [&msg.package_map, &msg.flag_map, &msg.flag_value, &msg.flag_info];
        if msg.container.is_empty() || paths.iter().any(|p| p.is_empty()) {
            return Err(StorageError::InvalidRequest(
                "new storage needs a container and four file paths".into(),
            ));
        }
        let src = StorageFilePaths {
            package_map: PathBuf::from(&msg.package_map),
            flag_map: PathBuf::from(&msg.flag_map),
            flag_val: PathBuf::from(&msg.flag_value),
            flag_info: PathBuf::from(&msg.flag_info),
        };

        let storage_updated = self.write().add_or_update(&msg.container, &src)?;
        Ok(NewStorageReturnMessage { storage_updated })
    }

    fn flag_override(
        &self,
        msg: FlagOverrideMessage,
    ) -> Result<FlagOverrideReturnMessage, StorageError> {
        let override_type = FlagOverrideType::try_from(msg.override_type)
            .ok()
            .filter(|t| *t != FlagOverrideType::Unspecified)
            .ok_or_else(|| {
                StorageError::InvalidRequest(format!(
                    "unknown override type {}",
                    msg.override_type
                ))
            })?;
        self.write()
            .override_flag(&msg.package_name, &msg.flag_name, &msg.flag_value, override_type)?;
        Ok(FlagOverrideReturnMessage {})
    }

    fn flag_query(&self, msg: FlagQueryMessage) -> Result<FlagQueryReturnMessage, StorageError> {
        let snapshot = self.read().query(&msg.package_name, &msg.flag_name)?;
        debug!("queried {}.{}", msg.package_name, msg.flag_name);
        Ok(snapshot.into())
    }

    fn remove_local_override(
        &self,
        msg: RemoveLocalOverrideMessage,
    ) -> Result<RemoveLocalOverrideReturnMessage, StorageError> {
        use remove_local_override_message::Target;

        let remove_type = RemoveOverrideType::try_from(msg.remove_override_type).map_err(|_| {
            StorageError::InvalidRequest(format!(
                "unknown remove override type {}",
                msg.remove_override_type
            ))
        })?;
        let target = match &msg.target {
            Some(Target::Flag(selector)) => RemoveTarget::Flag {
                package: &selector.package_name,
                flag: &selector.flag_name,
            },
            Some(Target::PackageName(package)) => RemoveTarget::Package(package),
            Some(Target::All(true)) => RemoveTarget::All,
            Some(Target::All(false)) | None => {
                return Err(StorageError::InvalidRequest(
                    "remove local override needs a target".into(),
                ))
            }
        };
        self.write().remove_local_override(target, remove_type)?;
        Ok(RemoveLocalOverrideReturnMessage {})
    }

    fn reset_storage(
        &self,
        msg: ResetStorageMessage,
    ) -> Result<ResetStorageReturnMessage, StorageError> {
        use reset_storage_message::Msg;

        match msg.msg {
            Some(Msg::All(true)) => self.write().reset(None)?,
            Some(Msg::Container(container)) => self.write().reset(Some(&container))?,
            Some(Msg::All(false)) | None => {
                return Err(StorageError::InvalidRequest(
                    "reset storage needs a selection".into(),
                ))
            }
        }
        Ok(ResetStorageReturnMessage {})
    }

    fn list_storage(
        &self,
        msg: ListStorageMessage,
    ) -> Result<ListStorageReturnMessage, StorageError> {
        use list_storage_message::Msg;

        let manager = self.read();
        let flags = match &msg.msg {
            Some(Msg::All(true)) => manager.list(ListSelection::All)?,
            Some(Msg::Container(container)) => manager.list(ListSelection::Container(container))?,
            Some(Msg::PackageName(package)) => manager.list(ListSelection::Package(package))?,
            Some(Msg::All(false)) | None => {
                return Err(StorageError::InvalidRequest(
                    "list storage needs a selection".into(),
                ))
            }
        };
        Ok(ListStorageReturnMessage {
            flags: flags.into_iter().map(Into::into).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flagstore_lib::proto::{
        FlagOverride, FlagSelector, OtaFlagStagingMessage,
    };
    use flagstore_lib::{
        create_builder, EffectiveValue, FlagResolver, ResolveRequest, StoredFlagType,
        ValuePickedFrom,
    };
    use std::path::Path;

    struct Fixture {
        dir: tempfile::TempDir,
        daemon: FlagDaemon,
    }

    fn config(root: &Path) -> DaemonConfig {
        DaemonConfig {
            root_dir: root.display().to_string(),
            ..DaemonConfig::default()
        }
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().join("root");
            std::fs::create_dir_all(&root).unwrap();
            let daemon = FlagDaemon::open(&config(&root)).unwrap();
            Self { dir, daemon }
        }

        fn reopen(&self) -> FlagDaemon {
            FlagDaemon::open(&config(&self.dir.path().join("root"))).unwrap()
        }

        /// Resolves the way an independent reader process would.
        fn resolve(&self, req: &ResolveRequest<'_>) -> EffectiveValue {
            FlagResolver::new(&self.dir.path().join("root"))
                .resolve(req)
                .unwrap()
        }

        fn install_example(&self) -> StorageRequestMessage {
            let src = create_builder("com.example")
                .package("pkg.a")
                .package_id(3)
                .boolean_start_index(10)
                .fingerprint(0xABCD)
                .flag_at("f1", 2, false, StoredFlagType::ReadWriteBoolean)
                .flag_at("ro", 0, true, StoredFlagType::ReadOnlyBoolean)
                .write_to(&self.dir.path().join("install"))
                .unwrap();
            new_storage("com.example", &src)
        }

        fn send(&self, msg: storage_request_message::Msg) -> storage_return_message::Msg {
            self.daemon
                .handle_request(StorageRequestMessage::from_msg(msg))
                .msg
                .unwrap()
        }
    }

    fn new_storage(container: &str, src: &StorageFilePaths) -> StorageRequestMessage {
        StorageRequestMessage::from_msg(storage_request_message::Msg::NewStorageMessage(
            NewStorageMessage {
                container: container.to_string(),
                package_map: src.package_map.display().to_string(),
                flag_map: src.flag_map.display().to_string(),
                flag_value: src.flag_val.display().to_string(),
                flag_info: src.flag_info.display().to_string(),
            },
        ))
    }

    fn override_msg(flag: &str, value: &str, t: FlagOverrideType) -> storage_request_message::Msg {
        storage_request_message::Msg::FlagOverrideMessage(FlagOverrideMessage {
            package_name: "pkg.a".into(),
            flag_name: flag.into(),
            flag_value: value.into(),
            override_type: t as i32,
        })
    }

    fn query_msg(flag: &str) -> storage_request_message::Msg {
        storage_request_message::Msg::FlagQueryMessage(FlagQueryMessage {
            package_name: "pkg.a".into(),
            flag_name: flag.into(),
        })
    }

    fn expect_query(ret: storage_return_message::Msg) -> FlagQueryReturnMessage {
        match ret {
            storage_return_message::Msg::FlagQueryMessage(q) => q,
            _ => panic!("expected a flag query response"),
        }
    }

    fn expect_error(ret: storage_return_message::Msg) -> String {
        match ret {
            storage_return_message::Msg::ErrorMessage(e) => e,
            _ => panic!("expected an error response"),
        }
    }

    #[test]
    fn test_local_immediate_scenario() {
        let f = Fixture::new();
        f.daemon.handle_request(f.install_example());

        f.send(override_msg("f1", "true", FlagOverrideType::LocalImmediate));
        let q = expect_query(f.send(query_msg("f1")));
        assert_eq!(q.local_flag_value.as_deref(), Some("true"));
        assert!(q.has_local_override);
        assert_eq!(q.boot_flag_value, "false");
        assert_eq!(q.default_flag_value, "false");
        assert_eq!(q.container, "com.example");

        let value = f.resolve(&ResolveRequest::new("pkg.a", "f1", false));
        assert!(value.value);
        assert_eq!(value.picked_from, ValuePickedFrom::LocalImmediate);
        let fast = f.resolve(&ResolveRequest::new("pkg.a", "f1", false).with_fingerprint(0xABCD, 2));
        assert!(fast.value);

        let remove = storage_request_message::Msg::RemoveLocalOverrideMessage(
            RemoveLocalOverrideMessage {
                target: Some(remove_local_override_message::Target::Flag(FlagSelector {
                    package_name: "pkg.a".into(),
                    flag_name: "f1".into(),
                })),
                remove_override_type: RemoveOverrideType::RemoveLocalImmediate as i32,
            },
        );
        f.send(remove);
        let value = f.resolve(&ResolveRequest::new("pkg.a", "f1", true));
        assert!(!value.value);
        assert_eq!(value.picked_from, ValuePickedFrom::Default);
    }

    #[test]
    fn test_read_only_override_rejected() {
        let f = Fixture::new();
        f.daemon.handle_request(f.install_example());

        let err = expect_error(f.send(override_msg("ro", "false", FlagOverrideType::LocalImmediate)));
        assert!(err.starts_with("failed to handle request"));
        let value = f.resolve(&ResolveRequest::new("pkg.a", "ro", false));
        assert!(value.value);

        let err = expect_error(f.send(override_msg("f1", "yes", FlagOverrideType::LocalOnReboot)));
        assert!(err.contains("yes"));
    }

    #[test]
    fn test_new_storage_twice() {
        let f = Fixture::new();
        let request = f.install_example();
        let updated = |ret: StorageReturnMessage| match ret.msg {
            Some(storage_return_message::Msg::NewStorageMessage(m)) => m.storage_updated,
            _ => panic!("expected a new storage response"),
        };
        assert!(updated(f.daemon.handle_request(request.clone())));
        assert!(!updated(f.daemon.handle_request(request)));
    }

    #[test]
    fn test_batch_keeps_order_and_continues() {
        let f = Fixture::new();
        let batch = StorageRequestMessages {
            msgs: vec![
                f.install_example(),
                StorageRequestMessage::from_msg(query_msg("missing")),
                StorageRequestMessage::from_msg(query_msg("f1")),
                StorageRequestMessage { msg: None },
            ],
        };
        let returns = f.daemon.handle_batch(batch).msgs;
        assert_eq!(returns.len(), 4);
        assert!(returns[0].error_message().is_none());
        assert!(returns[1].error_message().is_some());
        assert_eq!(
            expect_query(returns[2].msg.clone().unwrap()).boot_flag_value,
            "false"
        );
        assert!(returns[3].error_message().is_some());
    }

    #[test]
    fn test_unknown_package_is_an_error() {
        let f = Fixture::new();
        f.daemon.handle_request(f.install_example());
        let msg = storage_request_message::Msg::FlagQueryMessage(FlagQueryMessage {
            package_name: "pkg.zz".into(),
            flag_name: "f1".into(),
        });
        let err = expect_error(f.send(msg));
        assert!(err.contains("ERROR_PACKAGE_NOT_FOUND"));
    }

    #[test]
    fn test_corrupted_container_query_reports_read_error() {
        let f = Fixture::new();
        f.daemon.handle_request(f.install_example());
        let generations = f.dir.path().join("root/generations/com.example");
        let generation = std::fs::read_dir(&generations)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        std::fs::write(generation.join("com.example.val"), b"garbage").unwrap();

        let daemon = f.reopen();
        let err = match daemon
            .handle_request(StorageRequestMessage::from_msg(query_msg("f1")))
            .msg
        {
            Some(ret) => expect_error(ret),
            None => panic!("expected a response"),
        };
        assert!(err.contains("ERROR_CANNOT_READ_STORAGE_FILE"));
        assert!(!err.contains("ERROR_PACKAGE_NOT_FOUND"));
    }

    #[test]
    fn test_failed_new_storage_keeps_installed_container() {
        let f = Fixture::new();
        f.daemon.handle_request(f.install_example());

        // the record list cannot be replaced while a directory sits in its place
        let records = f.dir.path().join("root/storage_records.pb");
        std::fs::remove_file(&records).unwrap();
        std::fs::create_dir(&records).unwrap();
        std::fs::write(records.join("keep"), b"x").unwrap();

        let src = create_builder("com.example")
            .package("pkg.a")
            .package_id(3)
            .boolean_start_index(10)
            .fingerprint(0xABCD)
            .flag_at("f1", 2, true, StoredFlagType::ReadWriteBoolean)
            .flag_at("ro", 0, true, StoredFlagType::ReadOnlyBoolean)
            .flag_at("f2", 1, true, StoredFlagType::ReadWriteBoolean)
            .write_to(&f.dir.path().join("install.v2"))
            .unwrap();
        let err = expect_error(
            f.daemon
                .handle_request(new_storage("com.example", &src))
                .msg
                .unwrap(),
        );
        assert!(err.starts_with("failed to handle request"));

        let q = expect_query(f.send(query_msg("f1")));
        assert_eq!(q.default_flag_value, "false");
        assert_eq!(q.boot_flag_value, "false");
        assert!(!f.resolve(&ResolveRequest::new("pkg.a", "f1", false)).value);
        let generations = f.dir.path().join("root/generations/com.example");
        assert_eq!(std::fs::read_dir(&generations).unwrap().count(), 1);
    }

    #[test]
    fn test_reset_and_list() {
        let f = Fixture::new();
        f.daemon.handle_request(f.install_example());
        f.send(override_msg("f1", "true", FlagOverrideType::ServerOnReboot));
        f.send(override_msg("f1", "true", FlagOverrideType::LocalImmediate));

        let list = |msg: list_storage_message::Msg| {
            match f.send(storage_request_message::Msg::ListStorageMessage(
                ListStorageMessage { msg: Some(msg) },
            )) {
                storage_return_message::Msg::ListStorageMessage(l) => l.flags,
                _ => panic!("expected a list response"),
            }
        };
        let flags = list(list_storage_message::Msg::PackageName("pkg.a".into()));
        assert_eq!(flags.len(), 2);
        assert_eq!(flags[0].flag_name, "f1");
        assert_eq!(flags[0].server_flag_value.as_deref(), Some("true"));
        assert_eq!(list(list_storage_message::Msg::All(true)).len(), 2);
        assert_eq!(
            list(list_storage_message::Msg::Container("com.example".into())).len(),
            2
        );

        f.send(storage_request_message::Msg::ResetStorageMessage(
            ResetStorageMessage {
                msg: Some(reset_storage_message::Msg::Container("com.example".into())),
            },
        ));
        let q = expect_query(f.send(query_msg("f1")));
        assert!(!q.has_local_override);
        assert!(!q.has_server_override);
        assert!(!f.resolve(&ResolveRequest::new("pkg.a", "f1", false)).value);
    }

    #[test]
    fn test_ota_staging_applied_at_init() {
        let f = Fixture::new();
        f.daemon.handle_request(f.install_example());
        f.send(storage_request_message::Msg::OtaStagingMessage(
            OtaFlagStagingMessage {
                build_id: "build.2".into(),
                overrides: vec![FlagOverride {
                    package_name: "pkg.a".into(),
                    flag_name: "f1".into(),
                    flag_value: "true".into(),
                    override_type: FlagOverrideType::ServerOnReboot as i32,
                }],
            },
        ));

        let daemon = f.reopen();
        daemon.initialize(Some("build.2")).unwrap();
        let value = f.resolve(&ResolveRequest::new("pkg.a", "f1", false));
        assert!(value.value);
        assert_eq!(value.picked_from, ValuePickedFrom::ServerOnReboot);
    }
}
