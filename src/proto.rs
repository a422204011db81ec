//! Protobuf messages for the daemon socket and the files it persists.

/// How a staged value is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FlagOverrideType {
    Unspecified = 0,
    LocalImmediate = 1,
    LocalOnReboot = 2,
    ServerOnReboot = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RemoveOverrideType {
    Unspecified = 0,
    RemoveLocalImmediate = 1,
    RemoveLocalOnReboot = 2,
}

// ── Persisted state ─────────────────────────────────

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct FlagOverride {
    #[prost(string, tag = "1")]
    pub package_name: String,
    #[prost(string, tag = "2")]
    pub flag_name: String,
    #[prost(string, tag = "3")]
    pub flag_value: String,
    #[prost(enumeration = "FlagOverrideType", tag = "4")]
    pub override_type: i32,
}

/// Local or server overrides of one container.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct LocalFlagOverrides {
    #[prost(message, repeated, tag = "1")]
    pub overrides: Vec<FlagOverride>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct PersistStorageRecord {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub container: String,
    #[prost(string, tag = "3")]
    pub package_map: String,
    #[prost(string, tag = "4")]
    pub flag_map: String,
    #[prost(string, tag = "5")]
    pub flag_val: String,
    #[prost(string, tag = "6")]
    pub digest: String,
    #[prost(string, tag = "7")]
    pub flag_info: String,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct PersistStorageRecords {
    #[prost(message, repeated, tag = "1")]
    pub records: Vec<PersistStorageRecord>,
}

// ── Requests ────────────────────────────────────────

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct NewStorageMessage {
    #[prost(string, tag = "1")]
    pub container: String,
    #[prost(string, tag = "2")]
    pub package_map: String,
    #[prost(string, tag = "3")]
    pub flag_map: String,
    #[prost(string, tag = "4")]
    pub flag_value: String,
    #[prost(string, tag = "5")]
    pub flag_info: String,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct FlagOverrideMessage {
    #[prost(string, tag = "1")]
    pub package_name: String,
    #[prost(string, tag = "2")]
    pub flag_name: String,
    #[prost(string, tag = "3")]
    pub flag_value: String,
    #[prost(enumeration = "FlagOverrideType", tag = "4")]
    pub override_type: i32,
}

/// Overrides that only apply once the device runs `build_id`.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct OtaFlagStagingMessage {
    #[prost(string, tag = "1")]
    pub build_id: String,
    #[prost(message, repeated, tag = "2")]
    pub overrides: Vec<FlagOverride>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct FlagQueryMessage {
    #[prost(string, tag = "1")]
    pub package_name: String,
    #[prost(string, tag = "2")]
    pub flag_name: String,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct FlagSelector {
    #[prost(string, tag = "1")]
    pub package_name: String,
    #[prost(string, tag = "2")]
    pub flag_name: String,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct RemoveLocalOverrideMessage {
    #[prost(oneof = "remove_local_override_message::Target", tags = "1, 2, 3")]
    pub target: Option<remove_local_override_message::Target>,
    #[prost(enumeration = "RemoveOverrideType", tag = "4")]
    pub remove_override_type: i32,
}

pub mod remove_local_override_message {
    #[derive(Clone, PartialEq, Eq, ::prost::Oneof)]
    pub enum Target {
        #[prost(message, tag = "1")]
        Flag(super::FlagSelector),
        #[prost(string, tag = "2")]
        PackageName(String),
        #[prost(bool, tag = "3")]
        All(bool),
    }
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ResetStorageMessage {
    #[prost(oneof = "reset_storage_message::Msg", tags = "1, 2")]
    pub msg: Option<reset_storage_message::Msg>,
}

pub mod reset_storage_message {
    #[derive(Clone, PartialEq, Eq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(bool, tag = "1")]
        All(bool),
        #[prost(string, tag = "2")]
        Container(String),
    }
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ListStorageMessage {
    #[prost(oneof = "list_storage_message::Msg", tags = "1, 2, 3")]
    pub msg: Option<list_storage_message::Msg>,
}

pub mod list_storage_message {
    #[derive(Clone, PartialEq, Eq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(bool, tag = "1")]
        All(bool),
        #[prost(string, tag = "2")]
        Container(String),
        #[prost(string, tag = "3")]
        PackageName(String),
    }
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct StorageRequestMessage {
    #[prost(oneof = "storage_request_message::Msg", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub msg: Option<storage_request_message::Msg>,
}

pub mod storage_request_message {
    #[derive(Clone, PartialEq, Eq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        NewStorageMessage(super::NewStorageMessage),
        #[prost(message, tag = "2")]
        FlagOverrideMessage(super::FlagOverrideMessage),
        #[prost(message, tag = "3")]
        OtaStagingMessage(super::OtaFlagStagingMessage),
        #[prost(message, tag = "4")]
        FlagQueryMessage(super::FlagQueryMessage),
        #[prost(message, tag = "5")]
        RemoveLocalOverrideMessage(super::RemoveLocalOverrideMessage),
        #[prost(message, tag = "6")]
        ResetStorageMessage(super::ResetStorageMessage),
        #[prost(message, tag = "7")]
        ListStorageMessage(super::ListStorageMessage),
    }
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct StorageRequestMessages {
    #[prost(message, repeated, tag = "1")]
    pub msgs: Vec<StorageRequestMessage>,
}

// ── Responses ───────────────────────────────────────

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct NewStorageReturnMessage {
    #[prost(bool, tag = "1")]
    pub storage_updated: bool,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct FlagOverrideReturnMessage {}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct OtaFlagStagingReturnMessage {}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct FlagQueryReturnMessage {
    #[prost(string, tag = "1")]
    pub package_name: String,
    #[prost(string, tag = "2")]
    pub flag_name: String,
    #[prost(string, optional, tag = "3")]
    pub server_flag_value: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub local_flag_value: Option<String>,
    #[prost(string, tag = "5")]
    pub boot_flag_value: String,
    #[prost(string, tag = "6")]
    pub default_flag_value: String,
    #[prost(bool, tag = "7")]
    pub has_server_override: bool,
    #[prost(bool, tag = "8")]
    pub is_readwrite: bool,
    #[prost(bool, tag = "9")]
    pub has_local_override: bool,
    #[prost(bool, tag = "10")]
    pub has_boot_local_override: bool,
    #[prost(string, tag = "11")]
    pub container: String,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct RemoveLocalOverrideReturnMessage {}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ResetStorageReturnMessage {}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ListStorageReturnMessage {
    #[prost(message, repeated, tag = "1")]
    pub flags: Vec<FlagQueryReturnMessage>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct StorageReturnMessage {
    #[prost(oneof = "storage_return_message::Msg", tags = "1, 2, 3, 4, 5, 6, 7, 8")]
    pub msg: Option<storage_return_message::Msg>,
}

pub mod storage_return_message {
    #[derive(Clone, PartialEq, Eq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        NewStorageMessage(super::NewStorageReturnMessage),
        #[prost(message, tag = "2")]
        FlagOverrideMessage(super::FlagOverrideReturnMessage),
        #[prost(message, tag = "3")]
        OtaStagingMessage(super::OtaFlagStagingReturnMessage),
        #[prost(message, tag = "4")]
        FlagQueryMessage(super::FlagQueryReturnMessage),
        #[prost(message, tag = "5")]
        RemoveLocalOverrideMessage(super::RemoveLocalOverrideReturnMessage),
        #[prost(message, tag = "6")]
        ResetStorageMessage(super::ResetStorageReturnMessage),
        #[prost(message, tag = "7")]
        ListStorageMessage(super::ListStorageReturnMessage),
        #[prost(string, tag = "8")]
        ErrorMessage(String),
    }
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct StorageReturnMessages {
    #[prost(message, repeated, tag = "1")]
    pub msgs: Vec<StorageReturnMessage>,
}

impl StorageReturnMessage {
    pub fn from_msg(msg: storage_return_message::Msg) -> Self {
        Self { msg: Some(msg) }
    }

    pub fn error(message: String) -> Self {
        Self::from_msg(storage_return_message::Msg::ErrorMessage(message))
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.msg {
            Some(storage_return_message::Msg::ErrorMessage(e)) => Some(e),
            _ => None,
        }
    }
}

impl StorageRequestMessage {
    pub fn from_msg(msg: storage_request_message::Msg) -> Self {
        Self { msg: Some(msg) }
    }
}
