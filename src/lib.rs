//! Reader, resolver and persistence primitives for device feature-flag storage.
//!
//! A container owns four files: a package map, a flag map, a flag value list
//! and a flag info list. [`FlagResolver`] maps them and answers effective
//! values under override precedence; [`StorageRecords`] keeps the durable list
//! of active container generations for the daemon.
//!
//! # Examples
//! ```no_run
//! use std::path::Path;
//! use flagstore_lib::{FlagResolver, ResolveRequest};
//!
//! let resolver = FlagResolver::new(Path::new("/metadata/flagstore"));
//! let value = resolver
//!     .resolve(&ResolveRequest::new("com.android.settings", "new_ui", false))
//!     .map(|v| v.value)
//!     .unwrap_or(false);
//! ```

pub mod builder;
pub mod error;
pub mod flag_info;
pub mod flag_table;
pub mod flag_value;
pub mod format;
pub mod mapped;
pub mod package_table;
pub mod proto;
pub mod records;
pub mod resolver;
pub mod util;

pub use builder::{create_builder, StorageFilePaths, StorageFilesBuilder};
pub use error::{ErrorCode, StorageError};
pub use format::StoredFlagType;
pub use mapped::ContainerStorage;
pub use records::StorageRecords;
pub use resolver::{
    pick_value, reader_paths, EffectiveValue, FlagResolver, PackageTableCache, ResolveRequest,
    ValuePickedFrom, ValueSources, PLATFORM_CONTAINERS,
};

/// Parses a stored flag value. Only `"true"` and `"false"` are accepted.
pub fn parse_flag_value(value: &str) -> Result<bool, StorageError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(StorageError::InvalidFlagValue {
            value: other.to_string(),
        }),
    }
}

pub fn format_flag_value(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag_value() {
        assert!(parse_flag_value("true").unwrap());
        assert!(!parse_flag_value("false").unwrap());
        assert!(parse_flag_value("TRUE").is_err());
        assert!(parse_flag_value("1").is_err());
        assert_eq!(format_flag_value(true), "true");
    }
}
