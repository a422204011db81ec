use std::io;
use std::path::Path;

use thiserror::Error;

/// Coarse error classes reported to readers of the flag storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    PackageNotFound,
    ContainerNotFound,
    CannotReadStorageFile,
    FileFingerprintMismatch,
    StorageSystemNotFound,
    Generic,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PackageNotFound => "ERROR_PACKAGE_NOT_FOUND",
            ErrorCode::ContainerNotFound => "ERROR_CONTAINER_NOT_FOUND",
            ErrorCode::CannotReadStorageFile => "ERROR_CANNOT_READ_STORAGE_FILE",
            ErrorCode::FileFingerprintMismatch => "ERROR_FILE_FINGERPRINT_MISMATCH",
            ErrorCode::StorageSystemNotFound => "ERROR_STORAGE_SYSTEM_NOT_FOUND",
            ErrorCode::Generic => "ERROR_GENERIC",
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("package {package} not found")]
    PackageNotFound { package: String },

    #[error("container {container} not found")]
    ContainerNotFound { container: String },

    #[error("cannot read storage file {path}: {reason}")]
    CannotReadStorageFile { path: String, reason: String },

    #[error("unsupported storage file version {version} in {path}")]
    UnsupportedVersion { path: String, version: u32 },

    #[error("storage for container {container} is corrupted: digest mismatch")]
    DigestMismatch { container: String },

    #[error("fingerprint mismatch for package {package}: expected {expected:#x}, found {actual:#x}")]
    FileFingerprintMismatch {
        package: String,
        expected: u64,
        actual: u64,
    },

    #[error("storage system not found at {path}")]
    StorageSystemNotFound { path: String },

    #[error("malformed storage file: {0}")]
    Malformed(String),

    #[error("flag {package}.{flag} not found")]
    FlagNotFound { package: String, flag: String },

    #[error("flag {package}.{flag} is read only, local override disallowed")]
    FlagIsReadOnly { package: String, flag: String },

    #[error("invalid flag value {value:?}, expected \"true\" or \"false\"")]
    InvalidFlagValue { value: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: prost::DecodeError,
    },
}

impl StorageError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::PackageNotFound { .. } => ErrorCode::PackageNotFound,
            StorageError::ContainerNotFound { .. } => ErrorCode::ContainerNotFound,
            StorageError::CannotReadStorageFile { .. }
            | StorageError::UnsupportedVersion { .. }
            | StorageError::DigestMismatch { .. } => ErrorCode::CannotReadStorageFile,
            StorageError::FileFingerprintMismatch { .. } => ErrorCode::FileFingerprintMismatch,
            StorageError::StorageSystemNotFound { .. } => ErrorCode::StorageSystemNotFound,
            _ => ErrorCode::Generic,
        }
    }

    pub fn io(path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn unreadable(path: &Path, reason: impl ToString) -> Self {
        StorageError::CannotReadStorageFile {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}
