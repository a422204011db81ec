use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use prost::Message;
use sha1::{Digest, Sha1};

use crate::error::StorageError;

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp.{}", std::process::id()));
    path.with_file_name(name)
}

/// Writes `bytes` next to `path` and renames over it, so readers see either
/// the old or the new content.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
    }
    let tmp = temp_path(path);
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(StorageError::io(path, e));
    }
    Ok(())
}

/// Overwrites `path` without replacing its inode, so mappings readers already
/// hold see the new bytes. A missing file or a length change falls back to
/// [`write_atomic`].
pub fn write_in_place(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let mut file = match fs::OpenOptions::new().write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return write_atomic(path, bytes),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    let len = file.metadata().map_err(|e| StorageError::io(path, e))?.len();
    if len != bytes.len() as u64 {
        drop(file);
        return write_atomic(path, bytes);
    }
    file.write_all(bytes)
        .and_then(|_| file.sync_data())
        .map_err(|e| StorageError::io(path, e))
}

pub fn copy_file_atomic(src: &Path, dst: &Path) -> Result<(), StorageError> {
    let bytes = fs::read(src).map_err(|e| StorageError::unreadable(src, e))?;
    write_atomic(dst, &bytes)
}

pub fn remove_file_if_exists(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

/// Hex SHA-1 over the contents of `paths`, in order.
pub fn files_digest(paths: &[&Path]) -> Result<String, StorageError> {
    let mut hasher = Sha1::new();
    for path in paths {
        let bytes = fs::read(path).map_err(|e| StorageError::unreadable(path, e))?;
        hasher.update(&bytes);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Decodes a protobuf file, returning the default message when it does not exist.
pub fn read_pb_from_file<T: Message + Default>(path: &Path) -> Result<T, StorageError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    T::decode(bytes.as_slice()).map_err(|source| StorageError::Decode {
        what: path.display().to_string(),
        source,
    })
}

pub fn write_pb_to_file<T: Message>(msg: &T, path: &Path) -> Result<(), StorageError> {
    write_atomic(path, &msg.encode_to_vec())
}
