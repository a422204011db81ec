use std::path::{Path, PathBuf};

use log::{error, info};

use crate::error::StorageError;
use crate::proto::{PersistStorageRecord, PersistStorageRecords};
use crate::util::{read_pb_from_file, write_pb_to_file};

pub const RECORD_VERSION: u32 = 1;

/// Durable list of active container generations, one record per container.
#[derive(Debug)]
pub struct StorageRecords {
    path: PathBuf,
    records: Vec<PersistStorageRecord>,
}

impl StorageRecords {
    /// Reads the list back. A missing file is an empty list; a file that
    /// cannot be read or decoded is an error the daemon must not start past.
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let records: PersistStorageRecords = read_pb_from_file(path).map_err(|e| {
            error!("storage record file {} is unreadable: {}", path.display(), e);
            e
        })?;

        let mut seen = std::collections::HashSet::new();
        for record in &records.records {
            if !seen.insert(record.container.as_str()) {
                return Err(StorageError::Malformed(format!(
                    "{} holds two records for container {}",
                    path.display(),
                    record.container
                )));
            }
        }

        info!(
            "loaded {} storage records from {}",
            records.records.len(),
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            records: records.records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, container: &str) -> Option<&PersistStorageRecord> {
        self.records.iter().find(|r| r.container == container)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PersistStorageRecord> {
        self.records.iter()
    }

    pub fn containers(&self) -> Vec<String> {
        self.records.iter().map(|r| r.container.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Replaces the record of `record.container`, or appends it. The list is
    /// durable when this returns; on failure the in-memory list is unchanged.
    pub fn upsert(&mut self, record: PersistStorageRecord) -> Result<(), StorageError> {
        let mut next = self.records.clone();
        match next.iter_mut().find(|r| r.container == record.container) {
            Some(existing) => *existing = record,
            None => next.push(record),
        }
        self.write(&next)?;
        self.records = next;
        Ok(())
    }

    pub fn persist(&self) -> Result<(), StorageError> {
        self.write(&self.records)
    }

    fn write(&self, records: &[PersistStorageRecord]) -> Result<(), StorageError> {
        let msg = PersistStorageRecords {
            records: records.to_vec(),
        };
        write_pb_to_file(&msg, &self.path)
    }
}
