//! Remote catalog of files already present in the target collection
//!
//! Built from one full listing snapshot. Both indices are derived from the
//! same record set and are only ever replaced together.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One file already stored in the repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileRecord {
    /// Directory label and name joined with `/`, as the repository names it
    pub remote_path: String,
    pub remote_id: String,
    /// Algorithm name as reported by the repository (e.g. `MD5`)
    pub checksum_algorithm: String,
    /// Lowercase hex digest, empty if the repository reported none
    pub checksum_value: String,
}

/// Lookup indices over the remote file listing
#[derive(Debug, Clone, Default)]
pub struct RemoteCatalog {
    by_path: HashMap<String, RemoteFileRecord>,
    by_checksum: HashMap<String, RemoteFileRecord>,
}

impl RemoteCatalog {
    /// Build both indices from one listing
    pub fn from_records(records: impl IntoIterator<Item = RemoteFileRecord>) -> Self {
        let mut by_path = HashMap::new();
        let mut by_checksum = HashMap::new();

        for mut record in records {
            record.checksum_value = record.checksum_value.to_lowercase();
            if !record.checksum_value.is_empty() {
                by_checksum.insert(record.checksum_value.clone(), record.clone());
            }
            by_path.insert(record.remote_path.clone(), record);
        }

        Self {
            by_path,
            by_checksum,
        }
    }

    pub fn by_path(&self, remote_path: &str) -> Option<&RemoteFileRecord> {
        self.by_path.get(remote_path)
    }

    pub fn by_checksum(&self, checksum: &str) -> Option<&RemoteFileRecord> {
        self.by_checksum.get(&checksum.to_lowercase())
    }

    /// Find the record carrying a given remote identifier
    pub fn by_id(&self, remote_id: &str) -> Option<&RemoteFileRecord> {
        self.by_path.values().find(|r| r.remote_id == remote_id)
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}
