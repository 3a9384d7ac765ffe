//! Dataverse native API wire types
//!
//! Only the fields the uploader reads are modelled. Everything else in the
//! server's responses is ignored.

use serde::{Deserialize, Serialize};

/// Standard response envelope `{ "status": "OK", "data": ... }`
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub status: String,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

impl<T> Envelope<T> {
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("OK")
    }
}

/// Error body returned alongside non-success status codes
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Dataset {
    pub id: Option<serde_json::Value>,
    #[serde(rename = "latestVersion", default)]
    pub latest_version: Option<DatasetVersion>,
}

#[derive(Debug, Deserialize)]
pub struct DatasetVersion {
    #[serde(rename = "versionState", default)]
    pub version_state: Option<String>,
}

/// One entry of the latest-version file listing
#[derive(Debug, Deserialize)]
pub struct FileMetadata {
    #[serde(default)]
    pub label: String,
    #[serde(rename = "directoryLabel", default)]
    pub directory_label: Option<String>,
    #[serde(rename = "dataFile")]
    pub data_file: DataFile,
}

impl FileMetadata {
    /// Path as the repository names it: `directoryLabel/label`
    pub fn remote_path(&self) -> String {
        match self.directory_label.as_deref().map(|d| d.trim_matches('/')) {
            Some(dir) if !dir.is_empty() => format!("{dir}/{}", self.label),
            _ => self.label.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DataFile {
    pub id: serde_json::Value,
    #[serde(default)]
    pub checksum: Option<Checksum>,
}

impl DataFile {
    /// Identifier as a string, whether the server sent a number or a string
    pub fn id_string(&self) -> Option<String> {
        match &self.id {
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Checksum {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub value: String,
}

/// Response of the add-file endpoints
#[derive(Debug, Deserialize)]
pub struct AddedFiles {
    #[serde(alias = "Files", default)]
    pub files: Vec<AddedFile>,
}

impl AddedFiles {
    /// The single file a one-file upload created
    pub fn into_first(self) -> Option<DataFile> {
        self.files.into_iter().next().map(|f| f.data_file)
    }
}

#[derive(Debug, Deserialize)]
pub struct AddedFile {
    #[serde(rename = "dataFile")]
    pub data_file: DataFile,
}

/// Pre-signed destination for a direct upload
#[derive(Debug, Deserialize)]
pub struct UploadUrls {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(rename = "storageIdentifier", default)]
    pub storage_identifier: Option<String>,
}

/// One active lock on a dataset
#[derive(Debug, Deserialize)]
pub struct Lock {
    #[serde(rename = "lockType", default)]
    pub lock_type: Option<String>,
}

/// `jsonData` part of a traditional upload
#[derive(Debug, Serialize)]
pub struct FileUploadMetadata {
    pub description: String,
    #[serde(rename = "directoryLabel", skip_serializing_if = "Option::is_none")]
    pub directory_label: Option<String>,
    pub categories: Vec<String>,
    pub restrict: bool,
    #[serde(rename = "tabIngest", skip_serializing_if = "Option::is_none")]
    pub tab_ingest: Option<bool>,
}

/// Body of the register call for directly uploaded files
#[derive(Debug, Serialize)]
pub struct RegisterFiles {
    pub files: Vec<RegisteredFile>,
}

#[derive(Debug, Serialize)]
pub struct RegisteredFile {
    #[serde(flatten)]
    pub metadata: FileUploadMetadata,
    #[serde(rename = "storageIdentifier")]
    pub storage_identifier: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub checksum: RegisteredChecksum,
}

#[derive(Debug, Serialize)]
pub struct RegisteredChecksum {
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(rename = "@value")]
    pub value: String,
}
