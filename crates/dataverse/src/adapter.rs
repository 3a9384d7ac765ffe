//! Dataverse repository adapter
//!
//! Implements the upload contract on top of the Dataverse native API.
//! Dataverse has no directory entities: a file's folder is the
//! `directoryLabel` sent with it, so directories are virtual and only
//! trigger a wait for ingest locks once their contents are in.

use std::time::Duration;

use async_trait::async_trait;
use dvu_core::{
    ChecksumAlgorithm, Error, RemoteCatalog, RemoteFileRecord, RepositoryAdapter, Resource, Result,
    UploaderConfig,
};
use reqwest::Body;
use reqwest::multipart::{Form, Part};
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::api::{
    AddedFiles, DataFile, Dataset, Envelope, FileMetadata, FileUploadMetadata, Lock,
    RegisterFiles, RegisteredChecksum, RegisteredFile, UploadUrls,
};
use crate::client::HttpClient;

/// Extensions Dataverse ingests into tab-separated `.tab` files
pub const TABULAR_EXTENSIONS: &[&str] = &[
    "csv", "xlsx", "xls", "sav", "dta", "por", "sas7bdat", "rdata", "rds",
];

/// Characters Dataverse rejects in file names
const INVALID_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', ';', '#'];

/// Adapter for one dataset on one Dataverse installation
pub struct DataverseAdapter {
    client: HttpClient,
    config: UploaderConfig,
    catalog: RemoteCatalog,
}

impl DataverseAdapter {
    pub fn new(config: &UploaderConfig) -> Result<Self> {
        Url::parse(&config.server_url).map_err(|e| {
            Error::Validation(format!("Invalid server URL '{}': {e}", config.server_url))
        })?;

        Ok(Self {
            client: HttpClient::new(config)?,
            config: config.clone(),
            catalog: RemoteCatalog::default(),
        })
    }

    pub fn catalog(&self) -> &RemoteCatalog {
        &self.catalog
    }

    /// `{server}/api/datasets/:persistentId/{path}?persistentId={pid}&...`
    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url> {
        let raw = format!(
            "{}/api/datasets/:persistentId/{path}",
            self.config.server_url.trim_end_matches('/')
        );
        let mut url = Url::parse(&raw)
            .map_err(|e| Error::Validation(format!("Invalid endpoint '{raw}': {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("persistentId", &self.config.dataset_pid);
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Fetch dataset metadata, failing if the dataset is not reachable
    pub async fn load_dataset(&self) -> Result<Dataset> {
        let url = self.endpoint("", &[])?;
        let pid = &self.config.dataset_pid;

        let envelope: Envelope<Dataset> = match self.client.get_json(&url).await {
            Ok(envelope) => envelope,
            Err(e) if e.status() == Some(404) => {
                return Err(Error::NotFound(format!("Dataset {pid} not found")));
            }
            Err(e) => return Err(e),
        };

        if !envelope.is_ok() {
            return Err(Error::NotFound(format!(
                "Dataset {pid} could not be loaded: {}",
                envelope.message.unwrap_or_default()
            )));
        }
        envelope
            .data
            .ok_or_else(|| Error::NotFound(format!("Dataset {pid} returned no metadata")))
    }

    /// Fetch the latest-version file listing
    pub async fn load_catalog(&self) -> Result<RemoteCatalog> {
        let url = self.endpoint("versions/:latest/files", &[])?;
        let envelope: Envelope<Vec<FileMetadata>> = self.client.get_json(&url).await?;

        if !envelope.is_ok() {
            return Err(Error::General(format!(
                "Could not list dataset files: {}",
                envelope.message.unwrap_or_default()
            )));
        }

        let records = envelope
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(|file| {
                let remote_path = file.remote_path();
                let remote_id = file.data_file.id_string()?;
                let (checksum_algorithm, checksum_value) = file
                    .data_file
                    .checksum
                    .map(|c| (c.kind, c.value))
                    .unwrap_or_default();
                Some(RemoteFileRecord {
                    remote_path,
                    remote_id,
                    checksum_algorithm,
                    checksum_value,
                })
            });

        Ok(RemoteCatalog::from_records(records))
    }

    /// Poll the lock endpoint until the dataset has no locks
    pub async fn wait_for_unlock(&self) -> Result<()> {
        let url = self.endpoint("locks", &[])?;
        let max_wait = Duration::from_secs(self.config.max_wait_lock_secs);
        let interval = Duration::from_millis(self.config.lock_poll_interval_ms);
        let deadline = Instant::now() + max_wait;

        loop {
            let envelope: Envelope<Vec<Lock>> = self.client.get_json(&url).await?;
            let locks = envelope.data.unwrap_or_default();
            if locks.is_empty() {
                return Ok(());
            }

            let kinds = locks
                .iter()
                .filter_map(|lock| lock.lock_type.as_deref())
                .collect::<Vec<_>>()
                .join(", ");

            if Instant::now() + interval > deadline {
                return Err(Error::DatasetLocked(format!(
                    "{} still locked after {}s ({kinds})",
                    self.config.dataset_pid,
                    max_wait.as_secs()
                )));
            }

            tracing::info!(locks = %kinds, "Dataset locked, waiting");
            tokio::time::sleep(interval).await;
        }
    }

    /// Name the file is stored under
    fn remote_name(&self, file: &Resource) -> String {
        if self.config.fix_invalid_names {
            sanitize_name(file.name())
        } else {
            file.name().to_string()
        }
    }

    fn upload_metadata(&self, parent_path: &str) -> FileUploadMetadata {
        FileUploadMetadata {
            description: String::new(),
            directory_label: directory_label(parent_path),
            categories: Vec::new(),
            restrict: false,
            tab_ingest: self.config.no_ingest.then_some(false),
        }
    }

    /// Multipart upload through the repository server
    async fn upload_traditional(&self, file: &Resource, parent_path: &str) -> Result<DataFile> {
        let url = self.endpoint("add", &[])?;
        let metadata = serde_json::to_string(&self.upload_metadata(parent_path))?;
        let name = self.remote_name(file);
        let mime = file.mime_type();
        let length = file.length()?;
        let (name, mime, metadata) = (&name, &mime, &metadata);

        let envelope: Envelope<AddedFiles> = self
            .client
            .post_multipart(&url, move || async move {
                let reader = file.open(0, None).await?;
                let content = Part::stream_with_length(
                    Body::wrap_stream(ReaderStream::new(reader)),
                    length,
                )
                .file_name(name.clone())
                .mime_str(mime)
                .map_err(|e| Error::Upload(format!("Invalid content type '{mime}': {e}")))?;
                let json = Part::text(metadata.clone())
                    .mime_str("application/json")
                    .map_err(|e| Error::Upload(e.to_string()))?;
                Ok(Form::new().part("file", content).part("jsonData", json))
            })
            .await?;

        added_file(envelope)
    }

    /// Ask for a pre-signed destination and storage identifier
    async fn request_destination(&self, length: u64) -> Result<(String, String)> {
        let url = self.endpoint("uploadurls", &[("size", &length.to_string())])?;
        let envelope = match self.client.get_json::<Envelope<UploadUrls>>(&url).await {
            Ok(envelope) => envelope,
            Err(e) if e.status() == Some(404) => {
                return Err(Error::UnsupportedFeature(
                    "direct upload is not enabled for this dataset".into(),
                ));
            }
            Err(e) => return Err(e),
        };

        envelope
            .data
            .and_then(|d| Some((d.url?, d.storage_identifier?)))
            .ok_or_else(|| {
                Error::UnsupportedFeature("server returned no upload destination".into())
            })
    }

    /// Upload straight to storage, then register the object
    async fn upload_direct(&self, file: &Resource, parent_path: &str) -> Result<DataFile> {
        let (upload_url, storage_identifier) =
            match self.request_destination(file.length()?).await {
                Ok(destination) => destination,
                Err(Error::UnsupportedFeature(reason)) => {
                    tracing::warn!(
                        path = %file.path(),
                        reason = %reason,
                        "Direct upload not available, falling back to traditional upload"
                    );
                    return self.upload_traditional(file, parent_path).await;
                }
                Err(e) => return Err(e),
            };

        let upload_url = Url::parse(&upload_url)
            .map_err(|e| Error::Upload(format!("Invalid upload URL: {e}")))?;
        self.client.put_resource(&upload_url, file).await?;

        let algorithm = self.config.fixity_algorithm;
        let register = RegisterFiles {
            files: vec![RegisteredFile {
                metadata: self.upload_metadata(parent_path),
                storage_identifier,
                file_name: self.remote_name(file),
                mime_type: file.mime_type(),
                checksum: RegisteredChecksum {
                    kind: algorithm.as_str().to_string(),
                    value: file.hash(algorithm).await?,
                },
            }],
        };

        let url = self.endpoint("addFiles", &[])?;
        let envelope: Envelope<AddedFiles> = self.client.post_json(&url, &register).await?;
        added_file(envelope)
    }

    /// Compare the checksum the server computed with the local one
    async fn check_uploaded(&self, file: &Resource, data_file: &DataFile) -> Result<()> {
        let Some(checksum) = data_file.checksum.as_ref().filter(|c| !c.value.is_empty()) else {
            return Ok(());
        };
        let Ok(algorithm) = checksum.kind.parse::<ChecksumAlgorithm>() else {
            tracing::debug!(algorithm = %checksum.kind, "Cannot verify uploaded file");
            return Ok(());
        };

        let local = file.hash(algorithm).await?;
        if !local.eq_ignore_ascii_case(&checksum.value) {
            tracing::warn!(
                path = %file.path(),
                local = %local,
                remote = %checksum.value,
                "Checksum of uploaded file differs"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl RepositoryAdapter for DataverseAdapter {
    async fn prepare(&mut self) -> Result<()> {
        let dataset = self.load_dataset().await?;
        tracing::info!(
            dataset = %self.config.dataset_pid,
            id = ?dataset.id,
            state = ?dataset.latest_version.and_then(|v| v.version_state),
            "Dataset loaded"
        );

        self.catalog = self.load_catalog().await?;
        tracing::info!(files = self.catalog.len(), "Existing files loaded");

        self.wait_for_unlock().await
    }

    async fn reload_catalog(&mut self) -> Result<()> {
        self.catalog = self.load_catalog().await?;
        tracing::debug!(files = self.catalog.len(), "Existing files reloaded");
        Ok(())
    }

    async fn existing_id(&self, resource: &Resource, parent_path: &str) -> Result<Option<String>> {
        if resource.is_directory() {
            return Ok(None);
        }

        let path = remote_path(parent_path, &self.remote_name(resource));
        if let Some(record) = self.catalog.by_path(&path) {
            tracing::debug!(path = %path, "File exists");
            return Ok(Some(record.remote_id.clone()));
        }

        if let Some(tab_path) = tabular_alias(&path)
            && let Some(record) = self.catalog.by_path(&tab_path)
        {
            tracing::debug!(path = %path, remote = %tab_path, "File exists as ingested table");
            return Ok(Some(record.remote_id.clone()));
        }

        if self.config.verify_checksums {
            let hash = resource.hash(self.config.fixity_algorithm).await?;
            if let Some(record) = self.catalog.by_checksum(&hash) {
                tracing::info!(
                    path = %path,
                    remote = %record.remote_path,
                    "File exists with identical content"
                );
                return Ok(Some(record.remote_id.clone()));
            }
        }

        Ok(None)
    }

    async fn create_directory(&self, directory: &Resource, parent_path: &str) -> Result<String> {
        Ok(format!(
            "{}/{}",
            parent_path.trim_end_matches('/'),
            directory.name()
        ))
    }

    async fn upload(&self, file: &Resource, parent_path: &str) -> Result<Option<String>> {
        let result = if self.config.direct_upload {
            self.upload_direct(file, parent_path).await
        } else {
            self.upload_traditional(file, parent_path).await
        };

        let data_file = match result {
            Ok(data_file) => data_file,
            Err(e) if e.is_fatal() || matches!(e, Error::Resource(_)) => return Err(e),
            Err(e) => {
                tracing::warn!(path = %file.path(), error = %e, "Upload failed");
                return Ok(None);
            }
        };

        if self.config.verify_checksums {
            self.check_uploaded(file, &data_file).await?;
        }

        let id = data_file.id_string();
        if id.is_none() {
            tracing::warn!(path = %file.path(), "Upload response carried no file identifier");
        }
        Ok(id)
    }

    async fn verify_checksum(&self, file: &Resource, remote_id: &str) -> Result<bool> {
        let Some(record) = self.catalog.by_id(remote_id) else {
            tracing::warn!(id = %remote_id, "Remote file not found for verification");
            return Ok(false);
        };
        if record.checksum_value.is_empty() {
            tracing::warn!(path = %record.remote_path, "Remote file has no checksum");
            return Ok(false);
        }
        let Ok(algorithm) = record.checksum_algorithm.parse::<ChecksumAlgorithm>() else {
            tracing::warn!(
                algorithm = %record.checksum_algorithm,
                "Unsupported remote checksum algorithm"
            );
            return Ok(false);
        };

        let local = file.hash(algorithm).await?;
        Ok(local.eq_ignore_ascii_case(&record.checksum_value))
    }

    async fn post_process_directory(&self, directory: &Resource, _dir_id: &str) -> Result<()> {
        tracing::debug!(path = %directory.path(), "Waiting for ingest to finish");
        self.wait_for_unlock().await
    }
}

fn added_file(envelope: Envelope<AddedFiles>) -> Result<DataFile> {
    if !envelope.is_ok() {
        return Err(Error::Upload(
            envelope
                .message
                .unwrap_or_else(|| format!("status {}", envelope.status)),
        ));
    }
    envelope
        .data
        .and_then(AddedFiles::into_first)
        .ok_or_else(|| Error::Upload("response listed no files".into()))
}

/// Path of a file as Dataverse names it, without leading slash
pub fn remote_path(parent_path: &str, name: &str) -> String {
    match parent_path.trim_matches('/') {
        "" => name.to_string(),
        dir => format!("{dir}/{name}"),
    }
}

/// `directoryLabel` for files under `parent_path`, none at the root
pub fn directory_label(parent_path: &str) -> Option<String> {
    let label = parent_path.trim_matches('/');
    (!label.is_empty()).then(|| label.to_string())
}

/// Name an ingested tabular file ends up with (`a/b.csv` -> `a/b.tab`)
pub fn tabular_alias(path: &str) -> Option<String> {
    let file_start = path.rfind('/').map_or(0, |i| i + 1);
    let dot = path[file_start..].rfind('.')? + file_start;
    let extension = path[dot + 1..].to_ascii_lowercase();

    TABULAR_EXTENSIONS
        .contains(&extension.as_str())
        .then(|| format!("{}.tab", &path[..dot]))
}

/// Replace characters Dataverse rejects in file names
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if INVALID_NAME_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(config: UploaderConfig) -> DataverseAdapter {
        DataverseAdapter::new(&UploaderConfig {
            server_url: "https://demo.dataverse.org".into(),
            api_key: "key".into(),
            dataset_pid: "doi:10.5072/FK2/ABC".into(),
            ..config
        })
        .unwrap()
    }

    #[test]
    fn test_remote_path() {
        assert_eq!(remote_path("/", "a.txt"), "a.txt");
        assert_eq!(remote_path("", "a.txt"), "a.txt");
        assert_eq!(remote_path("/data/raw", "a.txt"), "data/raw/a.txt");
        assert_eq!(remote_path("/data/", "a.txt"), "data/a.txt");
    }

    #[test]
    fn test_directory_label() {
        assert_eq!(directory_label("/"), None);
        assert_eq!(directory_label("/data/raw/").as_deref(), Some("data/raw"));
    }

    #[test]
    fn test_tabular_alias() {
        assert_eq!(tabular_alias("data/customers.csv").as_deref(), Some("data/customers.tab"));
        assert_eq!(tabular_alias("Survey.SAV").as_deref(), Some("Survey.tab"));
        assert_eq!(tabular_alias("model.sas7bdat").as_deref(), Some("model.tab"));
        assert_eq!(tabular_alias("archive.tar.csv").as_deref(), Some("archive.tar.tab"));
        assert_eq!(tabular_alias("notes.txt"), None);
        assert_eq!(tabular_alias("csv"), None);
        assert_eq!(tabular_alias("dir.csv/readme"), None);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("a:b*c?.txt"), "a_b_c_.txt");
        assert_eq!(sanitize_name("report #1; final|v2.pdf"), "report _1_ final_v2.pdf");
        assert_eq!(sanitize_name("plain-name.csv"), "plain-name.csv");
    }

    #[test]
    fn test_endpoint() {
        let adapter = adapter(UploaderConfig::default());
        let url = adapter.endpoint("uploadurls", &[("size", "42")]).unwrap();
        assert_eq!(url.path(), "/api/datasets/:persistentId/uploadurls");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            query,
            vec![
                ("persistentId".to_string(), "doi:10.5072/FK2/ABC".to_string()),
                ("size".to_string(), "42".to_string()),
            ]
        );

        let dataset = adapter.endpoint("", &[]).unwrap();
        assert_eq!(dataset.path(), "/api/datasets/:persistentId/");
    }

    #[test]
    fn test_upload_metadata() {
        let adapter = adapter(UploaderConfig {
            no_ingest: true,
            ..Default::default()
        });
        let metadata = adapter.upload_metadata("/data/");
        assert_eq!(metadata.directory_label.as_deref(), Some("data"));
        assert_eq!(metadata.tab_ingest, Some(false));

        let adapter = self::adapter(UploaderConfig::default());
        let metadata = adapter.upload_metadata("/");
        assert_eq!(metadata.directory_label, None);
        assert_eq!(metadata.tab_ingest, None);
    }

    #[tokio::test]
    async fn test_directories_are_virtual() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("raw")).unwrap();
        let raw = Resource::new(dir.path().join("raw")).unwrap();
        let adapter = adapter(UploaderConfig::default());

        assert_eq!(adapter.existing_id(&raw, "/data").await.unwrap(), None);
        assert_eq!(adapter.create_directory(&raw, "/data/").await.unwrap(), "/data/raw");
        assert_eq!(adapter.create_directory(&raw, "/").await.unwrap(), "/raw");
    }
}
