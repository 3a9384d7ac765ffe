//! Local resources
//!
//! A [`Resource`] is an immutable view over a file or directory on the local
//! filesystem. Metadata is captured when the resource is constructed; content
//! hashes are computed on demand and cached per algorithm for the lifetime of
//! the resource (and of all its clones).

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::checksum::ChecksumAlgorithm;
use crate::error::{Error, Result};

/// Entries whose name starts with this marker are never uploaded
const HIDDEN_MARKER: char = '.';

const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Byte stream over (part of) a file resource
pub type ResourceReader = tokio::io::Take<tokio::fs::File>;

/// Handle over a local file or directory
#[derive(Clone)]
pub struct Resource {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    relative_path: String,
    absolute_path: PathBuf,
    base_path: PathBuf,
    is_dir: bool,
    size: Option<u64>,
    hashes: Mutex<HashMap<ChecksumAlgorithm, String>>,
}

impl Resource {
    /// Create a resource whose relative path starts at its own name
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let absolute = canonicalize(path.as_ref())?;
        let base = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| absolute.clone());
        Self::build(absolute, base)
    }

    /// Create a resource whose relative path is rooted at `base`
    pub fn with_base(path: impl AsRef<Path>, base: impl AsRef<Path>) -> Result<Self> {
        let absolute = canonicalize(path.as_ref())?;
        let base = canonicalize(base.as_ref())?;
        Self::build(absolute, base)
    }

    fn build(absolute_path: PathBuf, base_path: PathBuf) -> Result<Self> {
        let metadata = std::fs::metadata(&absolute_path).map_err(|e| {
            Error::Resource(format!("Cannot stat {}: {e}", absolute_path.display()))
        })?;

        let name = absolute_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| absolute_path.display().to_string());

        let relative_path = match absolute_path.strip_prefix(&base_path) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            _ => name.clone(),
        };

        let is_dir = metadata.is_dir();
        Ok(Self {
            inner: Arc::new(Inner {
                name,
                relative_path,
                absolute_path,
                base_path,
                is_dir,
                size: (!is_dir).then_some(metadata.len()),
                hashes: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// File or directory name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Path relative to the base of the upload, `/`-separated
    pub fn path(&self) -> &str {
        &self.inner.relative_path
    }

    pub fn absolute_path(&self) -> &Path {
        &self.inner.absolute_path
    }

    pub fn is_directory(&self) -> bool {
        self.inner.is_dir
    }

    /// Size in bytes; directories have no length
    pub fn length(&self) -> Result<u64> {
        self.inner.size.ok_or_else(|| {
            Error::Resource(format!("Cannot get size of directory {}", self.path()))
        })
    }

    /// MIME type guessed from the file extension
    pub fn mime_type(&self) -> String {
        if self.is_directory() {
            return "inode/directory".to_string();
        }
        mime_guess::from_path(self.absolute_path())
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    }

    /// Open the file for reading, starting at `offset` and yielding at most
    /// `length` bytes when given. The handle is closed when the reader is
    /// dropped.
    pub async fn open(&self, offset: u64, length: Option<u64>) -> Result<ResourceReader> {
        if self.is_directory() {
            return Err(Error::Resource(format!(
                "Cannot open directory {} as stream",
                self.path()
            )));
        }

        let mut file = tokio::fs::File::open(self.absolute_path())
            .await
            .map_err(|e| Error::Resource(format!("Cannot open {}: {e}", self.path())))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }

        Ok(file.take(length.unwrap_or(u64::MAX)))
    }

    /// Immediate children in sorted order, hidden entries excluded.
    ///
    /// The returned iterator builds child resources lazily. Calling this
    /// again restarts the enumeration from the current directory contents.
    pub fn children(&self) -> Result<Children> {
        if !self.is_directory() {
            return Ok(Children::empty(self.inner.base_path.clone()));
        }

        let entries = std::fs::read_dir(self.absolute_path()).map_err(|e| {
            Error::Resource(format!("Cannot list directory {}: {e}", self.path()))
        })?;

        let mut names: Vec<OsString> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name())
            .filter(|name| !name.to_string_lossy().starts_with(HIDDEN_MARKER))
            .collect();
        names.sort();

        Ok(Children {
            dir: self.inner.absolute_path.clone(),
            base: self.inner.base_path.clone(),
            names: names.into_iter(),
        })
    }

    /// Hex digest of the file content, computed at most once per algorithm
    pub async fn hash(&self, algorithm: ChecksumAlgorithm) -> Result<String> {
        if self.is_directory() {
            return Err(Error::Resource(format!(
                "Cannot hash directory {}",
                self.path()
            )));
        }

        if let Some(cached) = self.cached_hash(algorithm) {
            return Ok(cached);
        }

        let mut file = self.open(0, None).await?;
        let mut hasher = algorithm.hasher();
        let mut buf = vec![0u8; HASH_CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = hasher.finalize_hex();

        tracing::debug!(path = %self.path(), %algorithm, %digest, "Computed checksum");
        self.lock_hashes().insert(algorithm, digest.clone());
        Ok(digest)
    }

    /// Hash using an algorithm name reported by a repository
    pub async fn hash_named(&self, algorithm: &str) -> Result<String> {
        self.hash(algorithm.parse()?).await
    }

    fn cached_hash(&self, algorithm: ChecksumAlgorithm) -> Option<String> {
        self.lock_hashes().get(&algorithm).cloned()
    }

    fn lock_hashes(&self) -> std::sync::MutexGuard<'_, HashMap<ChecksumAlgorithm, String>> {
        // A poisoned cache only means another hash computation panicked; the
        // map itself is still consistent.
        self.inner
            .hashes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("path", &self.inner.relative_path)
            .field("is_dir", &self.inner.is_dir)
            .field("size", &self.inner.size)
            .finish()
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

/// Lazy enumeration of a directory's children
pub struct Children {
    dir: PathBuf,
    base: PathBuf,
    names: std::vec::IntoIter<OsString>,
}

impl Children {
    fn empty(base: PathBuf) -> Self {
        Self {
            dir: PathBuf::new(),
            base,
            names: Vec::new().into_iter(),
        }
    }
}

impl Iterator for Children {
    type Item = Result<Resource>;

    fn next(&mut self) -> Option<Self::Item> {
        let name = self.names.next()?;
        Some(Resource::with_base(self.dir.join(name), &self.base))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.names.size_hint()
    }
}

fn canonicalize(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path)
        .map_err(|_| Error::Resource(format!("Path does not exist: {}", path.display())))
}
