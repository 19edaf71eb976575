//! Storage Abstraction
//!
//! All filesystem effects of reconciliation go through [`Storage`]. Paths are
//! relative to a fixed root: the holding area is the root itself and every
//! target directory lives beneath it.

use std::collections::{BTreeMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use attsync_core::{Severity, StorageConfig};
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::validate::extract_file_ext;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Source file not available in holding area: {path}: {source}")]
    SourceMissing {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Couldn't create directory {path}: {source}")]
    DirectoryCreate {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Couldn't create destination file {path}: {source}")]
    DestinationCreate {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Couldn't copy into {path}: {source}")]
    Copy {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Couldn't remove source file {path}: {source}")]
    SourceRemove {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Couldn't remove file {path}: {source}")]
    Remove {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Couldn't list directory {path}: {source}")]
    List {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl StorageError {
    /// Whether this failure kept the operation from landing its result
    pub fn severity(&self) -> Severity {
        match self {
            Self::SourceMissing { .. } | Self::SourceRemove { .. } | Self::Remove { .. } => {
                Severity::Recoverable
            }
            Self::DirectoryCreate { .. }
            | Self::DestinationCreate { .. }
            | Self::Copy { .. }
            | Self::List { .. }
            | Self::InvalidPath(_)
            | Self::IoError(_) => Severity::Fatal,
        }
    }

    pub fn code(&self) -> u16 {
        self.severity().code()
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A file saved into the holding area
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedFile {
    /// Generated name under the holding root
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// Content type (MIME) guessed from the extension
    pub content_type: String,
}

/// Storage trait - the filesystem as seen by the reconciler
#[async_trait]
pub trait Storage: Send + Sync {
    /// Non-directory entries of `dir`, or `None` when `dir` does not exist.
    ///
    /// Names are returned as the filesystem reports them, UTF-8 or not.
    async fn list(&self, dir: &str) -> StorageResult<Option<Vec<OsString>>>;

    /// Create `dir` and any missing parents
    async fn ensure_dir(&self, dir: &str) -> StorageResult<()>;

    /// Move `name` from the holding area into `dir`
    async fn move_in(&self, name: &str, dir: &str) -> StorageResult<()>;

    /// Remove `name` from `dir`
    async fn remove(&self, name: &OsStr, dir: &str) -> StorageResult<()>;

    /// Whether `name` is a file in the holding area
    async fn is_held(&self, name: &str) -> StorageResult<bool>;

    /// Save uploaded bytes into the holding area under a generated name
    async fn stage(&self, original_name: &str, data: Bytes) -> StorageResult<StagedFile>;

    /// Remove `name` from the holding area
    async fn discard(&self, name: &str) -> StorageResult<()>;

    /// Get storage name for logging
    fn name(&self) -> &str;
}

/// Local filesystem storage
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Root of the holding area
    root: PathBuf,
    /// Permission bits for created directories
    dir_mode: u32,
}

impl LocalStorage {
    /// Create a new local storage
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            dir_mode: 0o755,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.root_dir).with_dir_mode(config.dir_mode)
    }

    pub fn with_dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = mode;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative key to a full path
    fn resolve_path(&self, key: &str) -> StorageResult<PathBuf> {
        // Prevent directory traversal
        if key.split('/').any(|seg| seg == "..")
            || key.starts_with('/')
            || key.contains('\\')
        {
            return Err(StorageError::InvalidPath(key.to_string()));
        }

        Ok(self.root.join(key))
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(self.dir_mode);
        builder.create(path).await
    }

    /// Generate a unique holding-area name that keeps the upload's extension
    pub fn generate_disk_filename(original_name: &str) -> String {
        format!("{}{}", Uuid::new_v4(), extract_file_ext(original_name))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn list(&self, dir: &str) -> StorageResult<Option<Vec<OsString>>> {
        let path = self.resolve_path(dir)?;

        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::List {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };

        let list_err = |e: io::Error| StorageError::List {
            path: path.display().to_string(),
            source: e,
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
            if entry.file_type().await.map_err(list_err)?.is_dir() {
                continue;
            }
            names.push(entry.file_name());
        }
        names.sort();

        Ok(Some(names))
    }

    async fn ensure_dir(&self, dir: &str) -> StorageResult<()> {
        let path = self.resolve_path(dir)?;
        self.create_dir_all(&path)
            .await
            .map_err(|e| StorageError::DirectoryCreate {
                path: path.display().to_string(),
                source: e,
            })
    }

    #[instrument(skip(self), fields(storage = "local"))]
    async fn move_in(&self, name: &str, dir: &str) -> StorageResult<()> {
        let src_path = self.resolve_path(name)?;
        let dir_path = self.resolve_path(dir)?;
        let dst_path = dir_path.join(name);

        let mut src = fs::File::open(&src_path)
            .await
            .map_err(|e| StorageError::SourceMissing {
                path: src_path.display().to_string(),
                source: e,
            })?;
        let is_file = src
            .metadata()
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(StorageError::SourceMissing {
                path: src_path.display().to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            });
        }

        self.create_dir_all(&dir_path)
            .await
            .map_err(|e| StorageError::DirectoryCreate {
                path: dir_path.display().to_string(),
                source: e,
            })?;

        let size = write_new_file(&dst_path, &mut src).await?;

        // Close the source before removing it
        drop(src);

        debug!(path = ?dst_path, size = size, "File copied");

        fs::remove_file(&src_path)
            .await
            .map_err(|e| StorageError::SourceRemove {
                path: src_path.display().to_string(),
                source: e,
            })
    }

    #[instrument(skip(self), fields(storage = "local"))]
    async fn remove(&self, name: &OsStr, dir: &str) -> StorageResult<()> {
        let path = self.resolve_path(dir)?.join(name);

        fs::remove_file(&path)
            .await
            .map_err(|e| StorageError::Remove {
                path: path.display().to_string(),
                source: e,
            })?;
        debug!(path = ?path, "File deleted");

        Ok(())
    }

    async fn is_held(&self, name: &str) -> StorageResult<bool> {
        let path = self.resolve_path(name)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::IoError(e)),
        }
    }

    #[instrument(skip(self, data), fields(storage = "local"))]
    async fn stage(&self, original_name: &str, data: Bytes) -> StorageResult<StagedFile> {
        self.create_dir_all(&self.root)
            .await
            .map_err(|e| StorageError::DirectoryCreate {
                path: self.root.display().to_string(),
                source: e,
            })?;

        let name = Self::generate_disk_filename(original_name);
        let path = self.root.join(&name);

        let mut reader: &[u8] = &data;
        write_new_file(&path, &mut reader).await?;

        debug!(path = ?path, size = data.len(), "File staged");

        Ok(StagedFile {
            content_type: guess_content_type(&name),
            size: data.len() as u64,
            name,
        })
    }

    async fn discard(&self, name: &str) -> StorageResult<()> {
        let path = self.resolve_path(name)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| StorageError::Remove {
                path: path.display().to_string(),
                source: e,
            })
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Create `path` and fill it from `src`.
///
/// A partially written file is removed before the error is returned, so a
/// truncated copy never shows up in a listing.
async fn write_new_file<R>(path: &Path, src: &mut R) -> StorageResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut dst = fs::File::create(path)
        .await
        .map_err(|e| StorageError::DestinationCreate {
            path: path.display().to_string(),
            source: e,
        })?;

    let written = async {
        let size = tokio::io::copy(src, &mut dst).await?;
        dst.flush().await?;
        dst.sync_all().await?;
        Ok::<_, io::Error>(size)
    }
    .await;
    drop(dst);

    match written {
        Ok(size) => Ok(size),
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(path).await {
                warn!(path = ?path, error = %cleanup, "Failed to remove partial file");
            }
            Err(StorageError::Copy {
                path: path.display().to_string(),
                source: e,
            })
        }
    }
}

fn guess_content_type(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .to_string()
}

#[derive(Debug, Default)]
struct MemoryState {
    held: BTreeMap<String, Bytes>,
    dirs: BTreeMap<String, BTreeMap<String, Bytes>>,
}

/// In-memory storage for testing.
///
/// Paths passed to [`MemoryStorage::deny`] make writes and removals on them
/// fail with `PermissionDenied`: a directory path blocks its creation,
/// `dir/name` blocks creating or removing that committed file, and a bare
/// name blocks removing it from the holding area.
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
    denied: RwLock<HashSet<String>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            denied: RwLock::new(HashSet::new()),
        }
    }

    /// Put a file into the holding area
    pub async fn hold(&self, name: &str, data: impl Into<Bytes>) {
        self.state
            .write()
            .await
            .held
            .insert(name.to_string(), data.into());
    }

    /// Put a file into a committed directory, creating it if needed
    pub async fn commit(&self, dir: &str, name: &str, data: impl Into<Bytes>) {
        self.state
            .write()
            .await
            .dirs
            .entry(dir.to_string())
            .or_default()
            .insert(name.to_string(), data.into());
    }

    /// Contents of a committed file
    pub async fn read(&self, dir: &str, name: &str) -> Option<Bytes> {
        let state = self.state.read().await;
        state.dirs.get(dir).and_then(|files| files.get(name)).cloned()
    }

    pub async fn deny(&self, path: &str) {
        self.denied.write().await.insert(path.to_string());
    }

    async fn check(&self, path: &str) -> io::Result<()> {
        if self.denied.read().await.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("access to {} denied", path),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn list(&self, dir: &str) -> StorageResult<Option<Vec<OsString>>> {
        let state = self.state.read().await;
        Ok(state
            .dirs
            .get(dir)
            .map(|files| files.keys().map(OsString::from).collect()))
    }

    async fn ensure_dir(&self, dir: &str) -> StorageResult<()> {
        self.check(dir)
            .await
            .map_err(|e| StorageError::DirectoryCreate {
                path: dir.to_string(),
                source: e,
            })?;
        self.state
            .write()
            .await
            .dirs
            .entry(dir.to_string())
            .or_default();
        Ok(())
    }

    async fn move_in(&self, name: &str, dir: &str) -> StorageResult<()> {
        let data = {
            let state = self.state.read().await;
            state.held.get(name).cloned()
        }
        .ok_or_else(|| StorageError::SourceMissing {
            path: name.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        })?;

        self.ensure_dir(dir).await?;

        let dst = format!("{}/{}", dir, name);
        self.check(&dst)
            .await
            .map_err(|e| StorageError::DestinationCreate {
                path: dst.clone(),
                source: e,
            })?;

        let mut state = self.state.write().await;
        state
            .dirs
            .entry(dir.to_string())
            .or_default()
            .insert(name.to_string(), data);

        if let Err(e) = self.check(name).await {
            return Err(StorageError::SourceRemove {
                path: name.to_string(),
                source: e,
            });
        }
        state.held.remove(name);

        Ok(())
    }

    async fn remove(&self, name: &OsStr, dir: &str) -> StorageResult<()> {
        let path = format!("{}/{}", dir, name.to_string_lossy());
        self.check(&path)
            .await
            .map_err(|e| StorageError::Remove {
                path: path.clone(),
                source: e,
            })?;

        let mut state = self.state.write().await;
        state
            .dirs
            .get_mut(dir)
            .zip(name.to_str())
            .and_then(|(files, name)| files.remove(name))
            .map(|_| ())
            .ok_or_else(|| StorageError::Remove {
                path,
                source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
            })
    }

    async fn is_held(&self, name: &str) -> StorageResult<bool> {
        Ok(self.state.read().await.held.contains_key(name))
    }

    async fn stage(&self, original_name: &str, data: Bytes) -> StorageResult<StagedFile> {
        let name = LocalStorage::generate_disk_filename(original_name);
        let staged = StagedFile {
            content_type: guess_content_type(&name),
            size: data.len() as u64,
            name: name.clone(),
        };
        self.state.write().await.held.insert(name, data);
        Ok(staged)
    }

    async fn discard(&self, name: &str) -> StorageResult<()> {
        self.check(name)
            .await
            .map_err(|e| StorageError::Remove {
                path: name.to_string(),
                source: e,
            })?;
        self.state
            .write()
            .await
            .held
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::Remove {
                path: name.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
            })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn local() -> (TempDir, LocalStorage) {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path());
        (tmp, storage)
    }

    #[tokio::test]
    async fn test_local_list_missing_dir() {
        let (_tmp, storage) = local();
        assert_eq!(storage.list("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_local_list_skips_directories() {
        let (tmp, storage) = local();
        std::fs::create_dir_all(tmp.path().join("d/nested")).unwrap();
        std::fs::write(tmp.path().join("d/b.png"), b"b").unwrap();
        std::fs::write(tmp.path().join("d/a.png"), b"a").unwrap();

        let names = storage.list("d").await.unwrap().unwrap();
        assert_eq!(names, vec!["a.png", "b.png"]);
    }

    #[tokio::test]
    async fn test_local_move_in() {
        let (tmp, storage) = local();
        std::fs::write(tmp.path().join("photo.png"), b"pixels").unwrap();

        storage.move_in("photo.png", "entity/1").await.unwrap();

        assert!(!tmp.path().join("photo.png").exists());
        let moved = std::fs::read(tmp.path().join("entity/1/photo.png")).unwrap();
        assert_eq!(moved, b"pixels");
    }

    #[tokio::test]
    async fn test_local_move_in_missing_source_is_recoverable() {
        let (tmp, storage) = local();

        let err = storage.move_in("ghost.png", "entity").await.unwrap_err();
        assert!(matches!(err, StorageError::SourceMissing { .. }));
        assert_eq!(err.severity(), Severity::Recoverable);
        assert!(!tmp.path().join("entity").exists());
    }

    #[tokio::test]
    async fn test_local_move_in_rejects_directory_source() {
        let (tmp, storage) = local();
        std::fs::create_dir(tmp.path().join("folder.png")).unwrap();

        let err = storage.move_in("folder.png", "entity").await.unwrap_err();
        assert!(matches!(err, StorageError::SourceMissing { .. }));
    }

    #[tokio::test]
    async fn test_local_move_in_directory_blocked_is_fatal() {
        let (tmp, storage) = local();
        std::fs::write(tmp.path().join("a.png"), b"a").unwrap();
        std::fs::write(tmp.path().join("blocker"), b"not a dir").unwrap();

        let err = storage.move_in("a.png", "blocker/sub").await.unwrap_err();
        assert!(matches!(err, StorageError::DirectoryCreate { .. }));
        assert_eq!(err.severity(), Severity::Fatal);
        assert!(tmp.path().join("a.png").exists());
    }

    #[tokio::test]
    async fn test_local_remove_missing_is_recoverable() {
        let (tmp, storage) = local();
        std::fs::create_dir(tmp.path().join("d")).unwrap();

        let err = storage
            .remove(OsStr::new("gone.png"), "d")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Remove { .. }));
        assert_eq!(err.severity(), Severity::Recoverable);
    }

    #[tokio::test]
    async fn test_local_stage_and_discard() {
        let (tmp, storage) = local();

        let staged = storage
            .stage("report.tar.gz", Bytes::from("archive"))
            .await
            .unwrap();
        assert!(staged.name.ends_with(".tar.gz"));
        assert_eq!(staged.size, 7);
        assert!(storage.is_held(&staged.name).await.unwrap());
        assert!(tmp.path().join(&staged.name).exists());

        storage.discard(&staged.name).await.unwrap();
        assert!(!storage.is_held(&staged.name).await.unwrap());
        assert!(storage.discard(&staged.name).await.is_err());
    }

    #[tokio::test]
    async fn test_local_storage_path_traversal() {
        let (_tmp, storage) = local();

        let result = storage.list("../../etc").await;
        assert!(matches!(result, Err(StorageError::InvalidPath(_))));

        let result = storage.ensure_dir("/abs").await;
        assert!(matches!(result, Err(StorageError::InvalidPath(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_ensure_dir_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage::new(tmp.path()).with_dir_mode(0o700);
        storage.ensure_dir("private").await.unwrap();

        let mode = std::fs::metadata(tmp.path().join("private"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_memory_storage_move_in() {
        let storage = MemoryStorage::new();
        storage.hold("a.png", "data").await;

        storage.move_in("a.png", "d").await.unwrap();

        assert!(!storage.is_held("a.png").await.unwrap());
        assert_eq!(storage.read("d", "a.png").await, Some(Bytes::from("data")));
    }

    #[tokio::test]
    async fn test_memory_storage_denied_source_removal() {
        let storage = MemoryStorage::new();
        storage.hold("a.png", "data").await;
        storage.deny("a.png").await;

        let err = storage.move_in("a.png", "d").await.unwrap_err();
        assert!(matches!(err, StorageError::SourceRemove { .. }));
        assert_eq!(err.severity(), Severity::Recoverable);
        assert_eq!(storage.read("d", "a.png").await, Some(Bytes::from("data")));
    }

    #[test]
    fn test_generate_disk_filename() {
        let filename = LocalStorage::generate_disk_filename("report.xlsx");
        assert!(filename.ends_with(".xlsx"));

        let no_ext = LocalStorage::generate_disk_filename("noext");
        assert!(!no_ext.contains('.'));
    }

    /// Yields `data` once, then fails
    struct FailingReader {
        data: Option<&'static [u8]>,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            match self.data.take() {
                Some(data) => {
                    buf.put_slice(data);
                    std::task::Poll::Ready(Ok(()))
                }
                None => std::task::Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Other,
                    "disk went away",
                ))),
            }
        }
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_partial_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("upload.png");
        let mut reader = FailingReader {
            data: Some(&b"half"[..]),
        };

        let err = write_new_file(&path, &mut reader).await.unwrap_err();

        assert!(matches!(err, StorageError::Copy { .. }));
        assert_eq!(err.severity(), Severity::Fatal);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_write_new_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("upload.png");
        let mut reader: &[u8] = b"pixels";

        let size = write_new_file(&path, &mut reader).await.unwrap();

        assert_eq!(size, 6);
        assert_eq!(std::fs::read(&path).unwrap(), b"pixels");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_non_utf8_names_are_listed_and_removable() {
        use std::os::unix::ffi::OsStrExt;

        let (tmp, storage) = local();
        let raw = OsStr::from_bytes(b"bad\xff.png");
        std::fs::create_dir(tmp.path().join("d")).unwrap();
        std::fs::write(tmp.path().join("d").join(raw), b"x").unwrap();
        std::fs::write(tmp.path().join("d/ok.png"), b"y").unwrap();

        let names = storage.list("d").await.unwrap().unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n == raw));

        storage.remove(raw, "d").await.unwrap();
        assert_eq!(storage.list("d").await.unwrap().unwrap(), vec!["ok.png"]);
    }
}
