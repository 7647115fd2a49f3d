//! Shared and received directories.

use std::path::{Component, Path, PathBuf};

use ferry_core::MAX_FRAME_LEN;

/// Largest file served in one response; leaves room for the envelope inside a frame.
pub const MAX_FILE_SIZE: u64 = MAX_FRAME_LEN as u64 - 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("file {name} is {size} bytes (max {max})")]
    TooLarge { name: String, size: u64, max: u64 },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Shared directory (served read-only) and received directory (written per response).
#[derive(Debug, Clone)]
pub struct FileStore {
    shared_dir: PathBuf,
    received_dir: PathBuf,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A name must be exactly one normal path component.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == name && !name.contains('\\') => Ok(()),
        _ => Err(StoreError::InvalidName(name.to_string())),
    }
}

impl FileStore {
    /// Create both directories (and parents) if absent.
    pub async fn open(
        shared_dir: impl Into<PathBuf>,
        received_dir: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        let shared_dir = shared_dir.into();
        let received_dir = received_dir.into();
        tokio::fs::create_dir_all(&shared_dir)
            .await
            .map_err(io_err(&shared_dir))?;
        tokio::fs::create_dir_all(&received_dir)
            .await
            .map_err(io_err(&received_dir))?;
        Ok(Self {
            shared_dir,
            received_dir,
        })
    }

    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    fn shared_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.shared_dir.join(name))
    }

    /// Whether `name` is a regular file under the shared directory.
    pub async fn shared_exists(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.shared_path(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    /// Read a whole shared file.
    pub async fn read_shared(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.shared_path(name)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(StoreError::NotFound(name.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => return Err(io_err(&path)(e)),
        };
        if meta.len() > MAX_FILE_SIZE {
            return Err(StoreError::TooLarge {
                name: name.to_string(),
                size: meta.len(),
                max: MAX_FILE_SIZE,
            });
        }
        tokio::fs::read(&path).await.map_err(io_err(&path))
    }

    /// Write `data` to `name` under the received directory, replacing any existing file.
    /// Returns the path written.
    pub async fn write_received(&self, name: &str, data: &[u8]) -> Result<PathBuf, StoreError> {
        use tokio::io::AsyncWriteExt;

        validate_name(name)?;
        let path = self.received_dir.join(name);
        let mut opts = tokio::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(0o644);
        let mut file = opts.open(&path).await.map_err(io_err(&path))?;
        file.write_all(data).await.map_err(io_err(&path))?;
        file.flush().await.map_err(io_err(&path))?;
        Ok(path)
    }
}
