use crate::domain_model::*;
use crate::domain_port::*;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Persists the session record as a JSON file so it survives restarts.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSessionStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn io_error(e: std::io::Error) -> SessionStoreError {
    SessionStoreError::Io(e.to_string())
}

#[async_trait::async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<Option<Session>, SessionStoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(e)),
        };
        let session = serde_json::from_slice::<Session>(&raw)
            .map_err(|e| SessionStoreError::Serde(e.to_string()))?;
        Ok(Some(session))
    }

    async fn save(&self, session: &Session) -> Result<(), SessionStoreError> {
        let raw =
            serde_json::to_vec(session).map_err(|e| SessionStoreError::Serde(e.to_string()))?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await.map_err(io_error)?;
        }
        // write-then-rename so a crash never leaves half a record behind
        let staging = self.staging_path();
        tokio::fs::write(&staging, raw).await.map_err(io_error)?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(io_error)?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), SessionStoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e)),
        }
    }
}
