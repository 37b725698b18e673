use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{CacheError, CacheHealth, SessionStore};

const EXTENSION: &str = "json";

/// One JSON file per session. File names are the hex-encoded session id, so
/// arbitrary ids never escape the cache directory.
pub(crate) struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", hex::encode(session_id)))
    }

    fn session_id_of(path: &Path) -> Option<String> {
        if path.extension()?.to_str()? != EXTENSION {
            return None;
        }
        let bytes = hex::decode(path.file_stem()?.to_str()?).ok()?;
        String::from_utf8(bytes).ok()
    }
}

#[async_trait]
impl SessionStore for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn read(&self, session_id: &str) -> Result<Option<String>, CacheError> {
        match tokio::fs::read_to_string(self.path_for(session_id)).await {
            Ok(payload) => Ok(Some(payload)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes through a temporary file and a rename so a crash mid-write
    /// leaves the previous record intact.
    async fn write(&self, session_id: &str, payload: &str) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(session_id);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<(), CacheError> {
        match tokio::fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, CacheError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(session_id) = Self::session_id_of(&entry.path()) {
                ids.push(session_id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn health(&self) -> CacheHealth {
        match tokio::fs::create_dir_all(&self.dir).await {
            Ok(()) => CacheHealth::Healthy,
            Err(err) => CacheHealth::Unavailable(err.to_string()),
        }
    }
}
