//! Filesystem checkpoint backend
//!
//! [`FileCheckpointSaver`] stores one file per session under a root directory,
//! which is what lets CLI conversations survive process restarts. Writes go to a
//! temporary file first and are renamed into place, so a crash mid-write leaves
//! the previous checkpoint intact rather than a torn one.
//!
//! Session ids become file names directly, so they are restricted to
//! `[A-Za-z0-9._-]`; anything else is rejected as
//! [`CheckpointError::InvalidSessionId`](crate::CheckpointError::InvalidSessionId)
//! before touching the filesystem.

use crate::{
    error::{CheckpointError, Result},
    traits::CheckpointSaver,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

const CHECKPOINT_EXTENSION: &str = "ckpt";

/// Durable checkpoint saver backed by a directory of per-session files
#[derive(Debug, Clone)]
pub struct FileCheckpointSaver {
    root: PathBuf,
}

impl FileCheckpointSaver {
    /// Create a saver rooted at `root`, creating the directory if needed
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory holding the checkpoint files
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate_session_id(session_id: &str) -> Result<()> {
        if session_id.is_empty() {
            return Err(CheckpointError::InvalidSessionId {
                session_id: session_id.to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if !session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(CheckpointError::InvalidSessionId {
                session_id: session_id.to_string(),
                reason: "contains characters outside [A-Za-z0-9._-]".to_string(),
            });
        }
        Ok(())
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", session_id, CHECKPOINT_EXTENSION))
    }
}

#[async_trait]
impl CheckpointSaver for FileCheckpointSaver {
    async fn load(&self, session_id: &str) -> Result<Option<Vec<u8>>> {
        Self::validate_session_id(session_id)?;

        match fs::read(self.path_for(session_id)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, session_id: &str, data: Vec<u8>) -> Result<()> {
        Self::validate_session_id(session_id)?;

        let target = self.path_for(session_id);
        let tmp = self.root.join(format!(
            "{}.{}.tmp",
            session_id, CHECKPOINT_EXTENSION
        ));

        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &target).await?;

        tracing::debug!(session_id, bytes = data.len(), "checkpoint written");
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        Self::validate_session_id(session_id)?;

        match fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(session) = name.strip_suffix(&format!(".{}", CHECKPOINT_EXTENSION)) {
                sessions.push(session.to_string());
            }
        }

        sessions.sort();
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn saver() -> (tempfile::TempDir, FileCheckpointSaver) {
        let dir = tempfile::tempdir().unwrap();
        let saver = FileCheckpointSaver::new(dir.path()).await.unwrap();
        (dir, saver)
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let (_dir, saver) = saver().await;

        saver.save("user-1", vec![1, 2, 3]).await.unwrap();
        assert_eq!(saver.load("user-1").await.unwrap(), Some(vec![1, 2, 3]));

        saver.delete("user-1").await.unwrap();
        assert_eq!(saver.load("user-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_load_missing_session_is_none() {
        let (_dir, saver) = saver().await;
        assert_eq!(saver.load("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let saver = FileCheckpointSaver::new(dir.path()).await.unwrap();
            saver.save("user-1", b"persisted".to_vec()).await.unwrap();
        }

        let reopened = FileCheckpointSaver::new(dir.path()).await.unwrap();
        assert_eq!(
            reopened.load("user-1").await.unwrap(),
            Some(b"persisted".to_vec())
        );
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let (_dir, saver) = saver().await;

        let err = saver.load("../escape").await.unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidSessionId { .. }));

        let err = saver.save("a/b", vec![]).await.unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidSessionId { .. }));
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let (_dir, saver) = saver().await;

        saver.save("beta", vec![]).await.unwrap();
        saver.save("alpha", vec![]).await.unwrap();

        assert_eq!(saver.list_sessions().await.unwrap(), vec!["alpha", "beta"]);
    }
}
