//! Destination for the files indexers produce.
//!
//! The worker hands the artifact to an [`ArtifactSink`] before the sandbox and
//! its workspace are torn down.

use async_trait::async_trait;
use autoindex_protocol::Index;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{SandboxError, SandboxResult};

#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Persist `artifact`, a host file that disappears once this returns.
    async fn store(&self, index: &Index, artifact: &Path) -> SandboxResult<()>;
}

/// Keeps artifacts at `<dir>/<repository id>/<commit>/<index id>-<file name>`.
pub struct DirectoryArtifactSink {
    dir: PathBuf,
}

impl DirectoryArtifactSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn destination(&self, index: &Index, artifact: &Path) -> PathBuf {
        let file_name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        self.dir
            .join(index.repository_id.to_string())
            .join(&index.commit)
            .join(format!("{}-{}", index.id, file_name))
    }
}

#[async_trait]
impl ArtifactSink for DirectoryArtifactSink {
    async fn store(&self, index: &Index, artifact: &Path) -> SandboxResult<()> {
        let final_path = self.destination(index, artifact);
        let parent = final_path
            .parent()
            .ok_or_else(|| SandboxError::Artifact(format!("bad destination {}", final_path.display())))?;
        tokio::fs::create_dir_all(parent).await?;

        // Copy next to the destination, then rename, so readers never see a partial file.
        let temp_path = parent.join(format!(
            ".{}.tmp",
            final_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        let bytes = tokio::fs::copy(artifact, &temp_path).await.map_err(|e| {
            SandboxError::Artifact(format!("copy {}: {}", artifact.display(), e))
        })?;
        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(SandboxError::Artifact(format!(
                "rename {} -> {}: {}",
                temp_path.display(),
                final_path.display(),
                e
            )));
        }

        info!(
            index_id = index.id,
            path = %final_path.display(),
            bytes,
            "Stored index artifact"
        );
        Ok(())
    }
}
