use tokio::fs;

use crate::{Digest, KociError, KociResult};

use super::{OciLayout, ALGORITHMS};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OciLayout {
    /// Deletes everything the index no longer reaches.
    ///
    /// Refuses to run while transfers or removals are active. First clears the
    /// staging area, then deletes every blob whose digest is outside the
    /// transitive closure of the index's manifests. Returns the digests of the
    /// deleted blobs.
    pub async fn gc(&self) -> KociResult<Vec<Digest>> {
        if !self.coordinator.is_idle() {
            return Err(KociError::StoreBusy("transfers in progress".to_string()));
        }
        if !self.removals_idle() {
            return Err(KociError::StoreBusy("removals in progress".to_string()));
        }

        for algorithm in ALGORITHMS {
            let staging = self.staging_dir.join(algorithm.as_str());
            let mut entries = match fs::read_dir(&staging).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    fs::remove_file(entry.path()).await?;
                }
            }
        }

        let manifests = self.index.read().await.manifests().clone();
        let referenced = self.expand(&manifests).await;

        let mut deleted = Vec::new();
        for algorithm in ALGORITHMS {
            let dir = self.blobs_dir.join(algorithm.as_str());
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Ok(digest) = format!("{}:{}", algorithm.as_str(), name.to_string_lossy())
                    .parse::<Digest>()
                else {
                    continue;
                };
                if !referenced.contains(&digest) {
                    fs::remove_file(entry.path()).await?;
                    deleted.push(digest);
                }
            }
        }

        tracing::debug!(count = deleted.len(), "garbage collected");
        Ok(deleted)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
