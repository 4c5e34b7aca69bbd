use crate::models::settings::Settings;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Offsite copy of backup artifacts behind a narrow put/get/delete
/// surface. The store itself is a mounted directory (NFS share, object
/// store gateway, ...); transient failures are retried here with a
/// bounded backoff so callers see only the exhausted result.
pub struct Transport {
    base_dir: PathBuf,
}

pub struct UploadResult {
    pub remote_key: String,
}

impl Transport {
    /// Returns `None` when no offsite store is configured; callers treat
    /// that as "local-only" rather than an error.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        if !settings.remote_enabled || settings.remote_dir.is_empty() {
            return None;
        }
        Some(Self {
            base_dir: PathBuf::from(&settings.remote_dir),
        })
    }

    /// Remote keys are date-prefixed: `YYYY-MM-DD/<filename>`.
    pub fn remote_key_for(filename: &str) -> String {
        let date = chrono::Utc::now().format("%Y-%m-%d");
        format!("{}/{}", date, filename)
    }

    pub async fn put(&self, local_path: &Path, remote_key: &str) -> anyhow::Result<UploadResult> {
        let target = self.base_dir.join(remote_key);
        let mut last_err = None;

        for attempt in 1..=MAX_RETRIES {
            match self.try_put(local_path, &target).await {
                Ok(()) => {
                    return Ok(UploadResult {
                        remote_key: remote_key.to_string(),
                    })
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max = MAX_RETRIES,
                        error = %e,
                        "Transport upload attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(RETRY_DELAY * attempt).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Upload failed")))
    }

    async fn try_put(&self, local_path: &Path, target: &Path) -> anyhow::Result<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local_path, target).await?;

        // Verify the copy landed intact before reporting success.
        let local_size = tokio::fs::metadata(local_path).await?.len();
        let remote_size = tokio::fs::metadata(target).await?.len();
        if local_size != remote_size {
            anyhow::bail!("Size mismatch: local {}, remote {}", local_size, remote_size);
        }
        Ok(())
    }

    pub async fn get(&self, remote_key: &str, local_path: &Path) -> anyhow::Result<()> {
        let source = self.base_dir.join(remote_key);
        let mut last_err = None;

        for attempt in 1..=MAX_RETRIES {
            if let Some(parent) = local_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            match tokio::fs::copy(&source, local_path).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max = MAX_RETRIES,
                        error = %e,
                        "Transport download attempt failed"
                    );
                    last_err = Some(anyhow::Error::from(e));
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(RETRY_DELAY * attempt).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Download failed")))
    }

    pub async fn delete(&self, remote_key: &str) -> anyhow::Result<()> {
        let target = self.base_dir.join(remote_key);
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            // Already gone is success for a delete.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(dir: &Path) -> Transport {
        Transport {
            base_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let remote = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let src = work.path().join("full_1.gz");
        std::fs::write(&src, b"archive").unwrap();

        let t = transport(remote.path());
        let result = t.put(&src, "2026-01-01/full_1.gz").await.unwrap();
        assert_eq!(result.remote_key, "2026-01-01/full_1.gz");

        let dst = work.path().join("downloaded.gz");
        t.get("2026-01-01/full_1.gz", &dst).await.unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"archive");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let remote = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let src = work.path().join("full_1.gz");
        std::fs::write(&src, b"archive").unwrap();

        let t = transport(remote.path());
        t.put(&src, "k/full_1.gz").await.unwrap();
        t.delete("k/full_1.gz").await.unwrap();
        t.delete("k/full_1.gz").await.unwrap();
    }

    #[test]
    fn test_disabled_settings_yield_no_transport() {
        let settings = Settings::default();
        assert!(Transport::from_settings(&settings).is_none());
    }
}
