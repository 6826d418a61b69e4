use std::path::{Path, PathBuf};

use herald_job::{JobKind, OwnerId};
use tokio::io::AsyncWriteExt;

/// A secrets file written for exactly one job. The job's exit observer
/// calls [`StagedSecrets::remove`]; if the value is dropped first (a
/// cancelled launch, a lost exit hook) `Drop` deletes the file instead.
#[derive(Debug)]
pub struct StagedSecrets {
    path: PathBuf,
    armed: bool,
}

fn staged_file_name(owner: &OwnerId, kind: JobKind) -> String {
    let unix_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    // The random suffix keeps same-millisecond launches apart.
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_secrets_{}_{}_{}.json",
        kind.as_str().replace('-', ""),
        owner.scope_name(),
        unix_ms,
        &nonce[..12]
    )
}

impl StagedSecrets {
    pub async fn write(
        dir: &Path,
        owner: &OwnerId,
        kind: JobKind,
        secrets: &[String],
    ) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(staged_file_name(owner, kind));
        let data = serde_json::to_vec(secrets)?;

        let mut opts = tokio::fs::OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        opts.mode(0o600);

        let mut f = opts.open(&path).await?;
        let staged = Self { path, armed: true };
        if let Err(err) = write_all_and_flush(&mut f, &data).await {
            drop(f);
            staged.remove().await;
            return Err(err);
        }
        Ok(staged)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort delete. Never fails; an already-missing file is fine.
    pub async fn remove(mut self) {
        self.armed = false;
        log_remove_result(&self.path, tokio::fs::remove_file(&self.path).await);
    }
}

impl Drop for StagedSecrets {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(path = %self.path.display(), "staged secrets dropped before cleanup");
            log_remove_result(&self.path, std::fs::remove_file(&self.path));
        }
    }
}

fn log_remove_result(path: &Path, res: std::io::Result<()>) {
    match res {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to delete staged secrets file"
            );
        }
    }
}

async fn write_all_and_flush(f: &mut tokio::fs::File, data: &[u8]) -> std::io::Result<()> {
    f.write_all(data).await?;
    f.flush().await?;
    f.sync_all().await
}
