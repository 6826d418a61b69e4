use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Arc,
};

use futures_util::future::BoxFuture;
use herald_job::OwnerId;
use tokio::sync::RwLock;

/// Resolves an owner's secret references to the secrets themselves.
/// References the owner does not hold are skipped, never reported.
pub trait CredentialStore: Send + Sync {
    fn resolve<'a>(
        &'a self,
        owner: &'a OwnerId,
        refs: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<Vec<String>>>;
}

/// One JSON object per owner at `<dir>/<scope name>.json`, mapping
/// reference to secret.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn load(&self, owner: &OwnerId) -> anyhow::Result<BTreeMap<String, String>> {
        let path = self.dir.join(format!("{}.json", owner.scope_name()));
        let raw = match tokio::fs::read(&path).await {
            Ok(v) => v,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => {
                return Err(anyhow::anyhow!("read {}: {err}", path.display()));
            }
        };
        serde_json::from_slice(&raw)
            .map_err(|e| anyhow::anyhow!("parse {}: {e}", path.display()))
    }
}

impl CredentialStore for FileCredentialStore {
    fn resolve<'a>(
        &'a self,
        owner: &'a OwnerId,
        refs: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<Vec<String>>> {
        Box::pin(async move {
            let known = self.load(owner).await?;
            Ok(refs.iter().filter_map(|r| known.get(r).cloned()).collect())
        })
    }
}

/// In-memory store for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    inner: Arc<RwLock<HashMap<OwnerId, BTreeMap<String, String>>>>,
}

impl MemoryCredentialStore {
    pub async fn insert(&self, owner: OwnerId, reference: &str, secret: &str) {
        self.inner
            .write()
            .await
            .entry(owner)
            .or_default()
            .insert(reference.to_string(), secret.to_string());
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn resolve<'a>(
        &'a self,
        owner: &'a OwnerId,
        refs: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<Vec<String>>> {
        Box::pin(async move {
            let map = self.inner.read().await;
            let Some(known) = map.get(owner) else {
                return Ok(Vec::new());
            };
            Ok(refs.iter().filter_map(|r| known.get(r).cloned()).collect())
        })
    }
}
