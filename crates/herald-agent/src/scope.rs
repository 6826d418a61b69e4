use std::path::{Component, Path, PathBuf};

use herald_job::OwnerId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopePathError {
    #[error("working file path is empty")]
    Empty,
    #[error("working file path must be relative: {0}")]
    Absolute(String),
    #[error("path traversal is not allowed: {0}")]
    Traversal(String),
    #[error("working file escapes the owner's storage: {0}")]
    EscapesScope(String),
    #[error("working file not found: {0}")]
    Missing(String),
    #[error("working file is not a regular file: {0}")]
    NotAFile(String),
}

fn normalize_rel_path(rel: &str) -> Result<PathBuf, ScopePathError> {
    let trimmed = rel.trim();
    if trimmed.is_empty() {
        return Err(ScopePathError::Empty);
    }

    let p = Path::new(trimmed);
    if p.is_absolute() {
        return Err(ScopePathError::Absolute(rel.to_string()));
    }

    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => return Err(ScopePathError::Traversal(rel.to_string())),
            Component::Prefix(_) | Component::RootDir => {
                return Err(ScopePathError::Absolute(rel.to_string()));
            }
        }
    }

    if out.as_os_str().is_empty() {
        return Err(ScopePathError::Empty);
    }
    Ok(out)
}

/// An owner's private storage directory: `<storage_root>/<scope name>`.
#[derive(Debug, Clone)]
pub struct OwnerScope {
    root: PathBuf,
}

impl OwnerScope {
    pub fn new(storage_root: &Path, owner: &OwnerId) -> Self {
        Self {
            root: storage_root.join(owner.scope_name()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_exists(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Resolve a caller-supplied relative path to an existing regular file
    /// inside this scope. Symlinks are followed and the target must still
    /// land inside the canonical scope root.
    pub async fn resolve_existing(&self, rel: &str) -> Result<PathBuf, ScopePathError> {
        let normalized = normalize_rel_path(rel)?;

        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|_| ScopePathError::Missing(rel.to_string()))?;
        let canon = tokio::fs::canonicalize(self.root.join(&normalized))
            .await
            .map_err(|_| ScopePathError::Missing(rel.to_string()))?;
        if !canon.starts_with(&root) {
            return Err(ScopePathError::EscapesScope(rel.to_string()));
        }

        let meta = tokio::fs::metadata(&canon)
            .await
            .map_err(|_| ScopePathError::Missing(rel.to_string()))?;
        if !meta.is_file() {
            return Err(ScopePathError::NotAFile(rel.to_string()));
        }
        Ok(canon)
    }

    pub async fn resolve_all(&self, rels: &[String]) -> Result<Vec<PathBuf>, ScopePathError> {
        let mut out = Vec::with_capacity(rels.len());
        for rel in rels {
            out.push(self.resolve_existing(rel).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> OwnerId {
        OwnerId::new("bob@example.com")
    }

    async fn scope_with_file(dir: &Path, name: &str) -> OwnerScope {
        let scope = OwnerScope::new(dir, &owner());
        scope.ensure_exists().await.unwrap();
        tokio::fs::write(scope.root().join(name), b"a,b\n").await.unwrap();
        scope
    }

    #[test]
    fn normalize_rejects_absolute_and_parent() {
        assert!(matches!(
            normalize_rel_path("/etc/passwd"),
            Err(ScopePathError::Absolute(_))
        ));
        assert!(matches!(
            normalize_rel_path("a/../../b"),
            Err(ScopePathError::Traversal(_))
        ));
        assert!(matches!(normalize_rel_path("  "), Err(ScopePathError::Empty)));
        assert!(matches!(normalize_rel_path("./."), Err(ScopePathError::Empty)));
    }

    #[test]
    fn normalize_drops_cur_dir() {
        assert_eq!(
            normalize_rel_path("./exports/./a.csv").unwrap(),
            PathBuf::from("exports/a.csv")
        );
    }

    #[tokio::test]
    async fn resolves_file_inside_scope() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope_with_file(dir.path(), "messages.csv").await;
        let p = scope.resolve_existing("messages.csv").await.unwrap();
        assert!(p.ends_with(format!("{}/messages.csv", owner().scope_name())));
    }

    #[tokio::test]
    async fn missing_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope_with_file(dir.path(), "messages.csv").await;
        let err = scope.resolve_existing("other.csv").await.unwrap_err();
        assert!(matches!(err, ScopePathError::Missing(_)));
    }

    #[tokio::test]
    async fn another_owners_file_is_out_of_reach() {
        let dir = tempfile::tempdir().unwrap();
        let _mine = scope_with_file(dir.path(), "messages.csv").await;
        let theirs = OwnerScope::new(dir.path(), &OwnerId::new("eve@example.com"));
        theirs.ensure_exists().await.unwrap();

        let err = theirs
            .resolve_existing(&format!("../{}/messages.csv", owner().scope_name()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScopePathError::Traversal(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("secret.txt");
        tokio::fs::write(&outside, b"x").await.unwrap();

        let scope = OwnerScope::new(&dir.path().join("storage"), &owner());
        scope.ensure_exists().await.unwrap();
        std::os::unix::fs::symlink(&outside, scope.root().join("link.csv")).unwrap();

        let err = scope.resolve_existing("link.csv").await.unwrap_err();
        assert!(matches!(err, ScopePathError::EscapesScope(_)));
    }

    #[tokio::test]
    async fn directories_are_not_working_files() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope_with_file(dir.path(), "messages.csv").await;
        tokio::fs::create_dir(scope.root().join("media")).await.unwrap();
        let err = scope.resolve_existing("media").await.unwrap_err();
        assert!(matches!(err, ScopePathError::NotAFile(_)));
    }
}
