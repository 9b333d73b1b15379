//! Workspace sandbox: per-user filesystem confinement.
//!
//! Every user gets a confinement root `{workspace_root}/{user_id}`. All
//! paths that come from a client are relative to that root and must go
//! through [`Sandbox::resolve`] before anything touches storage; the
//! resulting [`SandboxedPath`] is the only path type the file operations
//! and executors accept.
//!
//! The traversal guard is deliberately blunt: any relative path that
//! contains `..` anywhere is rejected, including legitimate names such as
//! `notes..txt`. There is no normalization step that could be fooled.

pub mod files;

use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

const TRAVERSAL_TOKEN: &str = "..";

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The relative path tried to leave the confinement root. The message
    /// never includes the offending or resolved path.
    #[error("Path traversal blocked.")]
    PathTraversal,
    #[error("Invalid workspace user id.")]
    InvalidUser,
    #[error("Workspace I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An absolute path known to lie under one user's confinement root.
///
/// Only [`Sandbox`] can construct one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxedPath {
    root: PathBuf,
    path: PathBuf,
}

impl SandboxedPath {
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// The confinement root this path was resolved under.
    #[cfg(test)]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_root(&self) -> bool {
        self.path == self.root
    }
}

impl AsRef<Path> for SandboxedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for SandboxedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.display().fmt(f)
    }
}

/// Maps user-relative paths onto confinement roots below `workspace_root`.
#[derive(Debug, Clone)]
pub struct Sandbox {
    workspace_root: PathBuf,
}

impl Sandbox {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    /// Confinement root for `user_id`, without touching the filesystem.
    pub fn user_root(&self, user_id: &str) -> Result<SandboxedPath, SandboxError> {
        check_user_id(user_id)?;
        let root = self.workspace_root.join(user_id);
        Ok(SandboxedPath {
            path: root.clone(),
            root,
        })
    }

    /// Resolves `relative` under the confinement root of `user_id`.
    ///
    /// Leading separators are stripped, so `/src/app.ts` and `src/app.ts`
    /// resolve to the same place.
    pub fn resolve(&self, user_id: &str, relative: &str) -> Result<SandboxedPath, SandboxError> {
        if relative.contains(TRAVERSAL_TOKEN) {
            debug!("Rejected traversal attempt for user {user_id}");
            return Err(SandboxError::PathTraversal);
        }
        let root = self.user_root(user_id)?;
        let trimmed = relative.trim_start_matches(['/', '\\']);
        if Path::new(trimmed).is_absolute() {
            // e.g. a Windows drive prefix; joining would replace the root
            return Err(SandboxError::PathTraversal);
        }
        let path = if trimmed.is_empty() {
            root.path.clone()
        } else {
            root.path.join(trimmed)
        };
        Ok(SandboxedPath { root: root.root, path })
    }

    /// Creates the confinement root for `user_id` if it does not exist yet
    /// and returns it. Safe to call repeatedly and concurrently.
    pub async fn ensure_root(&self, user_id: &str) -> Result<SandboxedPath, SandboxError> {
        let root = self.user_root(user_id)?;
        tokio::fs::create_dir_all(root.as_path()).await?;
        Ok(root)
    }
}

/// A user id becomes one directory name, so it must be exactly one
/// normal path component.
fn check_user_id(user_id: &str) -> Result<(), SandboxError> {
    if user_id.is_empty() || user_id.contains(['/', '\\']) || user_id.contains(TRAVERSAL_TOKEN) {
        return Err(SandboxError::InvalidUser);
    }
    let mut components = Path::new(user_id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(SandboxError::InvalidUser),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_under_user_root() {
        let sandbox = Sandbox::new("/workspace");
        let path = sandbox.resolve("alice", "src/app.ts").unwrap();
        assert_eq!(path.as_path(), Path::new("/workspace/alice/src/app.ts"));
        assert_eq!(path.root(), Path::new("/workspace/alice"));
        assert!(path.as_path().starts_with(path.root()));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let sandbox = Sandbox::new("/workspace");
        assert!(matches!(
            sandbox.resolve("alice", "../../etc/passwd"),
            Err(SandboxError::PathTraversal)
        ));
        assert!(matches!(
            sandbox.resolve("alice", "src/../../bob/secret"),
            Err(SandboxError::PathTraversal)
        ));
    }

    #[test]
    fn test_traversal_guard_is_conservative() {
        // Legitimate names containing ".." are rejected too.
        let sandbox = Sandbox::new("/workspace");
        assert!(matches!(
            sandbox.resolve("alice", "notes..txt"),
            Err(SandboxError::PathTraversal)
        ));
    }

    #[test]
    fn test_traversal_message_does_not_leak_path() {
        let sandbox = Sandbox::new("/srv/secret-root");
        let err = sandbox.resolve("alice", "../x").unwrap_err();
        assert_eq!(err.to_string(), "Path traversal blocked.");
    }

    #[test]
    fn test_resolve_strips_leading_separator() {
        let sandbox = Sandbox::new("/workspace");
        let path = sandbox.resolve("alice", "/etc/passwd").unwrap();
        assert_eq!(path.as_path(), Path::new("/workspace/alice/etc/passwd"));
    }

    #[test]
    fn test_resolve_empty_is_root() {
        let sandbox = Sandbox::new("/workspace");
        let path = sandbox.resolve("alice", "").unwrap();
        assert!(path.is_root());
    }

    #[test]
    fn test_invalid_user_ids() {
        let sandbox = Sandbox::new("/workspace");
        for user in ["", ".", "..", "a/b", "..\\x", "bob/../alice"] {
            assert!(
                matches!(sandbox.resolve(user, "file"), Err(SandboxError::InvalidUser)
                    | Err(SandboxError::PathTraversal)),
                "{user:?}"
            );
            assert!(sandbox.user_root(user).is_err(), "{user:?}");
        }
    }

    #[tokio::test]
    async fn test_ensure_root_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path());

        let first = sandbox.ensure_root("alice").await.unwrap();
        assert!(first.as_path().is_dir());
        let second = sandbox.ensure_root("alice").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_path(), dir.path().join("alice"));
    }

    #[tokio::test]
    async fn test_ensure_root_concurrent() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path());
        let (a, b) = tokio::join!(sandbox.ensure_root("bob"), sandbox.ensure_root("bob"));
        assert_eq!(a.unwrap(), b.unwrap());
    }
}
