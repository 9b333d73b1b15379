//! File storage operations scoped to a user's confinement root.
//!
//! Every argument is a client-supplied relative path; each one is resolved
//! through the sandbox before the filesystem is touched. All I/O uses
//! `tokio::fs` so large files don't block the runtime.

use tracing::info;

use super::{Sandbox, SandboxError};

impl Sandbox {
    /// Names of the entries of a directory, sorted. Directories and files
    /// are not told apart.
    pub async fn list_dir(&self, user_id: &str, relative: &str) -> Result<Vec<String>, SandboxError> {
        let path = self.resolve(user_id, relative)?;
        self.ensure_root(user_id).await?;

        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(path.as_path()).await?;
        while let Some(entry) = dir.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    pub async fn read_file(&self, user_id: &str, relative: &str) -> Result<String, SandboxError> {
        let path = self.resolve(user_id, relative)?;
        Ok(tokio::fs::read_to_string(path.as_path()).await?)
    }

    /// Writes `content`, creating missing parent directories.
    pub async fn write_file(&self, user_id: &str, relative: &str, content: &str) -> Result<(), SandboxError> {
        let path = self.resolve(user_id, relative)?;
        if let Some(parent) = path.as_path().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path.as_path(), content).await?;
        info!("Saved {} bytes to {relative} for {user_id}", content.len());
        Ok(())
    }

    pub async fn rename(&self, user_id: &str, from: &str, to: &str) -> Result<(), SandboxError> {
        let source = self.resolve(user_id, from)?;
        let target = self.resolve(user_id, to)?;
        if source.is_root() || target.is_root() {
            return Err(SandboxError::PathTraversal);
        }
        if let Some(parent) = target.as_path().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(source.as_path(), target.as_path()).await?;
        info!("Renamed {from} -> {to} for {user_id}");
        Ok(())
    }

    /// Removes a file, or a directory recursively.
    pub async fn remove(&self, user_id: &str, relative: &str) -> Result<(), SandboxError> {
        let path = self.resolve(user_id, relative)?;
        if path.is_root() {
            // Deleting the confinement root itself is never a file operation
            return Err(SandboxError::PathTraversal);
        }
        let meta = tokio::fs::metadata(path.as_path()).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(path.as_path()).await?;
        } else {
            tokio::fs::remove_file(path.as_path()).await?;
        }
        info!("Removed {relative} for {user_id}");
        Ok(())
    }
}
