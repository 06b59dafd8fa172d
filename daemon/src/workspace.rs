//! File access confined to the work root

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::config::STATE_DIR;
use crate::error::WorkspaceError;

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entry names directly under the root, sorted. The daemon's own state
    /// directory is left out.
    pub async fn list_files(&self) -> Result<Vec<String>, WorkspaceError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|source| self.io_error(&self.root, source))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| self.io_error(&self.root, source))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name != STATE_DIR {
                files.push(name);
            }
        }
        files.sort();
        Ok(files)
    }

    pub async fn read_file(&self, name: &str) -> Result<String, WorkspaceError> {
        let path = self.resolve(name)?;
        debug!(path = %path.display(), "reading file");
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| self.io_error(&path, source))
    }

    /// Write `content` to `name`, creating parent directories as needed
    pub async fn write_file(&self, name: &str, content: &str) -> Result<(), WorkspaceError> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io_error(parent, source))?;
        }
        debug!(path = %path.display(), bytes = content.len(), "writing file");
        tokio::fs::write(&path, content)
            .await
            .map_err(|source| self.io_error(&path, source))
    }

    /// Join a client-supplied relative name onto the root. Absolute paths
    /// and `..` components are rejected.
    fn resolve(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        if name.is_empty() {
            return Err(WorkspaceError::MissingName);
        }
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(WorkspaceError::OutsideRoot(relative.to_path_buf()));
        }
        Ok(self.root.join(relative))
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> WorkspaceError {
        WorkspaceError::Io {
            path: path.strip_prefix(&self.root).unwrap_or(path).to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_then_read_and_list() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace::new(tmp.path().to_path_buf());

        workspace.write_file("index.html", "<h1>hi</h1>").await.unwrap();
        workspace.write_file("src/app.js", "let x = 1;").await.unwrap();
        std::fs::create_dir(tmp.path().join(STATE_DIR)).unwrap();

        assert_eq!(workspace.read_file("index.html").await.unwrap(), "<h1>hi</h1>");
        assert_eq!(workspace.read_file("./src/app.js").await.unwrap(), "let x = 1;");
        assert_eq!(workspace.list_files().await.unwrap(), vec!["index.html", "src"]);
    }

    #[tokio::test]
    async fn rejects_paths_outside_root() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace::new(tmp.path().join("root"));

        for name in ["../secret", "/etc/passwd", "a/../../b"] {
            assert!(
                matches!(workspace.read_file(name).await, Err(WorkspaceError::OutsideRoot(_))),
                "{name} should be rejected"
            );
            assert!(matches!(
                workspace.write_file(name, "x").await,
                Err(WorkspaceError::OutsideRoot(_))
            ));
        }
        assert!(!tmp.path().join("secret").exists());
    }

    #[tokio::test]
    async fn empty_name_and_missing_file() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace::new(tmp.path().to_path_buf());

        assert!(matches!(workspace.read_file("").await, Err(WorkspaceError::MissingName)));
        match workspace.read_file("nope.txt").await {
            Err(WorkspaceError::Io { path, .. }) => assert_eq!(path, PathBuf::from("nope.txt")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_root_lists_as_error() {
        let tmp = TempDir::new().unwrap();
        let workspace = Workspace::new(tmp.path().join("gone"));
        assert!(workspace.list_files().await.is_err());
    }
}
