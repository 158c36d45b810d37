// Per-submission workspace: unique file identity plus guaranteed cleanup

use crate::error::WorkspaceError;
use arbiter_common::types::Language;
use std::borrow::Cow;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Neutralise characters in submitted source that could break a downstream
/// shell invocation. Sources currently pass through untouched.
pub fn escape_source(source: &str) -> Cow<'_, str> {
    Cow::Borrowed(source)
}

/// Deletes every registered path when dropped
#[derive(Debug, Default)]
pub struct CleanupGuard {
    paths: Vec<PathBuf>,
}

impl CleanupGuard {
    pub fn register(&mut self, path: PathBuf) {
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        for path in self.paths.drain(..).rev() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed workspace file"),
                // e.g. the binary of a compile that never produced one
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove workspace file"),
            }
        }
    }
}

/// Files belonging to one pipeline run, named by a fresh uuid so that
/// concurrent runs never share a path
#[derive(Debug)]
pub struct Workspace {
    id: String,
    source_path: PathBuf,
    exec_path: PathBuf,
    cleanup: CleanupGuard,
}

impl Workspace {
    pub fn allocate(code_dir: &Path, language: &Language) -> Self {
        let id = Uuid::new_v4().to_string();
        let exec_path = code_dir.join(&id);
        let source_path = code_dir.join(format!("{}.{}", id, language.extension));

        Self {
            id,
            source_path,
            exec_path,
            cleanup: CleanupGuard::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn exec_path(&self) -> &Path {
        &self.exec_path
    }

    pub fn registered(&self) -> &[PathBuf] {
        self.cleanup.paths()
    }

    /// Schedule a path for deletion when the workspace is dropped
    pub fn register(&mut self, path: PathBuf) {
        self.cleanup.register(path);
    }

    /// Escape and write the submission's source
    pub async fn stage_source(&mut self, source: &str) -> Result<(), WorkspaceError> {
        let escaped = escape_source(source);
        let path = self.source_path.clone();
        self.stage_file(path, &escaped).await
    }

    /// Write a transient file; it is removed with the workspace
    pub async fn stage_file(&mut self, path: PathBuf, contents: &str) -> Result<(), WorkspaceError> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent).await?;
        }

        self.register(path.clone());
        tokio::fs::write(&path, contents)
            .await
            .map_err(|source| WorkspaceError::Write { path, source })
    }
}

pub async fn ensure_dir(path: &Path) -> Result<(), WorkspaceError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| WorkspaceError::CreateDir {
            path: path.to_path_buf(),
            source,
        })
}

/// Express `path` relative to `base`, resolving both lexically against the
/// current directory
pub fn relative_to(path: &Path, base: &Path) -> Result<PathBuf, WorkspaceError> {
    let absolute = |p: &Path| {
        std::path::absolute(p)
            .map(|abs| normalize(&abs))
            .map_err(|source| WorkspaceError::Resolve {
                path: p.to_path_buf(),
                source,
            })
    };
    let path = absolute(path)?;
    let base = absolute(base)?;

    let common = path
        .components()
        .zip(base.components())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in base.components().skip(common) {
        relative.push("..");
    }
    for component in path.components().skip(common) {
        relative.push(component);
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    Ok(relative)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
