//! Fixture roots and file materialization.
//!
//! Every invocation gets its own empty root directory. Where that directory
//! lives and whether it survives the run is decided by a [`RootProvider`].

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;

/// Errors raised while preparing the fixture. All of them are fatal.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("failed to allocate fixture root: {0}")]
    Allocate(#[source] io::Error),
    #[error("file path {path:?} does not name a file inside the fixture root")]
    InvalidPath { path: String },
    #[error("failed to create directory ({}) for test file: {source}", dir.display())]
    CreateDir { dir: PathBuf, source: io::Error },
    #[error("failed to write file ({}): {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// An exclusive, initially empty directory for one invocation.
///
/// The path is canonical, so it matches what the child reads from `getcwd`.
#[derive(Debug)]
pub struct FixtureRoot {
    path: PathBuf,
    temp: Option<TempDir>,
}

impl FixtureRoot {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the directory outlives this value.
    pub fn is_kept(&self) -> bool {
        self.temp.is_none()
    }
}

/// Allocates fixture roots.
pub trait RootProvider: Send + Sync {
    /// Create a fresh empty directory. `label` names the test and only
    /// influences the directory name.
    fn allocate(&self, label: &str) -> io::Result<FixtureRoot>;
}

/// Roots in the system temp directory, removed when dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct TempRoots;

impl RootProvider for TempRoots {
    fn allocate(&self, label: &str) -> io::Result<FixtureRoot> {
        let temp = tempfile::Builder::new()
            .prefix(&dir_prefix(label))
            .tempdir()?;
        Ok(FixtureRoot {
            path: std::fs::canonicalize(temp.path())?,
            temp: Some(temp),
        })
    }
}

/// Roots created inside a fixed base directory and kept for inspection.
#[derive(Debug, Clone)]
pub struct DirRoots {
    base: PathBuf,
}

impl DirRoots {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// `<test_root>/.exectest/<timestamp>/`.
    pub fn local(test_root: &Path) -> Self {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        Self::new(test_root.join(".exectest").join(stamp.to_string()))
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

impl RootProvider for DirRoots {
    fn allocate(&self, label: &str) -> io::Result<FixtureRoot> {
        std::fs::create_dir_all(&self.base)?;
        let base = std::fs::canonicalize(&self.base)?;
        let temp = tempfile::Builder::new()
            .prefix(&dir_prefix(label))
            .tempdir_in(base)?;
        Ok(FixtureRoot {
            path: temp.keep(),
            temp: None,
        })
    }
}

fn dir_prefix(label: &str) -> String {
    let label: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if label.is_empty() {
        "exectest-".to_string()
    } else {
        format!("{label}-")
    }
}

/// Resolve a scheme file path below `root`.
///
/// Root and `.` components are skipped, so `/a` and `./a` both land at
/// `<root>/a`. Parent components are rejected.
pub fn resolve(root: &Path, path: &str) -> Result<PathBuf, FixtureError> {
    let mut resolved = root.to_path_buf();
    let mut named = false;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                named = true;
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(FixtureError::InvalidPath {
                    path: path.to_string(),
                });
            }
        }
    }
    if !named {
        return Err(FixtureError::InvalidPath {
            path: path.to_string(),
        });
    }
    Ok(resolved)
}

/// Write every file of the plan below `root`, creating parent directories.
#[tracing::instrument(skip_all, fields(root = %root.display(), files = files.len()))]
pub fn materialize(root: &Path, files: &BTreeMap<String, Vec<u8>>) -> Result<(), FixtureError> {
    for (name, content) in files {
        let path = resolve(root, name)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| FixtureError::CreateDir {
                dir: dir.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&path, content).map_err(|source| FixtureError::Write {
            path: path.clone(),
            source,
        })?;
        tracing::trace!(path = %path.display(), bytes = content.len(), "wrote fixture file");
    }
    Ok(())
}
