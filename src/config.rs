//! Suite configuration and scheme discovery.
//!
//! A directory of `.scheme` files may carry an `exectest.yaml` (or
//! `exectest.toml`) with defaults shared by every scheme in it.

use crate::exec::Invocation;
use crate::fixture::{DirRoots, RootProvider, TempRoots};
use crate::scheme::Strictness;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Suite configuration file names, in lookup order.
pub const SUITE_CONFIG_FILENAMES: [&str; 2] = ["exectest.yaml", "exectest.toml"];

/// Extension of scheme files picked up by discovery.
pub const SCHEME_EXTENSION: &str = "scheme";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Suite-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SuiteConfig {
    /// Format version.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Program every scheme is run against (the CLI `--program` overrides it).
    #[serde(default)]
    pub program: Option<String>,

    /// Environment variables set for every invocation. Scheme `--env:`
    /// entries take precedence.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Whether the child inherits the runner's environment (default: true).
    #[serde(default = "default_true")]
    pub inherit_env: bool,

    /// How unknown directives and repeated declarations are treated.
    #[serde(default)]
    pub strictness: Strictness,

    /// Run scheme files one at a time instead of in parallel (default: false).
    #[serde(default)]
    pub serial: bool,

    /// Directory for fixture roots. Use "local" for `.exectest/<timestamp>/`
    /// next to the schemes, or a path. Roots created there are kept.
    /// When unset, roots live in the system temp directory and are deleted.
    #[serde(default)]
    pub sandbox_dir: Option<SandboxDir>,
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            program: None,
            env: BTreeMap::new(),
            inherit_env: true,
            strictness: Strictness::default(),
            serial: false,
            sandbox_dir: None,
        }
    }
}

impl SuiteConfig {
    /// Root provider for schemes under `test_root`.
    pub fn roots(&self, test_root: &Path) -> Box<dyn RootProvider> {
        match &self.sandbox_dir {
            None => Box::new(TempRoots),
            Some(SandboxDir::Local) => Box::new(DirRoots::local(test_root)),
            Some(SandboxDir::Path(p)) => Box::new(DirRoots::new(p)),
        }
    }

    /// Apply the environment settings to an invocation.
    pub fn apply(&self, invocation: &mut Invocation) {
        if !self.inherit_env {
            invocation.env_clear();
        }
        for (k, v) in &self.env {
            invocation.env(k, v);
        }
    }
}

/// Directory configuration for fixture roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(from = "String", into = "String")]
pub enum SandboxDir {
    /// `.exectest/<timestamp>/` in the test root directory.
    Local,
    /// A specific path.
    Path(PathBuf),
}

impl From<String> for SandboxDir {
    fn from(s: String) -> Self {
        if s == "local" {
            SandboxDir::Local
        } else {
            SandboxDir::Path(PathBuf::from(s))
        }
    }
}

impl From<SandboxDir> for String {
    fn from(dir: SandboxDir) -> String {
        match dir {
            SandboxDir::Local => "local".to_string(),
            SandboxDir::Path(p) => p.display().to_string(),
        }
    }
}

/// Load suite configuration from a directory.
///
/// Returns `None` if neither config file exists, `Err` if one exists but is
/// invalid.
pub fn load_suite_config(dir: &Path) -> Result<Option<SuiteConfig>, LoadError> {
    for name in SUITE_CONFIG_FILENAMES {
        let path = dir.join(name);
        if !path.is_file() {
            continue;
        }
        let contents = std::fs::read_to_string(&path)?;
        let config = if name.ends_with(".toml") {
            toml::from_str(&contents)?
        } else {
            serde_yaml::from_str(&contents)?
        };
        return Ok(Some(config));
    }
    Ok(None)
}

/// Find all scheme files in a directory, or return the single file.
///
/// Hidden directories are skipped, which keeps kept fixture roots under
/// `.exectest/` out of the search.
pub fn find_schemes(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut schemes = Vec::new();
    collect_schemes_recursive(path, &mut schemes)?;
    schemes.sort();
    Ok(schemes)
}

fn collect_schemes_recursive(dir: &Path, schemes: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with('.'));

        if path.is_dir() {
            if !hidden {
                collect_schemes_recursive(&path, schemes)?;
            }
        } else if path.extension().is_some_and(|ext| ext == SCHEME_EXTENSION) {
            schemes.push(path);
        }
    }
    Ok(())
}

/// JSON schema of the suite configuration.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(SuiteConfig)
}
