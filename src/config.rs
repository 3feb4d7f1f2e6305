use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::SyncError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// How long a run waits for another writer before giving up.
    /// Zero means fail immediately.
    #[serde(default)]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["chatSessions/*.json".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
        }
    }
}

fn default_parallelism() -> usize {
    4
}

/// Storage roots probed when `source.root` is not configured, in order.
pub fn candidate_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(home) = dirs::home_dir() {
        roots.push(home.join(".vscode-server/data/User/workspaceStorage"));
    }
    if let Some(config_dir) = dirs::config_dir() {
        // Linux: ~/.config, macOS: ~/Library/Application Support, Windows: %APPDATA%
        roots.push(config_dir.join("Code/User/workspaceStorage"));
        roots.push(config_dir.join("Code - OSS/User/workspaceStorage"));
        roots.push(config_dir.join("Code - Insiders/User/workspaceStorage"));
    }
    roots
}

impl Config {
    /// Resolve the discovery root: explicit config first, then the
    /// platform candidates. A missing root is a fatal configuration error.
    pub fn resolve_root(&self) -> Result<PathBuf, SyncError> {
        match &self.source.root {
            Some(root) if root.is_dir() => Ok(root.clone()),
            Some(root) => Err(SyncError::Configuration(format!(
                "source root does not exist: {}",
                root.display()
            ))),
            None => candidate_roots()
                .into_iter()
                .find(|p| p.is_dir())
                .ok_or_else(|| {
                    SyncError::Configuration(
                        "no workspace storage found; set source.root or pass --root".to_string(),
                    )
                }),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.sync.parallelism == 0 {
        anyhow::bail!("sync.parallelism must be >= 1");
    }

    if config.source.include_globs.is_empty() {
        anyhow::bail!("source.include_globs must not be empty");
    }

    for pattern in config
        .source
        .include_globs
        .iter()
        .chain(config.source.exclude_globs.iter())
    {
        globset::Glob::new(pattern)
            .with_context(|| format!("Invalid glob pattern in [source]: '{}'", pattern))?;
    }

    Ok(config)
}
