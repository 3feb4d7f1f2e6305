//! Source reader for IDE workspace storage.
//!
//! The storage root holds one opaque directory per workspace. Each
//! container may carry a `workspace.json` naming the project folder, and
//! stores chat sessions as JSON files matched by the configured globs
//! (`chatSessions/*.json` by default).
//!
//! Reading is blocking file I/O; callers run it on a blocking thread.
//! Payload iteration is lazy and restartable: re-reading a handle walks the
//! container again in file-name order.

use anyhow::Result;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::error::{SyncError, SyncIssue};
use crate::models::{RawPayload, SourceHandle};

/// Session files live at most this deep inside a container.
const MAX_DEPTH: usize = 4;

pub type PayloadIter<'a> = Box<dyn Iterator<Item = Result<RawPayload, SyncIssue>> + Send + 'a>;

/// A place session payloads can be discovered and read from.
pub trait SessionSource: Send + Sync {
    /// Human-readable location, for logs and progress.
    fn location(&self) -> String;

    /// Enumerate workspace containers. Fails only when the root itself is
    /// unusable.
    fn list_sources(&self) -> Result<Vec<SourceHandle>, SyncError>;

    /// Lazily read every raw session payload in one container. Per-file or
    /// per-container failures are yielded as issues, never panics.
    fn read_raw_sessions<'a>(&'a self, handle: &'a SourceHandle) -> PayloadIter<'a>;
}

/// VS Code style `workspaceStorage` directory.
pub struct WorkspaceStorage {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl WorkspaceStorage {
    pub fn new(root: PathBuf, config: &SourceConfig) -> Result<Self> {
        Ok(Self {
            root,
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&config.exclude_globs)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SessionSource for WorkspaceStorage {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn list_sources(&self) -> Result<Vec<SourceHandle>, SyncError> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            SyncError::Configuration(format!(
                "cannot read source root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let mut handles = Vec::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let container_id = entry.file_name().to_string_lossy().to_string();
            let (workspace_path, workspace_name) = read_workspace_meta(&dir)
                .map(|uri| decode_workspace_uri(&uri))
                .unwrap_or_default();
            let workspace_name = if workspace_name.is_empty() {
                container_id.clone()
            } else {
                workspace_name
            };
            handles.push(SourceHandle {
                container_id,
                container_dir: dir,
                workspace_name,
                workspace_path,
            });
        }

        // Sort for deterministic ordering
        handles.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        Ok(handles)
    }

    fn read_raw_sessions<'a>(&'a self, handle: &'a SourceHandle) -> PayloadIter<'a> {
        let walker = WalkDir::new(&handle.container_dir)
            .max_depth(MAX_DEPTH)
            .sort_by_file_name()
            .into_iter();

        Box::new(walker.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    return Some(Err(SyncIssue::source_read(
                        &handle.workspace_name,
                        format!("{}: {}", handle.container_dir.display(), e),
                    )))
                }
            };
            if !entry.file_type().is_file() {
                return None;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&handle.container_dir).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");
            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                return None;
            }
            Some(read_payload(handle, path))
        }))
    }
}

fn read_payload(handle: &SourceHandle, path: &Path) -> Result<RawPayload, SyncIssue> {
    let read = || -> std::io::Result<(Vec<u8>, DateTime<Utc>)> {
        let metadata = std::fs::metadata(path)?;
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
        Ok((std::fs::read(path)?, modified))
    };

    match read() {
        Ok((bytes, modified)) => Ok(RawPayload {
            container_id: handle.container_id.clone(),
            workspace_name: handle.workspace_name.clone(),
            workspace_path: handle.workspace_path.clone(),
            source_path: path.display().to_string(),
            bytes,
            modified,
        }),
        Err(e) => Err(SyncIssue::source_read(
            &handle.workspace_name,
            format!("{}: {}", path.display(), e),
        )),
    }
}

/// Folder or workspace-file URI recorded in a container's `workspace.json`.
fn read_workspace_meta(dir: &Path) -> Option<String> {
    let path = dir.join("workspace.json");
    let content = std::fs::read_to_string(&path).ok()?;
    let value: serde_json::Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unparseable workspace.json");
            return None;
        }
    };
    value
        .get("folder")
        .or_else(|| value.get("workspace"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Decode a workspace URI into `(path, name)`.
///
/// `file:///home/me/my%20app` becomes `("/home/me/my app", "my app")`;
/// remote URIs drop their authority; `.code-workspace` files are named by
/// their stem.
pub fn decode_workspace_uri(uri: &str) -> (String, String) {
    let without_scheme = match uri.find("://") {
        Some(idx) => {
            let rest = &uri[idx + 3..];
            // Drop the authority (empty for local file URIs)
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "",
            }
        }
        None => uri,
    };
    let path = percent_decode_str(without_scheme)
        .decode_utf8_lossy()
        .to_string();
    let trimmed = path.trim_end_matches('/');
    let name = Path::new(trimmed)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    (path, name)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
