use anyhow::Result;
use std::path::PathBuf;

use crate::config::Config;
use crate::source::{SessionSource, WorkspaceStorage};

/// One row of the `harvest sources` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub container_id: String,
    pub workspace_name: String,
    pub sessions: usize,
    pub unreadable: usize,
}

pub fn scan_containers(source: &dyn SessionSource) -> Result<Vec<ContainerStatus>> {
    let mut rows = Vec::new();
    for handle in source.list_sources()? {
        let (mut sessions, mut unreadable) = (0, 0);
        for payload in source.read_raw_sessions(&handle) {
            match payload {
                Ok(_) => sessions += 1,
                Err(_) => unreadable += 1,
            }
        }
        rows.push(ContainerStatus {
            container_id: handle.container_id,
            workspace_name: handle.workspace_name,
            sessions,
            unreadable,
        });
    }
    Ok(rows)
}

pub fn list_sources(config: &Config, root: Option<PathBuf>) -> Result<()> {
    let mut config = config.clone();
    if root.is_some() {
        config.source.root = root;
    }

    let root = config.resolve_root()?;
    let storage = WorkspaceStorage::new(root, &config.source)?;
    let rows = scan_containers(&storage)?;

    println!("root: {}", storage.root().display());
    println!(
        "{:<36} {:<28} {:>8} {:>10}",
        "CONTAINER", "WORKSPACE", "SESSIONS", "UNREADABLE"
    );
    for row in &rows {
        println!(
            "{:<36} {:<28} {:>8} {:>10}",
            row.container_id, row.workspace_name, row.sessions, row.unreadable
        );
    }

    let with_sessions = rows.iter().filter(|r| r.sessions > 0).count();
    let total: usize = rows.iter().map(|r| r.sessions).sum();
    println!(
        "{} containers, {} with sessions, {} session files",
        rows.len(),
        with_sessions,
        total
    );

    Ok(())
}
