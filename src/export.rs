//! Export indexer units as JSON.
//!
//! One addressable text unit per session: identifying metadata plus the
//! session's conversation turns joined with `\n---\n`. Units that carry
//! only a file edit contribute no text. An external indexer can skip
//! sessions whose `fingerprint` it has already embedded.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::Config;
use crate::db;

/// Separator placed between conversation turns in a unit's text.
pub const TURN_SEPARATOR: &str = "\n---\n";

#[derive(Debug, Serialize)]
pub struct IndexUnit {
    pub session_id: String,
    pub workspace_name: String,
    pub title: Option<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub session_type: String,
    pub fingerprint: String,
    pub text: String,
}

/// Build indexer units, optionally restricted to one workspace.
pub async fn collect_units(pool: &SqlitePool, workspace: Option<&str>) -> Result<Vec<IndexUnit>> {
    let session_rows = sqlx::query(
        r#"
        SELECT session_id, workspace_name, title, start_time, end_time, session_type, fingerprint
        FROM sessions
        WHERE ?1 IS NULL OR workspace_name = ?1
        ORDER BY start_time, session_id
        "#,
    )
    .bind(workspace)
    .fetch_all(pool)
    .await?;

    let turn_rows = sqlx::query(
        r#"
        SELECT m.session_id, m.content
        FROM session_messages m
        JOIN sessions s ON s.session_id = m.session_id
        WHERE (?1 IS NULL OR s.workspace_name = ?1) AND TRIM(m.content) != ''
        ORDER BY m.session_id, m.position
        "#,
    )
    .bind(workspace)
    .fetch_all(pool)
    .await?;

    let mut turns: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in &turn_rows {
        turns
            .entry(row.get("session_id"))
            .or_default()
            .push(row.get("content"));
    }

    Ok(session_rows
        .iter()
        .map(|row| {
            let session_id: String = row.get("session_id");
            let text = turns
                .get(&session_id)
                .map(|t| t.join(TURN_SEPARATOR))
                .unwrap_or_default();
            IndexUnit {
                workspace_name: row.get("workspace_name"),
                title: row.get("title"),
                start_time: row.get("start_time"),
                end_time: row.get("end_time"),
                session_type: row.get("session_type"),
                fingerprint: row.get("fingerprint"),
                text,
                session_id,
            }
        })
        .collect())
}

/// Export indexer units as JSON.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub async fn run_export(config: &Config, output: Option<&Path>, workspace: Option<&str>) -> Result<()> {
    let pool = db::connect(config).await?;
    let units = collect_units(&pool, workspace).await?;
    let json = serde_json::to_string_pretty(&units)?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &json)
                .with_context(|| format!("Failed to write export: {}", path.display()))?;
            eprintln!("Exported {} sessions to {}", units.len(), path.display());
        }
        None => {
            println!("{}", json);
        }
    }

    pool.close().await;
    Ok(())
}
