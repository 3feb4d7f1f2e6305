//! Store statistics.
//!
//! Summarizes what has been backed up: session and message totals, the
//! session type split, per-workspace aggregates and the latest runs. Used
//! by `harvest stats` to check that syncs are landing.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// Rows shown in the per-workspace table.
const TOP_WORKSPACES: i64 = 20;

/// Most recent active days shown in the activity trend.
const RECENT_DAYS: i64 = 7;

#[derive(Debug, Default, PartialEq)]
pub struct StoreStats {
    pub sessions: i64,
    pub messages: i64,
    pub tokens: i64,
    pub workspaces: i64,
    pub conversation: i64,
    pub code_edit: i64,
    pub mixed: i64,
    pub edit_lines: i64,
    pub runs: i64,
    pub failed_runs: i64,
    pub by_workspace: Vec<WorkspaceStats>,
    /// Newest first, across all workspaces.
    pub recent_days: Vec<DayActivity>,
    pub last_run: Option<LastRun>,
}

#[derive(Debug, PartialEq)]
pub struct WorkspaceStats {
    pub name: String,
    pub sessions: i64,
    pub messages: i64,
    pub active_days: i64,
    pub edit_lines: i64,
    pub last_session: i64,
}

/// One UTC day from the `activity_totals` view.
#[derive(Debug, PartialEq)]
pub struct DayActivity {
    pub day_start: i64,
    pub sessions: i64,
    pub messages: i64,
}

#[derive(Debug, PartialEq)]
pub struct LastRun {
    pub started_at: i64,
    pub success: bool,
    pub sessions_seen: i64,
    pub sessions_new: i64,
    pub sessions_updated: i64,
    pub errors: i64,
    pub duration_ms: i64,
}

pub async fn collect_stats(pool: &SqlitePool) -> Result<StoreStats> {
    let totals = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS sessions,
            COALESCE(SUM(message_count), 0) AS messages,
            COALESCE(SUM(total_tokens), 0) AS tokens,
            COALESCE(SUM(session_type = 'conversation'), 0) AS conversation,
            COALESCE(SUM(session_type = 'code_edit'), 0) AS code_edit,
            COALESCE(SUM(session_type = 'mixed'), 0) AS mixed,
            CAST(MIN(TOTAL(edit_line_count), 9223372036854775807) AS INTEGER) AS edit_lines
        FROM sessions
        "#,
    )
    .fetch_one(pool)
    .await?;

    let workspaces: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workspaces")
        .fetch_one(pool)
        .await?;

    let (runs, failed_runs): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(success = 0), 0) FROM backup_runs",
    )
    .fetch_one(pool)
    .await?;

    let by_workspace = sqlx::query(
        r#"
        SELECT workspace_name, session_count, total_messages, active_days,
               edit_line_count, last_session
        FROM workspaces
        ORDER BY session_count DESC, workspace_name
        LIMIT ?
        "#,
    )
    .bind(TOP_WORKSPACES)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| WorkspaceStats {
        name: row.get("workspace_name"),
        sessions: row.get("session_count"),
        messages: row.get("total_messages"),
        active_days: row.get("active_days"),
        edit_lines: row.get("edit_line_count"),
        last_session: row.get("last_session"),
    })
    .collect();

    let recent_days = sqlx::query_as::<_, (i64, i64, i64)>(
        r#"
        SELECT bucket_start, session_count, message_count
        FROM activity_totals
        WHERE granularity = 'day'
        ORDER BY bucket_start DESC
        LIMIT ?
        "#,
    )
    .bind(RECENT_DAYS)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|(day_start, sessions, messages)| DayActivity {
        day_start,
        sessions,
        messages,
    })
    .collect();

    let last_run = sqlx::query(
        r#"
        SELECT started_at, success, sessions_seen, sessions_new, sessions_updated,
               errors, duration_ms
        FROM backup_runs
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?
    .map(|row| LastRun {
        started_at: row.get("started_at"),
        success: row.get("success"),
        sessions_seen: row.get("sessions_seen"),
        sessions_new: row.get("sessions_new"),
        sessions_updated: row.get("sessions_updated"),
        errors: row.get("errors"),
        duration_ms: row.get("duration_ms"),
    });

    Ok(StoreStats {
        sessions: totals.get("sessions"),
        messages: totals.get("messages"),
        tokens: totals.get("tokens"),
        workspaces,
        conversation: totals.get("conversation"),
        code_edit: totals.get("code_edit"),
        mixed: totals.get("mixed"),
        edit_lines: totals.get("edit_lines"),
        runs,
        failed_runs,
        by_workspace,
        recent_days,
        last_run,
    })
}

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Chat Harvest: Store Stats");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Sessions:    {}", stats.sessions);
    println!("  Messages:    {}", stats.messages);
    println!("  Tokens:      ~{}", stats.tokens);
    println!("  Workspaces:  {}", stats.workspaces);
    println!(
        "  Types:       {} conversation / {} code_edit / {} mixed",
        stats.conversation, stats.code_edit, stats.mixed
    );
    println!("  Edit lines:  {}", stats.edit_lines);
    println!("  Runs:        {} ({} failed)", stats.runs, stats.failed_runs);

    match &stats.last_run {
        Some(run) => println!(
            "  Last run:    {} ({}, {} seen, {} new, {} updated, {} issues, {} ms)",
            format_ts_relative(run.started_at),
            if run.success { "ok" } else { "FAILED" },
            run.sessions_seen,
            run.sessions_new,
            run.sessions_updated,
            run.errors,
            run.duration_ms
        ),
        None => println!("  Last run:    never"),
    }

    if !stats.by_workspace.is_empty() {
        println!();
        println!("  By workspace:");
        println!(
            "  {:<28} {:>8} {:>9} {:>6} {:>8}   {}",
            "WORKSPACE", "SESSIONS", "MESSAGES", "DAYS", "EDITS", "LAST SESSION"
        );
        println!("  {}", "-".repeat(84));

        for ws in &stats.by_workspace {
            println!(
                "  {:<28} {:>8} {:>9} {:>6} {:>8}   {}",
                ws.name,
                ws.sessions,
                ws.messages,
                ws.active_days,
                ws.edit_lines,
                format_ts_relative(ws.last_session)
            );
        }
    }

    if !stats.recent_days.is_empty() {
        println!();
        println!("  Recent activity:");
        for day in &stats.recent_days {
            println!(
                "  {}  {:>5} sessions  {:>6} messages",
                format_day(day.day_start),
                day.sessions,
                day.messages
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        format_ts_iso(ts)
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_day(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
