use anyhow::Result;
use sqlx::SqliteConnection;

use crate::config::Config;
use crate::db;

/// Create or upgrade the store schema. Every statement is idempotent, so
/// this runs at the start of each sync inside the run's transaction.
pub async fn apply(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    // Canonical sessions, one row per session id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            container_id TEXT NOT NULL,
            workspace_name TEXT NOT NULL,
            workspace_path TEXT NOT NULL DEFAULT '',
            session_type TEXT NOT NULL DEFAULT 'conversation'
                CHECK (session_type IN ('conversation', 'code_edit', 'mixed')),
            message_count INTEGER NOT NULL,
            total_tokens INTEGER NOT NULL,
            edit_file_paths TEXT NOT NULL DEFAULT '[]',
            edit_line_count INTEGER NOT NULL DEFAULT 0,
            edit_files_count INTEGER NOT NULL DEFAULT 0,
            start_time INTEGER NOT NULL,
            end_time INTEGER NOT NULL,
            title TEXT,
            requester TEXT,
            responder TEXT,
            model_id TEXT,
            agent_name TEXT,
            source_path TEXT NOT NULL,
            source_size_bytes INTEGER NOT NULL DEFAULT 0,
            partial INTEGER NOT NULL DEFAULT 0,
            fingerprint TEXT NOT NULL,
            synced_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_messages (
            session_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp INTEGER,
            model TEXT,
            edit_file_path TEXT,
            edit_line_count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (session_id, position),
            FOREIGN KEY (session_id) REFERENCES sessions(session_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    // Per-workspace aggregates, recomputed from sessions
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workspaces (
            workspace_name TEXT PRIMARY KEY,
            workspace_path TEXT NOT NULL DEFAULT '',
            session_count INTEGER NOT NULL,
            total_messages INTEGER NOT NULL,
            total_tokens INTEGER NOT NULL,
            active_days INTEGER NOT NULL,
            avg_messages_per_session REAL NOT NULL,
            first_session INTEGER NOT NULL,
            last_session INTEGER NOT NULL,
            conversation_sessions INTEGER NOT NULL,
            code_edit_sessions INTEGER NOT NULL,
            mixed_sessions INTEGER NOT NULL,
            edit_line_count INTEGER NOT NULL,
            edit_files_count INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS activity_buckets (
            granularity TEXT NOT NULL CHECK (granularity IN ('hour', 'day')),
            bucket_start INTEGER NOT NULL,
            workspace_name TEXT NOT NULL,
            session_count INTEGER NOT NULL,
            message_count INTEGER NOT NULL,
            PRIMARY KEY (granularity, bucket_start, workspace_name)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE VIEW IF NOT EXISTS activity_totals AS
        SELECT granularity, bucket_start,
               SUM(session_count) AS session_count,
               SUM(message_count) AS message_count
        FROM activity_buckets
        GROUP BY granularity, bucket_start
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS backup_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL UNIQUE,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            sessions_seen INTEGER NOT NULL,
            sessions_new INTEGER NOT NULL,
            sessions_updated INTEGER NOT NULL,
            sessions_unchanged INTEGER NOT NULL,
            total_messages INTEGER NOT NULL,
            total_size_bytes INTEGER NOT NULL,
            total_workspaces INTEGER NOT NULL,
            conversation_sessions INTEGER NOT NULL,
            code_edit_sessions INTEGER NOT NULL,
            mixed_sessions INTEGER NOT NULL,
            errors INTEGER NOT NULL,
            error_details TEXT NOT NULL DEFAULT '[]',
            success INTEGER NOT NULL,
            failure_message TEXT
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    // Run history is append-only
    for (name, event) in [
        ("backup_runs_no_update", "UPDATE"),
        ("backup_runs_no_delete", "DELETE"),
    ] {
        sqlx::query(&format!(
            "CREATE TRIGGER IF NOT EXISTS {} BEFORE {} ON backup_runs \
             BEGIN SELECT RAISE(ABORT, 'backup_runs is append-only'); END",
            name, event
        ))
        .execute(&mut *conn)
        .await?;
    }

    // Single-row writer lock, touched first in every run transaction
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS writer_lock (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            run_id TEXT NOT NULL,
            acquired_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    // Indexes
    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_sessions_workspace ON sessions(workspace_name)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_start ON sessions(start_time)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_type ON sessions(session_type)",
        "CREATE INDEX IF NOT EXISTS idx_buckets_workspace ON activity_buckets(workspace_name)",
        "CREATE INDEX IF NOT EXISTS idx_runs_started ON backup_runs(started_at)",
    ] {
        sqlx::query(stmt).execute(&mut *conn).await?;
    }

    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let mut conn = pool.acquire().await?;
    apply(&mut *conn).await?;
    drop(conn);
    pool.close().await;
    Ok(())
}
