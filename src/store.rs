//! Store writer.
//!
//! Every write a run makes goes through one [`SyncTransaction`]: session
//! upserts, the aggregate rebuild for affected workspaces, and the run
//! record. Nothing is visible to readers until [`SyncTransaction::commit`].
//!
//! The transaction takes the store's write lock up front by touching the
//! `writer_lock` row, so a concurrent run fails fast with
//! [`SyncError::StoreLocked`] instead of interleaving with this one.

use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::{BTreeSet, HashMap};

use crate::error::SyncError;
use crate::migrate;
use crate::models::{RunSummary, Session};

/// Bucket granularities kept in `activity_buckets`, with their width in
/// seconds.
const GRANULARITIES: [(&str, i64); 2] = [("hour", 3600), ("day", 86_400)];

/// What the store remembers about a session between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub fingerprint: String,
    pub workspace_name: String,
}

/// Last stored fingerprint and workspace of every session.
pub async fn stored_sessions(
    conn: &mut SqliteConnection,
) -> Result<HashMap<String, StoredSession>, sqlx::Error> {
    let rows: Vec<(String, String, String)> =
        sqlx::query_as("SELECT session_id, fingerprint, workspace_name FROM sessions")
            .fetch_all(&mut *conn)
            .await?;

    Ok(rows
        .into_iter()
        .map(|(session_id, fingerprint, workspace_name)| {
            (
                session_id,
                StoredSession {
                    fingerprint,
                    workspace_name,
                },
            )
        })
        .collect())
}

/// Write a failed run record outside any run transaction.
pub async fn record_failed_run(pool: &SqlitePool, summary: &RunSummary) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    insert_run(&mut *conn, summary).await
}

pub struct SyncTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl SyncTransaction {
    /// Open the run transaction, bring the schema up to date and take the
    /// write lock.
    pub async fn begin(pool: &SqlitePool, run_id: &str, now: i64) -> Result<Self, SyncError> {
        let mut tx = pool.begin().await.map_err(SyncError::from_lock_attempt)?;

        migrate::apply(&mut *tx)
            .await
            .map_err(SyncError::from_lock_attempt)?;

        sqlx::query(
            r#"
            INSERT INTO writer_lock (id, run_id, acquired_at) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                run_id = excluded.run_id,
                acquired_at = excluded.acquired_at
            "#,
        )
        .bind(run_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(SyncError::from_lock_attempt)?;

        Ok(Self { tx })
    }

    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    /// Insert or replace one session and its messages.
    pub async fn upsert_session(
        &mut self,
        session: &Session,
        synced_at: i64,
    ) -> Result<(), sqlx::Error> {
        let edit_file_paths =
            serde_json::to_string(&session.edits.file_paths).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, container_id, workspace_name, workspace_path,
                session_type, message_count, total_tokens, edit_file_paths, edit_line_count,
                edit_files_count, start_time, end_time, title, requester, responder, model_id,
                agent_name, source_path, source_size_bytes, partial, fingerprint, synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                container_id = excluded.container_id,
                workspace_name = excluded.workspace_name,
                workspace_path = excluded.workspace_path,
                session_type = excluded.session_type,
                message_count = excluded.message_count,
                total_tokens = excluded.total_tokens,
                edit_file_paths = excluded.edit_file_paths,
                edit_line_count = excluded.edit_line_count,
                edit_files_count = excluded.edit_files_count,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                title = excluded.title,
                requester = excluded.requester,
                responder = excluded.responder,
                model_id = excluded.model_id,
                agent_name = excluded.agent_name,
                source_path = excluded.source_path,
                source_size_bytes = excluded.source_size_bytes,
                partial = excluded.partial,
                fingerprint = excluded.fingerprint,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.container_id)
        .bind(&session.workspace_name)
        .bind(&session.workspace_path)
        .bind(session.session_type.as_str())
        .bind(session.message_count())
        .bind(session.total_tokens())
        .bind(&edit_file_paths)
        .bind(session.edits.line_count)
        .bind(session.edits.files_count())
        .bind(session.start_time)
        .bind(session.end_time)
        .bind(&session.title)
        .bind(&session.requester)
        .bind(&session.responder)
        .bind(&session.model_id)
        .bind(&session.agent_name)
        .bind(&session.source_path)
        .bind(session.source_size_bytes)
        .bind(session.partial)
        .bind(&session.fingerprint)
        .bind(synced_at)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query("DELETE FROM session_messages WHERE session_id = ?")
            .bind(&session.session_id)
            .execute(&mut *self.tx)
            .await?;

        for message in &session.messages {
            let (edit_path, edit_lines) = match &message.edit {
                Some(edit) => (Some(edit.file_path.as_str()), edit.line_count()),
                None => (None, 0),
            };
            sqlx::query(
                r#"
                INSERT INTO session_messages (session_id, position, role, content, timestamp,
                    model, edit_file_path, edit_line_count)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&session.session_id)
            .bind(message.position as i64)
            .bind(message.role.as_str())
            .bind(&message.text)
            .bind(message.timestamp)
            .bind(&message.model)
            .bind(edit_path)
            .bind(edit_lines)
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(())
    }

    /// Every workspace that has sessions or an aggregate row.
    pub async fn all_workspaces(&mut self) -> Result<BTreeSet<String>, sqlx::Error> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT workspace_name FROM sessions UNION SELECT workspace_name FROM workspaces",
        )
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(names.into_iter().collect())
    }

    /// Recompute aggregates and activity buckets for the given workspaces
    /// from the sessions table. A workspace with no sessions left loses its
    /// aggregate rows.
    pub async fn rebuild_aggregates(
        &mut self,
        workspaces: &BTreeSet<String>,
        now: i64,
    ) -> Result<(), sqlx::Error> {
        for workspace in workspaces {
            self.rebuild_workspace(workspace, now).await?;
            for (granularity, width) in GRANULARITIES {
                self.rebuild_buckets(workspace, granularity, width).await?;
            }
        }
        Ok(())
    }

    async fn rebuild_workspace(&mut self, workspace: &str, now: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM workspaces WHERE workspace_name = ?")
            .bind(workspace)
            .execute(&mut *self.tx)
            .await?;

        // Days are UTC calendar days. Edit lines saturate instead of
        // overflowing the integer SUM.
        sqlx::query(
            r#"
            INSERT INTO workspaces (workspace_name, workspace_path, session_count, total_messages,
                total_tokens, active_days, avg_messages_per_session, first_session, last_session,
                conversation_sessions, code_edit_sessions, mixed_sessions, edit_line_count,
                edit_files_count, updated_at)
            SELECT
                ?1,
                (SELECT workspace_path FROM sessions WHERE workspace_name = ?1
                 ORDER BY end_time DESC, session_id LIMIT 1),
                COUNT(*),
                SUM(message_count),
                SUM(total_tokens),
                COUNT(DISTINCT start_time / 86400),
                CAST(SUM(message_count) AS REAL) / COUNT(*),
                MIN(start_time),
                MAX(end_time),
                SUM(session_type = 'conversation'),
                SUM(session_type = 'code_edit'),
                SUM(session_type = 'mixed'),
                CAST(MIN(TOTAL(edit_line_count), 9223372036854775807) AS INTEGER),
                SUM(edit_files_count),
                ?2
            FROM sessions
            WHERE workspace_name = ?1
            GROUP BY workspace_name
            "#,
        )
        .bind(workspace)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn rebuild_buckets(
        &mut self,
        workspace: &str,
        granularity: &str,
        width: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM activity_buckets WHERE workspace_name = ? AND granularity = ?")
            .bind(workspace)
            .bind(granularity)
            .execute(&mut *self.tx)
            .await?;

        // Sessions count toward their start bucket; messages toward their own
        // timestamp, or the session start when they carry none.
        sqlx::query(
            r#"
            INSERT INTO activity_buckets (granularity, bucket_start, workspace_name,
                session_count, message_count)
            SELECT ?2, bucket_start, ?1, SUM(sessions), SUM(messages)
            FROM (
                SELECT (start_time / ?3) * ?3 AS bucket_start, 1 AS sessions, 0 AS messages
                FROM sessions
                WHERE workspace_name = ?1
                UNION ALL
                SELECT (COALESCE(m.timestamp, s.start_time) / ?3) * ?3, 0, 1
                FROM session_messages m
                JOIN sessions s ON s.session_id = m.session_id
                WHERE s.workspace_name = ?1
            )
            GROUP BY bucket_start
            "#,
        )
        .bind(workspace)
        .bind(granularity)
        .bind(width)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    pub async fn record_run(&mut self, summary: &RunSummary) -> Result<(), sqlx::Error> {
        insert_run(&mut *self.tx, summary).await
    }

    /// Release the lock row and commit. The row only ever exists inside an
    /// open run transaction, so committed state carries no trace of it.
    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM writer_lock WHERE id = 1")
            .execute(&mut *self.tx)
            .await?;
        self.tx.commit().await
    }

    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }
}

async fn insert_run(conn: &mut SqliteConnection, summary: &RunSummary) -> Result<(), sqlx::Error> {
    let error_details =
        serde_json::to_string(&summary.issues).unwrap_or_else(|_| "[]".to_string());

    sqlx::query(
        r#"
        INSERT INTO backup_runs (run_id, started_at, finished_at, duration_ms, sessions_seen,
            sessions_new, sessions_updated, sessions_unchanged, total_messages, total_size_bytes,
            total_workspaces, conversation_sessions, code_edit_sessions, mixed_sessions, errors,
            error_details, success, failure_message)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&summary.run_id)
    .bind(summary.started_at)
    .bind(summary.finished_at)
    .bind(summary.duration_ms)
    .bind(summary.sessions_seen)
    .bind(summary.sessions_new)
    .bind(summary.sessions_updated)
    .bind(summary.sessions_unchanged)
    .bind(summary.total_messages)
    .bind(summary.total_size_bytes)
    .bind(summary.total_workspaces)
    .bind(summary.conversation_sessions)
    .bind(summary.code_edit_sessions)
    .bind(summary.mixed_sessions)
    .bind(summary.errors())
    .bind(&error_details)
    .bind(summary.success)
    .bind(&summary.failure_message)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::db;
    use crate::models::{EditMetadata, EditOperation, LineRange, Message, Role, SessionType};
    use tempfile::TempDir;

    const DAY: i64 = 86_400;

    async fn pool(tmp: &TempDir) -> SqlitePool {
        let toml = format!("[db]\npath = \"{}\"\n", tmp.path().join("t.db").display());
        let config = parse_config(&toml).unwrap();
        db::connect(&config).await.unwrap()
    }

    fn message(position: usize, text: &str, ts: Option<i64>) -> Message {
        Message {
            position,
            role: Role::User,
            text: text.to_string(),
            edit: None,
            timestamp: ts,
            model: None,
        }
    }

    fn session(id: &str, workspace: &str, start: i64, messages: Vec<Message>) -> Session {
        Session {
            session_id: id.to_string(),
            container_id: format!("c-{}", workspace),
            workspace_name: workspace.to_string(),
            workspace_path: format!("/code/{}", workspace),
            messages,
            session_type: SessionType::Conversation,
            edits: EditMetadata::default(),
            start_time: start,
            end_time: start + 60,
            title: None,
            requester: None,
            responder: None,
            model_id: None,
            agent_name: None,
            source_path: format!("/s/{}.json", id),
            source_size_bytes: 10,
            partial: false,
            fingerprint: "f".repeat(64),
        }
    }

    fn all(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn upsert_replaces_messages() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;

        let mut tx = SyncTransaction::begin(&pool, "r1", 0).await.unwrap();
        let mut s = session("s1", "w", DAY, vec![message(0, "a", None), message(1, "b", None)]);
        tx.upsert_session(&s, 1).await.unwrap();
        s.messages.truncate(1);
        tx.upsert_session(&s, 2).await.unwrap();
        tx.commit().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM session_messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
        let (mc, synced): (i64, i64) =
            sqlx::query_as("SELECT message_count, synced_at FROM sessions WHERE session_id = 's1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!((mc, synced), (1, 2));
    }

    #[tokio::test]
    async fn aggregates_match_sessions() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;

        let mut tx = SyncTransaction::begin(&pool, "r1", 0).await.unwrap();
        let a = session("a", "w", DAY + 10, vec![message(0, "x", None), message(1, "y", None)]);
        let b = session("b", "w", DAY + 20, vec![message(0, "z", Some(3 * DAY))]);
        let mut c = session("c", "w", 5 * DAY, vec![]);
        c.session_type = SessionType::Mixed;
        c.messages.push(Message {
            position: 0,
            role: Role::Assistant,
            text: String::new(),
            edit: Some(EditOperation {
                file_path: "main.go".into(),
                ranges: vec![LineRange {
                    start_line: 10,
                    end_line: 12,
                }],
            }),
            timestamp: None,
            model: None,
        });
        c.edits.file_paths.insert("main.go".into());
        c.edits.line_count = 3;
        for s in [&a, &b, &c] {
            tx.upsert_session(s, 0).await.unwrap();
        }
        tx.rebuild_aggregates(&all(&["w"]), 0).await.unwrap();
        tx.commit().await.unwrap();

        let row: (i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            "SELECT session_count, total_messages, active_days, first_session, \
             mixed_sessions, edit_line_count, edit_files_count FROM workspaces",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(row, (3, 4, 2, DAY + 10, 1, 3, 1));

        // Day buckets: two sessions on day 1, one on day 5
        let days: Vec<(i64, i64, i64)> = sqlx::query_as(
            "SELECT bucket_start, session_count, message_count FROM activity_buckets \
             WHERE granularity = 'day' ORDER BY bucket_start",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(days, vec![(DAY, 2, 2), (3 * DAY, 0, 1), (5 * DAY, 1, 1)]);

        let totals: i64 = sqlx::query_scalar(
            "SELECT SUM(message_count) FROM activity_totals WHERE granularity = 'hour'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(totals, 4);
    }

    #[tokio::test]
    async fn emptied_workspace_loses_aggregates() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;

        let mut tx = SyncTransaction::begin(&pool, "r1", 0).await.unwrap();
        tx.upsert_session(&session("s", "old", DAY, vec![message(0, "x", None)]), 0)
            .await
            .unwrap();
        tx.rebuild_aggregates(&all(&["old"]), 0).await.unwrap();
        tx.commit().await.unwrap();

        // The session moves to another workspace
        let mut tx = SyncTransaction::begin(&pool, "r2", 0).await.unwrap();
        tx.upsert_session(&session("s", "new", DAY, vec![message(0, "x", None)]), 0)
            .await
            .unwrap();
        tx.rebuild_aggregates(&all(&["old", "new"]), 0).await.unwrap();
        tx.commit().await.unwrap();

        let names: Vec<String> = sqlx::query_scalar("SELECT workspace_name FROM workspaces")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(names, vec!["new".to_string()]);
        let stale: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM activity_buckets WHERE workspace_name = 'old'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(stale, 0);
    }

    #[tokio::test]
    async fn rollback_discards_everything() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;

        let mut tx = SyncTransaction::begin(&pool, "r1", 0).await.unwrap();
        tx.upsert_session(&session("s", "w", DAY, vec![]), 0).await.unwrap();
        tx.rollback().await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        migrate::apply(&mut *conn).await.unwrap();
        assert!(stored_sessions(&mut *conn).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_history_is_append_only() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;

        let mut tx = SyncTransaction::begin(&pool, "r1", 0).await.unwrap();
        let summary = RunSummary {
            run_id: "r1".into(),
            success: true,
            ..RunSummary::default()
        };
        tx.record_run(&summary).await.unwrap();
        tx.commit().await.unwrap();

        assert!(sqlx::query("UPDATE backup_runs SET success = 0")
            .execute(&pool)
            .await
            .is_err());
        assert!(sqlx::query("DELETE FROM backup_runs")
            .execute(&pool)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn edit_line_totals_saturate() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;

        let mut tx = SyncTransaction::begin(&pool, "r1", 0).await.unwrap();
        for id in ["a", "b"] {
            let mut s = session(id, "w", DAY, vec![message(0, "x", None)]);
            s.edits.file_paths.insert("big.rs".into());
            s.edits.line_count = i64::MAX;
            tx.upsert_session(&s, 0).await.unwrap();
        }
        tx.rebuild_aggregates(&all(&["w"]), 0).await.unwrap();
        tx.commit().await.unwrap();

        let lines: i64 = sqlx::query_scalar("SELECT edit_line_count FROM workspaces")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(lines, i64::MAX);
    }

    #[tokio::test]
    async fn committed_store_holds_no_lock_row() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;

        for run in ["r1", "r2"] {
            let tx = SyncTransaction::begin(&pool, run, 0).await.unwrap();
            tx.commit().await.unwrap();
            let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM writer_lock")
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_eq!(rows, 0);
        }
    }

    #[tokio::test]
    async fn second_writer_is_locked_out() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(&tmp).await;

        let first = SyncTransaction::begin(&pool, "r1", 0).await.unwrap();
        let second = SyncTransaction::begin(&pool, "r2", 0).await;
        assert!(matches!(second, Err(SyncError::StoreLocked(_))));
        first.rollback().await.unwrap();
    }
}
