//! Backup run coordination.
//!
//! A run moves through `Init → Discover → Extract → ClassifyAndDiff →
//! Persist → Done`, or ends in `Failed`:
//!
//! - **Discover** resolves the storage root and lists workspace containers.
//!   A missing root is a configuration error raised before the store is
//!   touched.
//! - The store's write lock is taken next, so a concurrent run fails fast.
//! - **Extract** reads, normalizes, classifies and fingerprints containers
//!   in parallel on blocking threads, bounded by `sync.parallelism`.
//!   Results are re-ordered by container id before anything else happens,
//!   so the outcome never depends on completion order.
//! - **ClassifyAndDiff** compares fingerprints against the store.
//! - **Persist** upserts new and changed sessions, rebuilds aggregates for
//!   affected workspaces and records the run, all in one transaction.
//!
//! Per-item problems become [`SyncIssue`]s on the summary. Fatal errors
//! roll the transaction back and leave a failed run record behind.

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::classify;
use crate::config::Config;
use crate::db;
use crate::error::{IssueKind, SyncError, SyncIssue};
use crate::fingerprint;
use crate::models::{ChangeStatus, RunSummary, Session, SourceHandle};
use crate::normalize::normalize;
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::source::{SessionSource, WorkspaceStorage};
use crate::store::{self, StoredSession, SyncTransaction};

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Overrides `source.root` from the config.
    pub root: Option<PathBuf>,
    /// Rewrite every seen session and rebuild all aggregates.
    pub full: bool,
    /// Report what would change without writing.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Discover,
    Extract,
    ClassifyAndDiff,
    Persist,
    Done,
    Failed,
}

/// Everything one container produced.
#[derive(Debug, Default)]
struct ContainerBatch {
    container_id: String,
    payloads: usize,
    sessions: Vec<Session>,
    issues: Vec<SyncIssue>,
}

/// Sessions to write, plus the workspaces whose aggregates they touch.
#[derive(Debug, Default)]
struct Plan {
    writes: Vec<Session>,
    affected: BTreeSet<String>,
}

struct Run {
    state: RunState,
    clock: Instant,
    summary: RunSummary,
}

impl Run {
    fn new() -> Self {
        Self {
            state: RunState::Init,
            clock: Instant::now(),
            summary: RunSummary {
                run_id: Uuid::new_v4().to_string(),
                started_at: Utc::now().timestamp(),
                ..RunSummary::default()
            },
        }
    }

    fn transition(&mut self, next: RunState) {
        tracing::debug!(run_id = %self.summary.run_id, from = ?self.state, to = ?next, "run state");
        self.state = next;
    }

    fn elapsed_ms(&self) -> i64 {
        self.clock.elapsed().as_millis() as i64
    }

    fn issue(&mut self, issue: SyncIssue) {
        tracing::warn!(run_id = %self.summary.run_id, "{}", issue);
        self.summary.issues.push(issue);
    }
}

/// Run one backup against the configured workspace storage.
pub async fn run_sync(
    config: &Config,
    options: &SyncOptions,
    progress: &dyn SyncProgressReporter,
) -> Result<RunSummary, SyncError> {
    let mut config = config.clone();
    if let Some(root) = &options.root {
        config.source.root = Some(root.clone());
    }

    let root = config.resolve_root()?;
    let source = WorkspaceStorage::new(root, &config.source)
        .map_err(|e| SyncError::Configuration(e.to_string()))?;

    run_with_source(&config, Arc::new(source), options, progress).await
}

/// Run one backup against any session source.
pub async fn run_with_source(
    config: &Config,
    source: Arc<dyn SessionSource>,
    options: &SyncOptions,
    progress: &dyn SyncProgressReporter,
) -> Result<RunSummary, SyncError> {
    let mut run = Run::new();
    tracing::info!(
        run_id = %run.summary.run_id,
        source = %source.location(),
        full = options.full,
        dry_run = options.dry_run,
        "backup run starting"
    );

    run.transition(RunState::Discover);
    progress.report(SyncProgressEvent::Discovering {
        root: source.location(),
    });
    let handles = {
        let source = source.clone();
        tokio::task::spawn_blocking(move || source.list_sources())
            .await
            .map_err(|e| SyncError::Configuration(format!("discovery failed: {}", e)))??
    };
    tracing::info!(containers = handles.len(), "discovered workspace containers");

    let pool = db::connect(config).await?;

    if options.dry_run {
        let result = dry_run(&mut run, &pool, source, handles, config, options, progress).await;
        pool.close().await;
        return result;
    }

    let mut tx =
        SyncTransaction::begin(&pool, &run.summary.run_id, run.summary.started_at).await?;

    run.transition(RunState::Extract);
    let batches = extract_all(source, handles, config.sync.parallelism, progress).await;

    run.transition(RunState::ClassifyAndDiff);
    let stored = match store::stored_sessions(tx.conn()).await {
        Ok(stored) => stored,
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::error!(error = %rollback, "rollback failed");
            }
            return Err(fail(run, &pool, e).await);
        }
    };
    let plan = diff(&mut run, batches, &stored, options.full);

    run.transition(RunState::Persist);
    progress.report(SyncProgressEvent::Persisting {
        sessions: plan.writes.len() as u64,
    });

    let written = match persist(&mut tx, &mut run, plan, options.full).await {
        Ok(()) => tx.commit().await,
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::error!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    };
    if let Err(e) = written {
        return Err(fail(run, &pool, e).await);
    }

    run.transition(RunState::Done);
    log_summary(&run.summary);
    pool.close().await;
    Ok(run.summary)
}

async fn dry_run(
    run: &mut Run,
    pool: &SqlitePool,
    source: Arc<dyn SessionSource>,
    handles: Vec<SourceHandle>,
    config: &Config,
    options: &SyncOptions,
    progress: &dyn SyncProgressReporter,
) -> Result<RunSummary, SyncError> {
    run.transition(RunState::Extract);
    let batches = extract_all(source, handles, config.sync.parallelism, progress).await;

    run.transition(RunState::ClassifyAndDiff);
    let mut conn = pool.acquire().await?;
    let has_schema: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='sessions'",
    )
    .fetch_one(&mut *conn)
    .await?;
    let stored = if has_schema {
        store::stored_sessions(&mut *conn).await?
    } else {
        HashMap::new()
    };
    let plan = diff(run, batches, &stored, options.full);
    tracing::info!(
        writes = plan.writes.len(),
        workspaces = plan.affected.len(),
        "dry run: nothing written"
    );

    run.summary.finished_at = Utc::now().timestamp();
    run.summary.duration_ms = run.elapsed_ms();
    run.summary.success = true;
    run.transition(RunState::Done);
    Ok(run.summary.clone())
}

/// Read every container in parallel and return the batches in container
/// order.
async fn extract_all(
    source: Arc<dyn SessionSource>,
    handles: Vec<SourceHandle>,
    parallelism: usize,
    progress: &dyn SyncProgressReporter,
) -> Vec<ContainerBatch> {
    let total = handles.len() as u64;
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut set = JoinSet::new();

    for handle in handles {
        let source = source.clone();
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let container_id = handle.container_id.clone();
            let workspace = handle.workspace_name.clone();
            tokio::task::spawn_blocking(move || extract_container(source.as_ref(), &handle))
                .await
                .unwrap_or_else(|e| ContainerBatch {
                    container_id,
                    issues: vec![SyncIssue::source_read(
                        workspace,
                        format!("extraction task failed: {}", e),
                    )],
                    ..ContainerBatch::default()
                })
        });
    }

    let mut batches = Vec::with_capacity(total as usize);
    let mut n = 0u64;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(batch) => batches.push(batch),
            Err(e) => batches.push(ContainerBatch {
                issues: vec![SyncIssue {
                    kind: IssueKind::SourceRead,
                    workspace: None,
                    detail: format!("extraction task failed: {}", e),
                }],
                ..ContainerBatch::default()
            }),
        }
        n += 1;
        progress.report(SyncProgressEvent::Extracting { n, total });
    }

    batches.sort_by(|a, b| a.container_id.cmp(&b.container_id));
    batches
}

/// Read, normalize, classify and fingerprint one container. Blocking.
fn extract_container(source: &dyn SessionSource, handle: &SourceHandle) -> ContainerBatch {
    let mut batch = ContainerBatch {
        container_id: handle.container_id.clone(),
        ..ContainerBatch::default()
    };

    for payload in source.read_raw_sessions(handle) {
        let raw = match payload {
            Ok(raw) => raw,
            Err(issue) => {
                batch.issues.push(issue);
                continue;
            }
        };
        batch.payloads += 1;

        match normalize(&raw) {
            Ok(mut session) => {
                if session.partial {
                    tracing::debug!(path = %raw.source_path, "unknown shape, extracted best-effort");
                }
                classify::apply(&mut session);
                fingerprint::apply(&mut session);
                batch.sessions.push(session);
            }
            Err(e) => batch.issues.push(SyncIssue::normalization(
                &handle.workspace_name,
                format!("{}: {}", raw.source_path, e),
            )),
        }
    }

    batch
}

/// Decide the status of every extracted session and fill in the summary.
fn diff(
    run: &mut Run,
    batches: Vec<ContainerBatch>,
    stored: &HashMap<String, StoredSession>,
    full: bool,
) -> Plan {
    let mut plan = Plan::default();
    let mut seen: HashSet<String> = HashSet::new();

    for batch in batches {
        if batch.payloads > 0 {
            run.summary.total_workspaces += 1;
        }
        for issue in batch.issues {
            run.issue(issue);
        }

        for session in batch.sessions {
            // First container in sorted order wins
            if !seen.insert(session.session_id.clone()) {
                run.issue(SyncIssue::duplicate(
                    &session.workspace_name,
                    format!(
                        "session {} also found in container {}; keeping the first copy",
                        session.session_id, batch.container_id
                    ),
                ));
                continue;
            }

            let previous = stored.get(&session.session_id);
            let decision =
                fingerprint::decide(&session, previous.map(|p| p.fingerprint.as_str()));
            if let Some(detail) = decision.inconsistency {
                run.issue(SyncIssue::inconsistency(&session.workspace_name, detail));
            }

            let moved = previous.is_some_and(|p| p.workspace_name != session.workspace_name);
            let status = match decision.status {
                // Same content under a different workspace still needs rewriting
                ChangeStatus::Unchanged if moved => ChangeStatus::Changed,
                status => status,
            };

            let summary = &mut run.summary;
            summary.sessions_seen += 1;
            summary.total_messages += session.message_count();
            summary.total_size_bytes += session.source_size_bytes;
            summary.count_type(session.session_type);
            match status {
                ChangeStatus::New => summary.sessions_new += 1,
                ChangeStatus::Changed => summary.sessions_updated += 1,
                ChangeStatus::Unchanged => summary.sessions_unchanged += 1,
            }

            if full || status != ChangeStatus::Unchanged {
                plan.affected.insert(session.workspace_name.clone());
                if let Some(previous) = previous.filter(|_| moved) {
                    plan.affected.insert(previous.workspace_name.clone());
                }
                plan.writes.push(session);
            }
        }
    }

    plan
}

async fn persist(
    tx: &mut SyncTransaction,
    run: &mut Run,
    mut plan: Plan,
    full: bool,
) -> Result<(), sqlx::Error> {
    let now = Utc::now().timestamp();
    for session in &plan.writes {
        tx.upsert_session(session, now).await?;
    }

    if full {
        plan.affected.extend(tx.all_workspaces().await?);
    }
    tx.rebuild_aggregates(&plan.affected, now).await?;
    tracing::info!(
        sessions = plan.writes.len(),
        workspaces = plan.affected.len(),
        "persisted changes"
    );

    run.summary.finished_at = Utc::now().timestamp();
    run.summary.duration_ms = run.elapsed_ms();
    run.summary.success = true;
    tx.record_run(&run.summary).await
}

/// Record a failed run outside the rolled-back transaction.
async fn fail(mut run: Run, pool: &SqlitePool, err: sqlx::Error) -> SyncError {
    run.transition(RunState::Failed);
    let elapsed = run.elapsed_ms();
    let failed = run
        .summary
        .into_failed(err.to_string(), Utc::now().timestamp(), elapsed);
    tracing::error!(run_id = %failed.run_id, error = %err, "backup run failed, rolled back");

    if let Err(e) = store::record_failed_run(pool, &failed).await {
        tracing::error!(error = %e, "could not record failed run");
    }
    pool.close().await;
    SyncError::StoreTransaction(err)
}

fn log_summary(summary: &RunSummary) {
    tracing::info!(
        run_id = %summary.run_id,
        seen = summary.sessions_seen,
        new = summary.sessions_new,
        updated = summary.sessions_updated,
        unchanged = summary.sessions_unchanged,
        errors = summary.errors(),
        duration_ms = summary.duration_ms,
        "backup run complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawPayload;
    use crate::progress::NoProgress;
    use crate::source::PayloadIter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory source whose containers take a configurable time to read.
    struct FakeSource {
        containers: Vec<(String, Vec<String>, u64)>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeSource {
        fn new(containers: Vec<(&str, Vec<String>, u64)>) -> Self {
            Self {
                containers: containers
                    .into_iter()
                    .map(|(id, payloads, delay)| (id.to_string(), payloads, delay))
                    .collect(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl SessionSource for FakeSource {
        fn location(&self) -> String {
            "memory".into()
        }

        fn list_sources(&self) -> Result<Vec<SourceHandle>, SyncError> {
            Ok(self
                .containers
                .iter()
                .map(|(id, _, _)| SourceHandle {
                    container_id: id.clone(),
                    container_dir: PathBuf::from(id),
                    workspace_name: format!("ws-{}", id),
                    workspace_path: String::new(),
                })
                .collect())
        }

        fn read_raw_sessions<'a>(&'a self, handle: &'a SourceHandle) -> PayloadIter<'a> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let (_, payloads, delay) = self
                .containers
                .iter()
                .find(|(id, _, _)| *id == handle.container_id)
                .unwrap();
            std::thread::sleep(Duration::from_millis(*delay));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            Box::new(payloads.iter().enumerate().map(move |(i, json)| {
                if json == UNREADABLE {
                    return Err(SyncIssue::source_read(
                        handle.workspace_name.clone(),
                        "permission denied",
                    ));
                }
                Ok(RawPayload {
                    container_id: handle.container_id.clone(),
                    workspace_name: handle.workspace_name.clone(),
                    workspace_path: String::new(),
                    source_path: format!("{}/{}.json", handle.container_id, i),
                    bytes: json.as_bytes().to_vec(),
                    modified: Utc::now(),
                })
            }))
        }
    }

    /// Payload marker the fake source turns into a read failure.
    const UNREADABLE: &str = "<unreadable>";

    fn chat(id: &str, text: &str) -> String {
        format!(
            r#"{{"sessionId":"{}","requests":[{{"message":{{"text":"{}"}},"response":[{{"value":"ok"}}]}}]}}"#,
            id, text
        )
    }

    #[tokio::test]
    async fn extraction_is_bounded_and_ordered() {
        let source = Arc::new(FakeSource::new(vec![
            ("c", vec![chat("s3", "c")], 30),
            ("a", vec![chat("s1", "a")], 60),
            ("b", vec![chat("s2", "b")], 10),
            ("d", vec![chat("s4", "d")], 5),
        ]));
        let handles = source.list_sources().unwrap();
        let batches = extract_all(source.clone(), handles, 2, &NoProgress).await;

        let order: Vec<&str> = batches.iter().map(|b| b.container_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
        assert!(source.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn duplicates_keep_first_container() {
        let source = Arc::new(FakeSource::new(vec![
            ("b", vec![chat("dup", "from b")], 0),
            ("a", vec![chat("dup", "from a")], 20),
        ]));
        let handles = source.list_sources().unwrap();
        let batches = extract_all(source, handles, 4, &NoProgress).await;

        let mut run = Run::new();
        let plan = diff(&mut run, batches, &HashMap::new(), false);
        assert_eq!(plan.writes.len(), 1);
        assert_eq!(plan.writes[0].container_id, "a");
        assert_eq!(run.summary.sessions_seen, 1);
        assert_eq!(run.summary.issues[0].kind, IssueKind::DuplicateSession);
    }

    #[tokio::test]
    async fn moved_session_touches_both_workspaces() {
        let source = Arc::new(FakeSource::new(vec![("a", vec![chat("s", "x")], 0)]));
        let handles = source.list_sources().unwrap();
        let batches = extract_all(source, handles, 1, &NoProgress).await;
        let fp = batches[0].sessions[0].fingerprint.clone();

        let mut stored = HashMap::new();
        stored.insert(
            "s".to_string(),
            StoredSession {
                fingerprint: fp,
                workspace_name: "elsewhere".into(),
            },
        );
        let mut run = Run::new();
        let plan = diff(&mut run, batches, &stored, false);
        assert_eq!(run.summary.sessions_updated, 1);
        assert!(plan.affected.contains("elsewhere"));
        assert!(plan.affected.contains("ws-a"));
    }

    #[tokio::test]
    async fn unreadable_container_does_not_abort_run() {
        let tmp = tempfile::TempDir::new().unwrap();
        let toml = format!("[db]\npath = \"{}\"\n", tmp.path().join("s.db").display());
        let config = crate::config::parse_config(&toml).unwrap();
        let source = Arc::new(FakeSource::new(vec![
            ("a", vec![UNREADABLE.to_string()], 0),
            ("b", vec![chat("s1", "one"), chat("s2", "two")], 0),
        ]));

        let summary = run_with_source(&config, source, &SyncOptions::default(), &NoProgress)
            .await
            .unwrap();
        assert!(summary.success);
        assert_eq!(summary.sessions_new, 2);
        assert_eq!(summary.issues.len(), 1);
        assert_eq!(summary.issues[0].kind, IssueKind::SourceRead);
        assert_eq!(summary.issues[0].workspace.as_deref(), Some("ws-a"));
        // The failed container yielded no payloads
        assert_eq!(summary.total_workspaces, 1);

        let pool = db::connect(&config).await.unwrap();
        let stored: Vec<String> =
            sqlx::query_scalar("SELECT workspace_name FROM sessions ORDER BY session_id")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(stored, vec!["ws-b".to_string(), "ws-b".to_string()]);
        let (errors, success): (i64, bool) =
            sqlx::query_as("SELECT errors, success FROM backup_runs")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!((errors, success), (1, true));
    }

    #[test]
    fn unreadable_payloads_become_issues() {
        let source = FakeSource::new(vec![("a", vec!["".into(), "42".into(), chat("s", "x")], 0)]);
        let handles = source.list_sources().unwrap();
        let batch = extract_container(&source, &handles[0]);
        assert_eq!(batch.payloads, 3);
        assert_eq!(batch.sessions.len(), 1);
        assert_eq!(batch.issues.len(), 2);
        assert!(batch
            .issues
            .iter()
            .all(|i| i.kind == IssueKind::Normalization));
    }
}
