//! Core data models used throughout the harvester.
//!
//! These types represent the raw payloads, normalized sessions and run
//! summaries that flow through the backup pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::error::SyncIssue;

/// Approximate chars-per-token ratio used for token estimates.
const CHARS_PER_TOKEN: usize = 4;

/// One discoverable workspace storage container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceHandle {
    /// Container directory name (an opaque hash in VS Code's layout).
    pub container_id: String,
    pub container_dir: PathBuf,
    pub workspace_name: String,
    pub workspace_path: String,
}

/// Opaque session blob read from a container.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub container_id: String,
    pub workspace_name: String,
    pub workspace_path: String,
    pub source_path: String,
    pub bytes: Vec<u8>,
    /// Modification time the container reports for the blob.
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.to_ascii_lowercase().as_str() {
            "user" | "human" | "requester" => Some(Role::User),
            "assistant" | "bot" | "copilot" | "responder" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// Inclusive line range replaced by an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    pub start_line: i64,
    pub end_line: i64,
}

impl LineRange {
    /// Saturates at `i64::MAX` for absurd ranges.
    pub fn line_count(&self) -> i64 {
        let span = self.end_line.abs_diff(self.start_line).saturating_add(1);
        i64::try_from(span).unwrap_or(i64::MAX)
    }
}

/// A structured file-edit operation produced by the assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOperation {
    pub file_path: String,
    pub ranges: Vec<LineRange>,
}

impl EditOperation {
    pub fn line_count(&self) -> i64 {
        self.ranges
            .iter()
            .map(LineRange::line_count)
            .fold(0, i64::saturating_add)
    }
}

/// One response unit or request in a session, in original sequence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub position: usize,
    pub role: Role,
    pub text: String,
    pub edit: Option<EditOperation>,
    /// Unix seconds.
    pub timestamp: Option<i64>,
    pub model: Option<String>,
}

impl Message {
    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }

    pub fn estimated_tokens(&self) -> i64 {
        self.text.chars().count().div_ceil(CHARS_PER_TOKEN) as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    #[default]
    Conversation,
    CodeEdit,
    Mixed,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Conversation => "conversation",
            SessionType::CodeEdit => "code_edit",
            SessionType::Mixed => "mixed",
        }
    }

    pub fn parse(s: &str) -> Option<SessionType> {
        match s {
            "conversation" => Some(SessionType::Conversation),
            "code_edit" => Some(SessionType::CodeEdit),
            "mixed" => Some(SessionType::Mixed),
            _ => None,
        }
    }
}

/// Edit totals accumulated by the classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditMetadata {
    pub file_paths: BTreeSet<String>,
    pub line_count: i64,
}

impl EditMetadata {
    /// Distinct files, not edit operations.
    pub fn files_count(&self) -> i64 {
        self.file_paths.len() as i64
    }
}

/// Canonical session record.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub container_id: String,
    pub workspace_name: String,
    pub workspace_path: String,
    pub messages: Vec<Message>,
    pub session_type: SessionType,
    pub edits: EditMetadata,
    /// Unix seconds.
    pub start_time: i64,
    pub end_time: i64,
    pub title: Option<String>,
    pub requester: Option<String>,
    pub responder: Option<String>,
    pub model_id: Option<String>,
    pub agent_name: Option<String>,
    pub source_path: String,
    pub source_size_bytes: i64,
    /// Set when an unknown payload shape was only partially extracted.
    pub partial: bool,
    /// Empty until the change detector stamps it.
    pub fingerprint: String,
}

impl Session {
    pub fn message_count(&self) -> i64 {
        self.messages.len() as i64
    }

    pub fn total_tokens(&self) -> i64 {
        self.messages.iter().map(Message::estimated_tokens).sum()
    }

    /// Messages carrying human-readable text (excludes pure edit units).
    pub fn text_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.has_text())
    }
}

/// Change detector verdict for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    New,
    Changed,
    Unchanged,
}

/// Summary of one backup run, persisted as an append-only `backup_runs` row.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub duration_ms: i64,
    pub sessions_seen: i64,
    pub sessions_new: i64,
    pub sessions_updated: i64,
    pub sessions_unchanged: i64,
    pub total_messages: i64,
    pub total_size_bytes: i64,
    pub total_workspaces: i64,
    pub conversation_sessions: i64,
    pub code_edit_sessions: i64,
    pub mixed_sessions: i64,
    pub issues: Vec<SyncIssue>,
    pub success: bool,
    pub failure_message: Option<String>,
}

impl RunSummary {
    pub fn errors(&self) -> i64 {
        self.issues.len() as i64
    }

    pub fn count_type(&mut self, session_type: SessionType) {
        match session_type {
            SessionType::Conversation => self.conversation_sessions += 1,
            SessionType::CodeEdit => self.code_edit_sessions += 1,
            SessionType::Mixed => self.mixed_sessions += 1,
        }
    }

    /// A failed run keeps its identity, timing and issues but reports no
    /// success counts.
    pub fn into_failed(self, message: String, finished_at: i64, duration_ms: i64) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at,
            duration_ms,
            issues: self.issues,
            success: false,
            failure_message: Some(message),
            ..RunSummary::default()
        }
    }
}
