//! Session normalizer.
//!
//! Maps raw session payloads onto the canonical [`Session`] shape. Two
//! known layouts are recognized by shape detection:
//!
//! | Shape | Detected by | Example |
//! |-------|-------------|---------|
//! | structured turns | object with a `requests` array | `{"requests":[{"message":{"text":"hi"},"response":[...]}]}` |
//! | legacy messages | top-level array, or object with a `messages` array | `[{"role":"user","content":"hi"}]` |
//!
//! Anything else that is still a JSON object degrades to a best-effort scan
//! of its arrays for message-like entries and is flagged `partial`.
//!
//! Message order is the order in the source, never timestamp order.
//! Classification and fingerprinting happen later; the returned session
//! carries default values for those fields.

use serde_json::{Map, Value};
use std::path::Path;

use crate::error::NormalizationError;
use crate::models::{EditOperation, LineRange, Message, RawPayload, Role, Session, SessionType};

/// Longest derived title, in characters.
const TITLE_MAX_CHARS: usize = 120;

/// Epoch values above this are milliseconds.
const MILLIS_THRESHOLD: f64 = 1e12;

/// Parse a raw payload into a session.
pub fn normalize(raw: &RawPayload) -> Result<Session, NormalizationError> {
    let text = String::from_utf8_lossy(&raw.bytes);
    let text = text.trim_start_matches('\u{feff}').trim();
    if text.is_empty() {
        return Err(NormalizationError::Empty);
    }

    let value: Value =
        serde_json::from_str(text).map_err(|e| NormalizationError::InvalidJson(e.to_string()))?;

    let mut extraction = Extraction::default();
    match PARSERS.iter().find(|p| p.matches(&value)) {
        Some(parser) => parser.parse(&value, &mut extraction),
        // Arrays are claimed by the legacy parser, so only objects and
        // scalars reach this arm.
        None => match value.as_object() {
            Some(obj) => {
                extraction.partial = true;
                best_effort(obj, &mut extraction);
            }
            None => return Err(NormalizationError::UnsupportedShape("scalar JSON value")),
        },
    }

    let header = value.as_object();
    Ok(extraction.into_session(raw, header))
}

/// One raw layout the normalizer understands.
trait ShapeParser: Sync {
    fn matches(&self, value: &Value) -> bool;
    fn parse(&self, value: &Value, out: &mut Extraction);
}

static PARSERS: &[&dyn ShapeParser] = &[&StructuredTurns, &LegacyMessages];

/// Accumulates messages and header fields while a parser walks a payload.
#[derive(Default)]
struct Extraction {
    messages: Vec<Message>,
    model_id: Option<String>,
    agent_name: Option<String>,
    partial: bool,
}

impl Extraction {
    fn push(
        &mut self,
        role: Role,
        text: String,
        edit: Option<EditOperation>,
        timestamp: Option<i64>,
        model: Option<String>,
    ) {
        let position = self.messages.len();
        self.messages.push(Message {
            position,
            role,
            text,
            edit,
            timestamp,
            model,
        });
    }

    fn into_session(self, raw: &RawPayload, header: Option<&Map<String, Value>>) -> Session {
        let field = |key: &str| header.and_then(|h| h.get(key));
        let string_field = |key: &str| {
            field(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let session_id = string_field("sessionId")
            .or_else(|| string_field("session_id"))
            .or_else(|| string_field("id"))
            .unwrap_or_else(|| {
                Path::new(&raw.source_path)
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| raw.source_path.clone())
            });

        let message_times: Vec<i64> = self.messages.iter().filter_map(|m| m.timestamp).collect();
        let fallback = raw.modified.timestamp();
        let (start_time, end_time) = match (message_times.iter().min(), message_times.iter().max()) {
            (Some(min), Some(max)) => (*min, *max),
            _ => {
                let created = field("creationDate").and_then(to_unix_secs);
                let last = field("lastMessageDate").and_then(to_unix_secs);
                let start = created.or(last).unwrap_or(fallback);
                (start, last.unwrap_or(start).max(start))
            }
        };

        let title = string_field("customTitle").or_else(|| {
            self.messages
                .iter()
                .find(|m| m.role == Role::User && m.has_text())
                .map(|m| m.text.trim().chars().take(TITLE_MAX_CHARS).collect())
        });

        let model_id = self.model_id.or_else(|| {
            field("selectedModel")
                .and_then(|m| m.get("identifier"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        let model_id = model_id.or_else(|| self.messages.iter().find_map(|m| m.model.clone()));

        Session {
            session_id,
            container_id: raw.container_id.clone(),
            workspace_name: raw.workspace_name.clone(),
            workspace_path: raw.workspace_path.clone(),
            messages: self.messages,
            session_type: SessionType::default(),
            edits: Default::default(),
            start_time,
            end_time,
            title,
            requester: string_field("requesterUsername"),
            responder: string_field("responderUsername"),
            model_id,
            agent_name: self.agent_name,
            source_path: raw.source_path.clone(),
            source_size_bytes: raw.bytes.len() as i64,
            partial: self.partial,
            fingerprint: String::new(),
        }
    }
}

// ─── Structured turns ───────────────────────────────────────────────

/// `{"requests": [{ "message": ..., "response": ..., "timestamp": ... }]}`
struct StructuredTurns;

impl ShapeParser for StructuredTurns {
    fn matches(&self, value: &Value) -> bool {
        value.get("requests").is_some_and(Value::is_array)
    }

    fn parse(&self, value: &Value, out: &mut Extraction) {
        let requests = value
            .get("requests")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for req in requests {
            let Some(req) = req.as_object() else {
                out.partial = true;
                continue;
            };
            let ts = req.get("timestamp").and_then(to_unix_secs);
            let model = req.get("modelId").and_then(Value::as_str).map(str::to_string);

            if out.model_id.is_none() {
                out.model_id = model.clone();
            }
            if out.agent_name.is_none() {
                out.agent_name = req.get("agent").and_then(agent_name);
            }

            let user_text = match req.get("message") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Object(m)) => m
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                _ => String::new(),
            };
            if !user_text.is_empty() {
                out.push(Role::User, user_text, None, ts, None);
            }

            match req.get("response") {
                Some(Value::Array(parts)) => {
                    parse_response_parts(parts, ts, model.as_deref(), out)
                }
                Some(Value::Object(resp)) => {
                    let resp_ts = resp.get("timestamp").and_then(to_unix_secs).or(ts);
                    let resp_model = resp
                        .get("model")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| model.clone());
                    if is_edit_group(resp) {
                        match parse_edit_group(resp) {
                            Some(edit) => {
                                let model = resp_model.clone();
                                out.push(Role::Assistant, String::new(), Some(edit), resp_ts, model)
                            }
                            None => out.partial = true,
                        }
                    }
                    let text = response_object_text(resp);
                    if !text.is_empty() {
                        out.push(Role::Assistant, text, None, resp_ts, resp_model);
                    }
                }
                Some(Value::String(s)) if !s.is_empty() => {
                    out.push(Role::Assistant, s.clone(), None, ts, model.clone());
                }
                _ => {}
            }
        }
    }
}

/// Walk a response part list. Adjacent text fragments merge into one
/// assistant message; every edit group is its own unit.
fn parse_response_parts(
    parts: &[Value],
    ts: Option<i64>,
    model: Option<&str>,
    out: &mut Extraction,
) {
    let mut pending = String::new();
    let model = model.map(str::to_string);

    for part in parts {
        match part {
            Value::String(s) => pending.push_str(s),
            Value::Object(obj) if is_edit_group(obj) => {
                if !pending.is_empty() {
                    let text = std::mem::take(&mut pending);
                    out.push(Role::Assistant, text, None, ts, model.clone());
                }
                match parse_edit_group(obj) {
                    Some(edit) => {
                        out.push(Role::Assistant, String::new(), Some(edit), ts, model.clone())
                    }
                    None => out.partial = true,
                }
            }
            Value::Object(obj) => {
                if let Some(text) = part_text(obj) {
                    pending.push_str(text);
                }
            }
            _ => {}
        }
    }

    if !pending.is_empty() {
        out.push(Role::Assistant, pending, None, ts, model);
    }
}

/// Text carried by a non-edit response part, if it renders as prose.
fn part_text(obj: &Map<String, Value>) -> Option<&str> {
    match obj.get("kind").and_then(Value::as_str) {
        None => obj.get("value").and_then(Value::as_str),
        Some("markdownContent") => match obj.get("content") {
            Some(Value::String(s)) => Some(s.as_str()),
            Some(Value::Object(c)) => c.get("value").and_then(Value::as_str),
            _ => None,
        },
        Some("markdownVuln") | Some("text") => obj
            .get("value")
            .or_else(|| obj.get("content"))
            .and_then(Value::as_str),
        // progress messages, tool invocations, references, code block uris
        Some(_) => None,
    }
}

/// Legacy object responses: `value`, then `result.value`/`result.message`,
/// then `message`.
fn response_object_text(resp: &Map<String, Value>) -> String {
    if let Some(v) = resp.get("value") {
        return value_text(v);
    }
    if let Some(result) = resp.get("result") {
        return match result {
            Value::Object(r) => r
                .get("value")
                .map(value_text)
                .filter(|s| !s.is_empty())
                .or_else(|| r.get("message").map(value_text))
                .unwrap_or_default(),
            Value::Null => String::new(),
            other => value_text(other),
        };
    }
    resp.get("message").map(value_text).unwrap_or_default()
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .filter_map(|i| match i {
                Value::String(s) => Some(s.as_str()),
                Value::Object(o) => part_text(o),
                _ => None,
            })
            .collect(),
        other => other.to_string(),
    }
}

fn agent_name(agent: &Value) -> Option<String> {
    let agent = agent.as_object()?;
    ["fullName", "name", "id"]
        .iter()
        .find_map(|k| agent.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

// ─── Edit groups ────────────────────────────────────────────────────

fn is_edit_group(obj: &Map<String, Value>) -> bool {
    obj.get("kind").and_then(Value::as_str) == Some("textEditGroup")
}

/// `{"kind":"textEditGroup","uri":{...},"edits":[[{"range":{...}}]]}`.
/// Returns `None` when the group names no file.
fn parse_edit_group(obj: &Map<String, Value>) -> Option<EditOperation> {
    let file_path = match obj.get("uri")? {
        Value::Object(uri) => uri
            .get("fsPath")
            .or_else(|| uri.get("path"))
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::String(s) => Some(crate::source::decode_workspace_uri(s).0),
        _ => None,
    }
    .filter(|p| !p.is_empty())?;

    let mut ranges = Vec::new();
    if let Some(edits) = obj.get("edits").and_then(Value::as_array) {
        for group in edits {
            match group {
                Value::Array(items) => ranges.extend(items.iter().filter_map(parse_range)),
                single => ranges.extend(parse_range(single)),
            }
        }
    }

    Some(EditOperation { file_path, ranges })
}

fn parse_range(edit: &Value) -> Option<LineRange> {
    let range = edit.get("range")?;
    let line = |key: &str| range.get(key).and_then(Value::as_i64).unwrap_or(0);
    Some(LineRange {
        start_line: line("startLineNumber"),
        end_line: line("endLineNumber"),
    })
}

// ─── Legacy flat messages ───────────────────────────────────────────

/// `[{"role":"user","content":"..."}]` or `{"messages":[...]}`.
struct LegacyMessages;

impl ShapeParser for LegacyMessages {
    fn matches(&self, value: &Value) -> bool {
        value.is_array() || value.get("messages").is_some_and(Value::is_array)
    }

    fn parse(&self, value: &Value, out: &mut Extraction) {
        let items = match value {
            Value::Array(items) => items.as_slice(),
            other => other
                .get("messages")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default(),
        };
        for item in items {
            if !push_message_like(item, out) {
                out.partial = true;
            }
        }
    }
}

/// Extract one message-like object. Returns false when the entry could not
/// be understood.
fn push_message_like(item: &Value, out: &mut Extraction) -> bool {
    let Some(obj) = item.as_object() else {
        return false;
    };
    let ts = ["timestamp", "time", "createdAt", "created_at"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(to_unix_secs));
    let model = obj.get("model").and_then(Value::as_str).map(str::to_string);

    if is_edit_group(obj) {
        return match parse_edit_group(obj) {
            Some(edit) => {
                out.push(Role::Assistant, String::new(), Some(edit), ts, model);
                true
            }
            None => false,
        };
    }

    let role = ["role", "author", "sender", "type"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .and_then(Role::parse);
    let Some(role) = role else {
        return false;
    };
    let text = ["content", "text", "value", "message"]
        .iter()
        .find_map(|k| obj.get(*k))
        .map(value_text)
        .unwrap_or_default();
    out.push(role, text, None, ts, model);
    true
}

// ─── Best effort ────────────────────────────────────────────────────

/// Unknown object layout: take message-like entries from any top-level
/// array, in key order of the parsed object.
fn best_effort(obj: &Map<String, Value>, out: &mut Extraction) {
    for value in obj.values() {
        if let Value::Array(items) = value {
            for item in items {
                push_message_like(item, out);
            }
        }
    }
}

/// Epoch seconds from a number (seconds or milliseconds) or RFC 3339 string.
fn to_unix_secs(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => {
            let f = n.as_f64()?;
            if f <= 0.0 {
                None
            } else if f > MILLIS_THRESHOLD {
                Some((f / 1000.0) as i64)
            } else {
                Some(f as i64)
            }
        }
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp()),
        _ => None,
    }
}
