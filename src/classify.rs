//! Session type classification.
//!
//! Every message is a response unit. A unit with non-empty text is
//! conversation evidence; a unit carrying a file edit is edit evidence and
//! contributes its file path and changed-line count to the edit totals.
//!
//! | conversation | edit | type |
//! |---|---|---|
//! | yes | no | `conversation` |
//! | no | yes | `code_edit` |
//! | yes | yes | `mixed` |
//! | no | no | `conversation` |
//!
//! Evidence is counted per unit, not weighted by length, so a one-word
//! acknowledgment next to an edit still makes the session `mixed`.

use crate::models::{EditMetadata, Session, SessionType};

/// Evidence gathered from a session's response units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evidence {
    pub conversation: bool,
    pub edit: bool,
}

impl Evidence {
    pub fn session_type(&self) -> SessionType {
        match (self.conversation, self.edit) {
            (true, true) => SessionType::Mixed,
            (false, true) => SessionType::CodeEdit,
            (true, false) | (false, false) => SessionType::Conversation,
        }
    }
}

/// Derive the session type and edit totals. Never fails.
pub fn classify(session: &Session) -> (SessionType, EditMetadata) {
    let mut evidence = Evidence::default();
    let mut edits = EditMetadata::default();

    for unit in &session.messages {
        if unit.has_text() {
            evidence.conversation = true;
        }
        if let Some(edit) = &unit.edit {
            evidence.edit = true;
            edits.file_paths.insert(edit.file_path.clone());
            edits.line_count = edits.line_count.saturating_add(edit.line_count());
        }
    }

    (evidence.session_type(), edits)
}

/// Classify in place.
pub fn apply(session: &mut Session) {
    let (session_type, edits) = classify(session);
    session.session_type = session_type;
    session.edits = edits;
}
