//! Change detection.
//!
//! A session's fingerprint is a SHA-256 over its identity and semantic
//! content: the session id, message texts in sequence order, the distinct
//! edited file paths, and the edit line total. Timestamps, file sizes and
//! other volatile fields are excluded, so re-reading unchanged source data
//! never looks like a change.

use sha2::{Digest, Sha256};

use crate::models::{ChangeStatus, Session};

/// Hex length of a SHA-256 digest.
const FINGERPRINT_LEN: usize = 64;

/// Outcome of comparing a session against its last stored fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub status: ChangeStatus,
    /// Set when the stored fingerprint was malformed and ignored.
    pub inconsistency: Option<String>,
}

pub fn compute(session: &Session) -> String {
    let mut hasher = Sha256::new();
    // Length-prefix every field so boundaries can't be shifted.
    let mut field = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };

    field(session.session_id.as_bytes());
    field(&(session.messages.len() as u64).to_le_bytes());
    for message in &session.messages {
        field(message.text.as_bytes());
    }
    field(&(session.edits.file_paths.len() as u64).to_le_bytes());
    for path in &session.edits.file_paths {
        field(path.as_bytes());
    }
    field(&session.edits.line_count.to_le_bytes());

    format!("{:x}", hasher.finalize())
}

/// Stamp the session with its fingerprint.
pub fn apply(session: &mut Session) {
    session.fingerprint = compute(session);
}

pub fn is_well_formed(fingerprint: &str) -> bool {
    fingerprint.len() == FINGERPRINT_LEN
        && fingerprint
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Decide whether a session is new, changed or unchanged.
///
/// A malformed stored fingerprint is treated as absent: the session is
/// reported `New` and the inconsistency is returned for the run summary.
pub fn decide(session: &Session, last_fingerprint: Option<&str>) -> Decision {
    match last_fingerprint {
        None => Decision {
            status: ChangeStatus::New,
            inconsistency: None,
        },
        Some(stored) if !is_well_formed(stored) => Decision {
            status: ChangeStatus::New,
            inconsistency: Some(format!(
                "session {}: stored fingerprint '{}' is malformed",
                session.session_id, stored
            )),
        },
        Some(stored) if stored == session.fingerprint => Decision {
            status: ChangeStatus::Unchanged,
            inconsistency: None,
        },
        Some(_) => Decision {
            status: ChangeStatus::Changed,
            inconsistency: None,
        },
    }
}
