//! Append-only record of completed conversation turns.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Who produced a turn's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One completed half-turn. Immutable after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub id: u64,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Ordered log of completed turns.
///
/// The state machine is the only writer; everything else reads
/// snapshots. Insertion order is chronological. There is no size cap
/// and no deduplication here; bounding for display is a UI concern.
#[derive(Debug, Default)]
pub struct ConversationLog {
    inner: Mutex<LogInner>,
}

#[derive(Debug, Default)]
struct LogInner {
    turns: Vec<ConversationTurn>,
    next_id: u64,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn, assigning it the next id.
    pub fn append(&self, role: Role, text: String) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.turns.push(ConversationTurn {
            id,
            role,
            text,
            timestamp: Utc::now(),
        });
        id
    }

    /// Full copy of the log in append order.
    pub fn snapshot(&self) -> Vec<ConversationTurn> {
        self.inner.lock().unwrap().turns.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Irreversibly empty the log. Ids keep increasing afterwards.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let dropped = inner.turns.len();
        inner.turns.clear();
        log::info!("Conversation log cleared ({} turns dropped)", dropped);
    }
}
