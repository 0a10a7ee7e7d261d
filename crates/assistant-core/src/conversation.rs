//! In-memory conversation log plus the single-slot last-analysis cache.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    /// UI-only notices. Never sent upstream in prompts or wire history.
    System,
}

impl Role {
    /// Label used when formatting history into prompt text.
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
            Self::System => "System",
        }
    }

    /// Role name used in the proxy wire history.
    fn wire_name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// One message in the conversation log. Immutable once created; insertion
/// order is the only ordering.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A turn as sent to the proxy backend.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WireTurn {
    pub role: &'static str,
    pub content: String,
}

/// Called with the full current history after every append and clear.
pub type HistoryListener = Box<dyn Fn(&[ConversationTurn]) + Send + Sync>;

#[derive(Default)]
struct StoreInner {
    history: Vec<ConversationTurn>,
    last_analysis: String,
}

/// Append-only turn log owned by the orchestrator. Internally synchronized
/// so the orchestrator can stay `&self`-callable; the orchestrator's
/// single-flight rule means mutations never actually race.
#[derive(Default)]
pub struct ConversationStore {
    inner: Mutex<StoreInner>,
    listeners: Mutex<Vec<HistoryListener>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a turn to the history. Never fails.
    pub fn append(&self, role: Role, content: &str) {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.history.push(ConversationTurn {
                role,
                content: content.to_string(),
                created_at: Utc::now(),
            });
            inner.history.clone()
        };
        self.notify(&snapshot);
    }

    /// The last `n` non-system turns formatted as `"<Role>: <content>"`
    /// lines, oldest first. Empty string when no qualifying turn exists.
    pub fn recent_history_text(&self, n: usize) -> String {
        let inner = self.inner.lock();
        let qualifying: Vec<&ConversationTurn> = inner
            .history
            .iter()
            .filter(|t| t.role != Role::System)
            .collect();
        let start = qualifying.len().saturating_sub(n);
        qualifying[start..]
            .iter()
            .map(|t| format!("{}: {}", t.role.label(), t.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The last `n` non-system turns in proxy wire form, oldest first.
    pub fn wire_history(&self, n: usize) -> Vec<WireTurn> {
        let inner = self.inner.lock();
        let qualifying: Vec<&ConversationTurn> = inner
            .history
            .iter()
            .filter(|t| t.role != Role::System)
            .collect();
        let start = qualifying.len().saturating_sub(n);
        qualifying[start..]
            .iter()
            .map(|t| WireTurn {
                role: t.role.wire_name(),
                content: t.content.clone(),
            })
            .collect()
    }

    pub fn set_last_analysis(&self, text: &str) {
        self.inner.lock().last_analysis = text.to_string();
    }

    /// Empty string before the first successful analysis.
    pub fn last_analysis(&self) -> String {
        self.inner.lock().last_analysis.clone()
    }

    /// Snapshot of the full history.
    pub fn history(&self) -> Vec<ConversationTurn> {
        self.inner.lock().history.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the history and the last-analysis slot together.
    pub fn clear(&self) {
        {
            let mut inner = self.inner.lock();
            inner.history.clear();
            inner.last_analysis.clear();
        }
        self.notify(&[]);
    }

    /// Register a history listener (live UI sync).
    pub fn subscribe(&self, listener: HistoryListener) {
        self.listeners.lock().push(listener);
    }

    // Listeners run outside the history lock so they may call back into the
    // store without deadlocking.
    fn notify(&self, snapshot: &[ConversationTurn]) {
        for listener in self.listeners.lock().iter() {
            listener(snapshot);
        }
    }
}
