//! Bounded ordered sequence of recent conversation turns (spec.md §3, §4.4).
//!
//! Single-writer per orchestrator: all mutations are funneled through the
//! dispatcher or retrieval coordinator task, never accessed from more than
//! one task concurrently (enforced by wrapping the window in a
//! `tokio::sync::Mutex` at the call site, as with the teacher's
//! `SessionManager` maps in `src/agent/session_manager.rs`).

use chrono::{DateTime, Utc};

/// Who produced a [`Turn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
    /// Internal peer-notification marker (spec.md §4.4 step 5); never
    /// included verbatim in the formatted snapshot handed to a retriever —
    /// instead rendered as a short system aside.
    PeerMarker,
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub speaker: Speaker,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// Default capacity, matching the "recent window" language of spec.md §4.6
/// (conversation chunks) scaled down for in-memory turn tracking rather
/// than character budgets.
pub const DEFAULT_CAPACITY: usize = 40;

/// Bounded ordered sequence of recent turns, evicting the oldest entry once
/// capacity is exceeded.
pub struct SlidingWindow {
    capacity: usize,
    turns: std::collections::VecDeque<Turn>,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            turns: std::collections::VecDeque::with_capacity(capacity),
        }
    }

    /// Append a turn, evicting the oldest if at capacity.
    pub fn push(&mut self, speaker: Speaker, content: impl Into<String>) {
        if self.turns.len() >= self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(Turn {
            speaker,
            content: content.into(),
            at: Utc::now(),
        });
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Speaker::User, content);
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(Speaker::Assistant, content);
    }

    /// Add the peer-notification marker (spec.md §4.4 step 5): a
    /// best-effort ordering hint, not a synchronization barrier.
    pub fn push_peer_marker(&mut self, retriever_label: &str) {
        self.push(
            Speaker::PeerMarker,
            format!(
                "[{retriever_label} already returned memory context for this prompt; \
                 prefer a short complementary answer or SKIP]"
            ),
        );
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Clear the window (used on session_reset handoff, spec.md §4.1).
    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Render a formatted snapshot for prompt construction (spec.md §4.4
    /// step 2: "recent window snapshot + the new prompt + instruction
    /// preamble").
    pub fn format_snapshot(&self) -> String {
        let mut out = String::new();
        for turn in &self.turns {
            let label = match turn.speaker {
                Speaker::User => "user",
                Speaker::Assistant => "assistant",
                Speaker::PeerMarker => "system",
            };
            out.push_str(&format!("[{label}] {}\n", turn.content));
        }
        out
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_past_capacity() {
        let mut window = SlidingWindow::new(2);
        window.push_user("one");
        window.push_user("two");
        window.push_user("three");

        assert_eq!(window.len(), 2);
        let snapshot = window.format_snapshot();
        assert!(!snapshot.contains("one"));
        assert!(snapshot.contains("two"));
        assert!(snapshot.contains("three"));
    }

    #[test]
    fn clear_empties_the_window() {
        let mut window = SlidingWindow::default();
        window.push_user("hello");
        window.clear();
        assert!(window.is_empty());
    }

    #[test]
    fn peer_marker_is_visible_in_snapshot() {
        let mut window = SlidingWindow::default();
        window.push_user("how do I X?");
        window.push_peer_marker("keyword-retriever");

        let snapshot = window.format_snapshot();
        assert!(snapshot.contains("keyword-retriever"));
        assert!(snapshot.contains("SKIP"));
    }
}
