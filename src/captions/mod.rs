//! Caption overlay store.
//!
//! A bounded-lifetime append-only log of transcript lines. Entries are never
//! mutated; the store grows by insertion and shrinks by age-based eviction.
//! Purging is driven from the host's refresh loop, not a timer of its own.

use std::time::{Duration, Instant};

/// One transcribed line.
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub text: String,
    pub created: Instant,
}

/// Live set of caption entries.
pub struct CaptionStore {
    entries: Vec<TranscriptEntry>,
    window: Duration,
}

impl CaptionStore {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Vec::new(),
            window,
        }
    }

    pub fn push(&mut self, text: String) {
        self.push_at(text, Instant::now());
    }

    fn push_at(&mut self, text: String, created: Instant) {
        self.entries.push(TranscriptEntry { text, created });
    }

    /// Drop entries older than the display window.
    pub fn purge(&mut self, now: Instant) {
        let window = self.window;
        self.entries
            .retain(|e| now.duration_since(e.created) <= window);
    }

    /// Current live entries, oldest first, for the render collaborator.
    pub fn live(&self) -> &[TranscriptEntry] {
        &self.entries
    }
}
