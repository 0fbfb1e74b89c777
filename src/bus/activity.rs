//! Time-windowed activity log of routed operations.
//!
//! Every routed `get_now_playing` / `control` / `get_image` produces exactly
//! one entry. Entries older than the retention window are pruned on each
//! insert, so the log never grows past five minutes of traffic.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Maximum entries returned by a snapshot.
const SNAPSHOT_LIMIT: usize = 100;

/// Retention window for entries.
fn retention() -> Duration {
    Duration::minutes(5)
}

/// Kind of routed operation.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ActivityKind {
    #[serde(rename = "getNowPlaying")]
    GetNowPlaying,
    #[serde(rename = "control")]
    Control,
    #[serde(rename = "getImage")]
    GetImage,
}

/// One routed operation, success or failure.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    #[serde(skip)]
    pub(crate) id: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: ActivityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_data: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl ActivityEntry {
    pub fn new(kind: ActivityKind, zone_id: Option<&str>) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            kind,
            zone_id: zone_id.map(|s| s.to_string()),
            prefix: zone_id.and_then(|z| z.split(':').next().map(|p| p.to_string())),
            action: None,
            value: None,
            has_data: None,
            error: None,
            sender: None,
        }
    }

    pub fn with_action(mut self, action: &str, value: Option<&serde_json::Value>) -> Self {
        self.action = Some(action.to_string());
        self.value = value.cloned();
        self
    }

    pub fn with_sender(mut self, sender: Option<&str>) -> Self {
        self.sender = sender.map(|s| s.to_string());
        self
    }

    pub fn with_result(mut self, has_data: bool) -> Self {
        self.has_data = Some(has_data);
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Handle for amending an entry after insertion (control logs before dispatch
/// and fills in the error afterwards).
#[derive(Debug, Clone, Copy)]
pub struct ActivityToken(u64);

/// Insertion-ordered bounded log.
pub struct ActivityLog {
    inner: Mutex<Inner>,
}

struct Inner {
    entries: VecDeque<ActivityEntry>,
    next_id: u64,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                next_id: 1,
            }),
        }
    }

    /// Insert an entry, pruning anything outside the retention window first.
    pub fn record(&self, mut entry: ActivityEntry) -> ActivityToken {
        let Ok(mut inner) = self.inner.lock() else {
            // Poisoned lock: the log is diagnostics, not state worth dying for.
            return ActivityToken(0);
        };
        let cutoff = Utc::now() - retention();
        while inner
            .entries
            .front()
            .is_some_and(|e| e.timestamp < cutoff)
        {
            inner.entries.pop_front();
        }
        let id = inner.next_id;
        inner.next_id += 1;
        entry.id = id;
        inner.entries.push_back(entry);
        ActivityToken(id)
    }

    /// Attach an error to a previously recorded entry.
    pub fn mark_error(&self, token: ActivityToken, error: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(entry) = inner.entries.iter_mut().rev().find(|e| e.id == token.0) {
                entry.error = Some(error.to_string());
                entry.has_data = Some(false);
            }
        }
    }

    /// Mark a previously recorded entry as completed successfully.
    pub fn mark_ok(&self, token: ActivityToken) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(entry) = inner.entries.iter_mut().rev().find(|e| e.id == token.0) {
                entry.has_data = Some(true);
            }
        }
    }

    /// Most recent entries (≤100), oldest first.
    pub fn snapshot(&self) -> Vec<ActivityEntry> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let skip = inner.entries.len().saturating_sub(SNAPSHOT_LIMIT);
        inner.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
