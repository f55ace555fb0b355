//! Follow-up context: the previous turn's goal, kept briefly so that short
//! replies such as "yes" or "now click the first one" continue it.

use std::sync::LazyLock;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::resolve::wants_in_page;
use crate::types::PendingFollowUp;

static AFFIRMATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(yes|yeah|yep|sure|ok|okay|continue|go on|go ahead|keep going|carry on|try again|retry|do it|please do|proceed)\b",
    )
    .expect("valid affirmation regex")
});

static NEW_REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(open|go to|goto|navigate to|visit|search for|search|look up|take me to)\b")
        .expect("valid new-request regex")
});

/// Whether `message` continues `pending` rather than starting a new goal.
pub fn continues(pending: &PendingFollowUp, message: &str) -> bool {
    let text = message.trim().to_lowercase();
    if text.is_empty() {
        return false;
    }
    if pending.requires_follow_up {
        return !NEW_REQUEST.is_match(&text);
    }
    if pending.completed {
        return wants_in_page(&text);
    }
    let short = text.split_whitespace().count() <= 4;
    (short && AFFIRMATION.is_match(&text)) || wants_in_page(&text)
}

/// Holds at most one [`PendingFollowUp`], dropped once older than the TTL.
#[derive(Debug)]
pub struct FollowUpMemory {
    slot: Mutex<Option<PendingFollowUp>>,
    ttl: Duration,
}

impl FollowUpMemory {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            ttl,
        }
    }

    pub fn store(&self, pending: PendingFollowUp) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(pending);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }

    fn is_fresh(&self, pending: &PendingFollowUp, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(pending.asked_at) <= ttl
    }

    /// Current record, if it has not expired.
    pub fn peek(&self, now: DateTime<Utc>) -> Option<PendingFollowUp> {
        let slot = self.slot.lock().ok()?;
        slot.as_ref().filter(|p| self.is_fresh(p, now)).cloned()
    }

    /// Remove and return the record. Expired records are dropped and yield `None`.
    pub fn take_active(&self, now: DateTime<Utc>) -> Option<PendingFollowUp> {
        let pending = self.slot.lock().ok()?.take()?;
        if self.is_fresh(&pending, now) {
            Some(pending)
        } else {
            debug!(goal = %pending.goal_text, "follow-up expired");
            None
        }
    }
}
