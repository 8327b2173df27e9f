use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{PolledPlayer, SessionId};

/// One connected client for as long as its slot is held.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: SessionId,
    pub display_name: String,
    pub linked_account: Option<String>,
    pub connected_since: DateTime<Utc>,

    #[serde(skip)]
    /// Last log event or poll that confirmed this session
    pub(crate) last_seen_at: Instant,
    #[serde(skip)]
    pub(crate) name_updated_at: Instant,
    #[serde(skip)]
    pub(crate) polled_at: Option<Instant>,
}

impl Session {
    pub(crate) fn new(session_id: SessionId, display_name: String, now: Instant) -> Self {
        Self {
            session_id,
            display_name,
            linked_account: None,
            connected_since: Utc::now(),
            last_seen_at: now,
            name_updated_at: now,
            polled_at: None,
        }
    }

    pub(crate) fn new_from_poll(polled: &PolledPlayer, now: Instant) -> Self {
        let mut session = Self::new(polled.session_id, polled.name.clone(), now);
        session.linked_account.clone_from(&polled.account);
        session.polled_at = Some(now);
        session
    }

    #[must_use]
    pub const fn last_seen_at(&self) -> Instant {
        self.last_seen_at
    }

    pub(crate) fn rename(&mut self, name: &str, now: Instant) {
        if self.display_name != name {
            name.clone_into(&mut self.display_name);
            self.name_updated_at = now;
        }
        self.acknowledge(now);
    }

    pub(crate) fn acknowledge(&mut self, now: Instant) {
        self.last_seen_at = self.last_seen_at.max(now);
    }

    /// Whether a poll corroborated this session within `window` of `now`.
    pub(crate) fn polled_within(&self, now: Instant, window: std::time::Duration) -> bool {
        self.polled_at
            .is_some_and(|at| now.saturating_duration_since(at) <= window)
    }
}
