//! Who is connected, merged from two feeds: log events arrive immediately
//! but may carry placeholder names, while RCON polls are authoritative about
//! membership but lag behind.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use event_loop::Message;

use crate::state::BridgeState;

pub mod session;

pub use session::Session;

pub type SessionId = u32;

/// How long a poll result outranks a placeholder name from the log.
pub const POLL_FRESHNESS: Duration = Duration::from_secs(10);
/// Logins for names not yet tracked wait this long for their session.
const PENDING_LOGIN_TTL: Duration = Duration::from_secs(60);
/// Removals are remembered this long so a poll sent before them can't undo them.
const REMOVAL_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledPlayer {
    pub session_id: SessionId,
    pub name: String,
    pub account: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSnapshot {
    /// When the poll request was sent, not when the reply arrived.
    pub taken_at: Instant,
    pub players: Vec<PolledPlayer>,
}

impl Message<BridgeState> for PollSnapshot {
    fn update_state(self, state: &mut BridgeState) {
        state.registry.apply(RegistryEvent::PollSnapshot(self));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Join {
        session_id: SessionId,
        name: Option<String>,
    },
    /// Activation line naming a client without its id.
    AnonymousJoin {
        name: String,
    },
    Disconnect {
        session_id: SessionId,
    },
    Rename {
        session_id: SessionId,
        name: String,
    },
    Login {
        name: String,
        account: String,
    },
    Logout {
        name: String,
    },
    PollSnapshot(PollSnapshot),
}

type PlaceholderPredicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

pub struct PlayerRegistry {
    sessions: HashMap<SessionId, Session>,
    pending_logins: HashMap<String, (String, Instant)>,
    removed_at: HashMap<SessionId, Instant>,
    placeholder: PlaceholderPredicate,
}

impl std::fmt::Debug for PlayerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerRegistry")
            .field("sessions", &self.sessions)
            .field("pending_logins", &self.pending_logins)
            .field("removed_at", &self.removed_at)
            .finish_non_exhaustive()
    }
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self::new(vec!["Padawan".into()])
    }
}

impl PlayerRegistry {
    /// Names that are empty or start with any of `prefixes` are placeholders.
    #[must_use]
    pub fn new(prefixes: Vec<String>) -> Self {
        Self::with_placeholder(prefix_predicate(prefixes))
    }

    #[must_use]
    pub fn with_placeholder(predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            sessions: HashMap::new(),
            pending_logins: HashMap::new(),
            removed_at: HashMap::new(),
            placeholder: Box::new(predicate),
        }
    }

    pub fn set_placeholder_prefixes(&mut self, prefixes: Vec<String>) {
        self.placeholder = Box::new(prefix_predicate(prefixes));
    }

    #[must_use]
    pub fn is_placeholder(&self, name: &str) -> bool {
        name.trim().is_empty() || (self.placeholder)(name)
    }

    pub fn apply(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Join { session_id, name } => self.on_join(session_id, name.as_deref()),
            RegistryEvent::AnonymousJoin { name } => self.on_anonymous_join(&name),
            RegistryEvent::Disconnect { session_id } => {
                self.on_disconnect(session_id);
            }
            RegistryEvent::Rename { session_id, name } => {
                self.on_rename(session_id, &name);
            }
            RegistryEvent::Login { name, account } => self.on_login(&name, &account),
            RegistryEvent::Logout { name } => self.on_logout(&name),
            RegistryEvent::PollSnapshot(snapshot) => {
                self.on_poll_snapshot(snapshot);
            }
        }
    }

    // **** Log feed ****

    /// Creates or overwrites the session straight away so a notification can
    /// name someone. A different real name on a known id is a new player in a
    /// reused slot.
    pub fn on_join(&mut self, session_id: SessionId, name: Option<&str>) {
        let now = Instant::now();
        let name = name.map(str::trim).filter(|n| !n.is_empty());

        let tracked = self
            .sessions
            .get(&session_id)
            .map(|s| {
                let same_name = s.display_name == name.unwrap_or_default();
                (same_name, self.is_placeholder(&s.display_name))
            });

        match (tracked, name) {
            (Some(_), None) | (Some((true, _)), Some(_)) => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.acknowledge(now);
                }
            }
            (Some((false, true)), Some(name)) => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.rename(name, now);
                }
            }
            (_, name) => {
                let session = Session::new(session_id, name.unwrap_or_default().to_owned(), now);
                self.sessions.insert(session_id, session);
            }
        }

        self.claim_pending_login(session_id);
    }

    pub fn on_anonymous_join(&mut self, name: &str) {
        let now = Instant::now();
        if let Some(session) = self.find_by_name_mut(name) {
            session.acknowledge(now);
        }
    }

    pub fn on_disconnect(&mut self, session_id: SessionId) -> Option<Session> {
        self.remove(session_id, Instant::now())
    }

    /// Returns whether the rename was applied. A placeholder never replaces a
    /// real name that a poll confirmed moments ago.
    pub fn on_rename(&mut self, session_id: SessionId, name: &str) -> bool {
        let now = Instant::now();
        let name = name.trim();
        let placeholder = self.is_placeholder(name);

        match self.sessions.get_mut(&session_id) {
            Some(session) => {
                let current_is_placeholder = (self.placeholder)(&session.display_name)
                    || session.display_name.trim().is_empty();
                if placeholder
                    && !current_is_placeholder
                    && session.polled_within(now, POLL_FRESHNESS)
                {
                    tracing::debug!(
                        "Ignoring rename of {session_id} to {name:?}, poll says {:?}",
                        session.display_name
                    );
                    session.acknowledge(now);
                    return false;
                }
                session.rename(name, now);
            }
            None => {
                self.sessions
                    .insert(session_id, Session::new(session_id, name.to_owned(), now));
            }
        }

        self.claim_pending_login(session_id);
        true
    }

    pub fn on_login(&mut self, name: &str, account: &str) {
        let now = Instant::now();
        match self.find_by_name_mut(name) {
            Some(session) => {
                session.linked_account = Some(account.to_owned());
                session.acknowledge(now);
            }
            None => {
                self.pending_logins
                    .insert(name_key(name), (account.to_owned(), now));
            }
        }
    }

    /// The only way a linked account is cleared.
    pub fn on_logout(&mut self, name: &str) {
        self.pending_logins.remove(&name_key(name));
        let now = Instant::now();
        if let Some(session) = self.find_by_name_mut(name) {
            session.linked_account = None;
            session.acknowledge(now);
        }
    }

    // **** Poll feed ****

    /// Sessions a snapshot would remove: unlisted and not corroborated since
    /// the poll was sent.
    #[must_use]
    pub fn departures(&self, snapshot: &PollSnapshot) -> Vec<&Session> {
        let mut departed: Vec<&Session> = self
            .sessions
            .values()
            .filter(|s| s.last_seen_at < snapshot.taken_at)
            .filter(|s| {
                !snapshot
                    .players
                    .iter()
                    .any(|p| p.session_id == s.session_id)
            })
            .collect();
        departed.sort_by_key(|s| s.session_id);
        departed
    }

    /// Applies a snapshot and returns the sessions it removed.
    pub fn on_poll_snapshot(&mut self, snapshot: PollSnapshot) -> Vec<Session> {
        let now = Instant::now();
        let departed_ids: Vec<SessionId> = self
            .departures(&snapshot)
            .iter()
            .map(|s| s.session_id)
            .collect();

        for polled in &snapshot.players {
            self.merge_polled(polled, snapshot.taken_at, now);
        }

        self.pending_logins
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < PENDING_LOGIN_TTL);
        self.removed_at
            .retain(|_, at| now.saturating_duration_since(*at) < REMOVAL_TTL);

        departed_ids
            .into_iter()
            .filter_map(|id| self.remove(id, now))
            .collect()
    }

    fn merge_polled(&mut self, polled: &PolledPlayer, taken_at: Instant, now: Instant) {
        let polled_is_placeholder = self.is_placeholder(&polled.name);

        let Some(session) = self.sessions.get_mut(&polled.session_id) else {
            // Left after the poll was sent.
            if self
                .removed_at
                .get(&polled.session_id)
                .is_some_and(|removed| *removed >= taken_at)
            {
                tracing::debug!(
                    "Ignoring {:?} in slot {} from a poll older than their departure",
                    polled.name,
                    polled.session_id
                );
                return;
            }
            self.sessions
                .insert(polled.session_id, Session::new_from_poll(polled, now));
            self.claim_pending_login(polled.session_id);
            return;
        };

        let tracked_is_placeholder = session.display_name.trim().is_empty()
            || (self.placeholder)(&session.display_name);

        // Two different accounts on one id: the slot was reused.
        let other_account = matches!(
            (&session.linked_account, &polled.account),
            (Some(tracked), Some(polled)) if tracked != polled
        );
        if other_account && session.last_seen_at < taken_at {
            *session = Session::new_from_poll(polled, now);
            return;
        }

        if session.display_name != polled.name && !polled_is_placeholder {
            if tracked_is_placeholder || session.name_updated_at < taken_at {
                session.rename(&polled.name, now);
            }
        }

        // Absence from a poll never clears an account.
        if polled.account.is_some() {
            session.linked_account.clone_from(&polled.account);
        }

        session.polled_at = Some(now);
        session.acknowledge(now);
    }

    // **** Queries ****

    #[must_use]
    pub fn get(&self, session_id: SessionId) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    /// Ordered by session id.
    #[must_use]
    pub fn all(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by_key(|s| s.session_id);
        sessions
    }

    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&Session> {
        let key = name_key(name);
        self.sessions
            .values()
            .find(|s| name_key(&s.display_name) == key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn find_by_name_mut(&mut self, name: &str) -> Option<&mut Session> {
        let key = name_key(name);
        self.sessions
            .values_mut()
            .find(|s| name_key(&s.display_name) == key)
    }

    fn remove(&mut self, session_id: SessionId, now: Instant) -> Option<Session> {
        self.removed_at.insert(session_id, now);
        self.sessions.remove(&session_id)
    }

    fn claim_pending_login(&mut self, session_id: SessionId) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if let Some((account, _)) = self.pending_logins.remove(&name_key(&session.display_name)) {
            session.linked_account = Some(account);
        }
    }
}

fn prefix_predicate(prefixes: Vec<String>) -> impl Fn(&str) -> bool + Send + Sync + 'static {
    move |name: &str| prefixes.iter().any(|p| !p.is_empty() && name.starts_with(p.as_str()))
}

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn polled(session_id: SessionId, name: &str, account: Option<&str>) -> PolledPlayer {
        PolledPlayer {
            session_id,
            name: name.into(),
            account: account.map(Into::into),
        }
    }

    fn snapshot(players: Vec<PolledPlayer>) -> PollSnapshot {
        PollSnapshot {
            taken_at: Instant::now(),
            players,
        }
    }

    #[test]
    fn poll_replaces_placeholder_names() {
        let mut registry = PlayerRegistry::default();
        registry.on_join(5, Some("Padawan5"));
        registry.on_poll_snapshot(snapshot(vec![polled(5, "RealName", Some("acct1"))]));

        let session = registry.get(5).expect("session 5");
        assert_eq!(session.display_name, "RealName");
        assert_eq!(session.linked_account.as_deref(), Some("acct1"));
    }

    #[test]
    fn poll_never_clears_a_login() {
        let mut registry = PlayerRegistry::default();
        registry.on_join(5, Some("RealName"));
        registry.on_login("RealName", "acct1");
        registry.on_poll_snapshot(snapshot(vec![polled(5, "RealName", None)]));

        assert_eq!(
            registry.get(5).and_then(|s| s.linked_account.as_deref()),
            Some("acct1")
        );

        registry.on_logout("realname");
        assert_eq!(registry.get(5).and_then(|s| s.linked_account.clone()), None);
    }

    #[test]
    fn login_before_join_is_claimed() {
        let mut registry = PlayerRegistry::default();
        registry.on_login("Kyle", "kkatarn");
        registry.on_join(2, Some("Kyle"));
        assert_eq!(
            registry.get(2).and_then(|s| s.linked_account.as_deref()),
            Some("kkatarn")
        );
    }

    #[test]
    fn poll_creates_untracked_sessions_and_removes_departed_ones() {
        let mut registry = PlayerRegistry::default();
        let taken_at = Instant::now();
        std::thread::sleep(Duration::from_millis(5));

        registry.on_poll_snapshot(PollSnapshot {
            taken_at,
            players: vec![polled(1, "Kyle", None), polled(2, "Jan", None)],
        });
        assert_eq!(registry.len(), 2);
        std::thread::sleep(Duration::from_millis(5));

        let departed = registry.on_poll_snapshot(snapshot(vec![polled(1, "Kyle", None)]));
        assert_eq!(departed.len(), 1);
        assert_eq!(departed[0].display_name, "Jan");
        assert!(registry.get(2).is_none());
    }

    #[test]
    fn stale_poll_keeps_sessions_seen_after_it_was_sent() {
        let mut registry = PlayerRegistry::default();
        let taken_at = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        registry.on_join(3, Some("Rosh"));

        let stale = PollSnapshot {
            taken_at,
            players: Vec::new(),
        };
        assert!(registry.departures(&stale).is_empty());
        assert!(registry.on_poll_snapshot(stale).is_empty());
        assert!(registry.get(3).is_some());
    }

    #[test]
    fn stale_poll_does_not_undo_a_rename() {
        let mut registry = PlayerRegistry::default();
        registry.on_join(3, Some("Rosh"));
        let taken_at = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        registry.on_rename(3, "Rosh Penin");

        registry.on_poll_snapshot(PollSnapshot {
            taken_at,
            players: vec![polled(3, "Rosh", None)],
        });
        assert_eq!(registry.get(3).map(|s| s.display_name.as_str()), Some("Rosh Penin"));
    }

    #[test]
    fn stale_poll_does_not_bring_back_a_disconnect() {
        let mut registry = PlayerRegistry::default();
        registry.on_join(3, Some("Kyle"));
        registry.on_login("Kyle", "kkatarn");
        let taken_at = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        registry.on_disconnect(3);

        registry.on_poll_snapshot(PollSnapshot {
            taken_at,
            players: vec![polled(3, "Kyle", Some("kkatarn"))],
        });
        assert!(registry.get(3).is_none());

        // The next player in the slot starts clean.
        registry.on_rename(3, "Jan");
        registry.on_join(3, None);
        let session = registry.get(3).expect("session 3");
        assert_eq!(session.display_name, "Jan");
        assert_eq!(session.linked_account, None);
    }

    #[test]
    fn poll_sent_after_a_disconnect_can_list_the_slot_again() {
        let mut registry = PlayerRegistry::default();
        registry.on_join(3, Some("Kyle"));
        registry.on_disconnect(3);
        std::thread::sleep(Duration::from_millis(5));

        registry.on_poll_snapshot(snapshot(vec![polled(3, "Jan", None)]));
        assert_eq!(registry.get(3).map(|s| s.display_name.as_str()), Some("Jan"));
    }

    #[test]
    fn placeholder_rename_loses_to_fresh_poll() {
        let mut registry = PlayerRegistry::default();
        registry.on_join(4, Some("Padawan"));
        registry.on_poll_snapshot(snapshot(vec![polled(4, "Tavion", None)]));

        assert!(!registry.on_rename(4, "Padawan"));
        assert_eq!(registry.get(4).map(|s| s.display_name.as_str()), Some("Tavion"));

        assert!(registry.on_rename(4, "Tavion Axmis"));
        assert_eq!(
            registry.get(4).map(|s| s.display_name.as_str()),
            Some("Tavion Axmis")
        );
    }

    #[test]
    fn reused_slot_drops_previous_identity() {
        let mut registry = PlayerRegistry::default();
        registry.on_join(6, Some("Kyle"));
        registry.on_login("Kyle", "kkatarn");
        registry.on_disconnect(6);
        registry.on_join(6, Some("Jan"));

        let session = registry.get(6).expect("session 6");
        assert_eq!(session.display_name, "Jan");
        assert_eq!(session.linked_account, None);
    }

    #[test]
    fn join_with_new_name_on_known_id_replaces_session() {
        let mut registry = PlayerRegistry::default();
        registry.on_join(6, Some("Kyle"));
        registry.on_login("Kyle", "kkatarn");
        registry.on_join(6, Some("Jan"));
        assert_eq!(registry.get(6).and_then(|s| s.linked_account.clone()), None);
    }

    #[test]
    fn placeholder_predicate_is_configurable() {
        let mut registry = PlayerRegistry::with_placeholder(|name| name == "Player");
        assert!(registry.is_placeholder("Player"));
        assert!(!registry.is_placeholder("Padawan"));
        assert!(registry.is_placeholder("  "));

        registry.set_placeholder_prefixes(vec!["Newbie".into()]);
        assert!(registry.is_placeholder("Newbie12"));
    }

    #[test]
    fn at_most_one_session_per_id() {
        let mut registry = PlayerRegistry::default();
        registry.on_join(1, Some("Kyle"));
        registry.on_rename(1, "Kyle Katarn");
        registry.on_join(1, None);
        registry.on_poll_snapshot(snapshot(vec![polled(1, "Kyle Katarn", None)]));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.all().len(), 1);
    }
}
