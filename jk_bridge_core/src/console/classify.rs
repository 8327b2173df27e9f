//! Turns one server log line into at most one [`LogEvent`].

use std::sync::LazyLock;

use event_loop::Message;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::strip_colors;
use crate::{
    chat::{ChatEvent, ChatSource},
    players::{RegistryEvent, SessionId},
    state::BridgeState,
};

static DISCONNECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"info:\s*(.+?)\s*disconnected\s*\((\d+)\)").expect("valid disconnect regex")
});
static ACCOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"Player "(.+?)" \((.+?)\) has logged (in|out)"#).expect("valid account regex")
});

/// Phrases that identify each kind of line. The server's log format has
/// drifted between versions, so all of them can be overridden from the
/// settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Markers {
    pub chat: String,
    pub private_chat: String,
    pub team_chat: String,
    pub bridge_tag: String,
    pub duel: String,
    pub duel_won: String,
    pub shutdown: String,
    pub initialization: String,
    pub map_loaded: String,
    /// Each is followed by the player's name.
    pub join_active: Vec<String>,
    /// Followed by the client id.
    pub join_begin: String,
    pub disconnect: String,
    pub userinfo: String,
    pub userinfo_name_key: String,
    pub vpn_ip: String,
    pub bot_suffix: String,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            chat: "say: ".into(),
            private_chat: "tell:".into(),
            team_chat: "sayteam:".into(),
            bridge_tag: "(Discord)".into(),
            duel: "duel:".into(),
            duel_won: "won a duel against".into(),
            shutdown: "ShutdownGame:".into(),
            initialization: "------ Server Initialization ------".into(),
            map_loaded: "Server: ".into(),
            join_active: vec!["Going from CS_PRIMED to CS_ACTIVE for ".into()],
            join_begin: "ClientBegin: ".into(),
            disconnect: "ClientDisconnect: ".into(),
            userinfo: "ClientUserinfoChanged: ".into(),
            userinfo_name_key: "n".into(),
            vpn_ip: "info: IP: ".into(),
            bot_suffix: "-Bot".into(),
        }
    }
}

impl Markers {
    #[must_use]
    pub fn is_bot(&self, name: &str) -> bool {
        !self.bot_suffix.is_empty() && name.ends_with(&self.bot_suffix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMarker {
    Shutdown,
    Initialization,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Chat(ChatEvent),
    /// At least one of the two fields is present.
    Join {
        session_id: Option<SessionId>,
        name: Option<String>,
    },
    Disconnect {
        session_id: SessionId,
        name: Option<String>,
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
    Duel {
        winner: String,
        loser: String,
    },
    Restart(RestartMarker),
    MapLoaded {
        map: String,
    },
    VpnFlag {
        session_id: SessionId,
        ip: String,
    },
}

impl LogEvent {
    /// The registry mutation this event implies, if any.
    #[must_use]
    pub fn registry_event(&self) -> Option<RegistryEvent> {
        Some(match self {
            Self::Join {
                session_id: Some(session_id),
                name,
            } => RegistryEvent::Join {
                session_id: *session_id,
                name: name.clone(),
            },
            Self::Join {
                session_id: None,
                name: Some(name),
            } => RegistryEvent::AnonymousJoin { name: name.clone() },
            Self::Disconnect { session_id, .. } => RegistryEvent::Disconnect {
                session_id: *session_id,
            },
            Self::Rename { session_id, name } => RegistryEvent::Rename {
                session_id: *session_id,
                name: name.clone(),
            },
            Self::Login { name, account } => RegistryEvent::Login {
                name: name.clone(),
                account: account.clone(),
            },
            Self::Logout { name } => RegistryEvent::Logout { name: name.clone() },
            _ => return None,
        })
    }
}

impl Message<BridgeState> for LogEvent {
    fn update_state(self, state: &mut BridgeState) {
        match &self {
            Self::Restart(_) => {
                state.restart.suspend();
            }
            Self::MapLoaded { map } => {
                state.restart.map_loaded(map);
            }
            _ => {}
        }

        if let Some(event) = self.registry_event() {
            state.registry.apply(event);
        }
    }
}

/// Pure line classification. Lines matching nothing yield `None`, as do lines
/// that match a marker but carry malformed fields.
#[must_use]
pub fn classify(line: &str, markers: &Markers) -> Option<LogEvent> {
    if contains(line, &markers.vpn_ip) {
        return vpn_flag(line);
    }

    // Whatever a player types must not pass for a server marker.
    if contains(line, &markers.private_chat) || contains(line, &markers.team_chat) {
        return None;
    }
    if contains(line, &markers.chat) {
        return chat(line, markers).map(LogEvent::Chat);
    }

    if contains(line, &markers.duel) && contains(line, &markers.duel_won) {
        return duel(line, markers);
    }

    if contains(line, &markers.shutdown) {
        return Some(LogEvent::Restart(RestartMarker::Shutdown));
    }
    if contains(line, &markers.initialization) {
        return Some(LogEvent::Restart(RestartMarker::Initialization));
    }

    if let Some(name) = markers
        .join_active
        .iter()
        .find_map(|marker| after(line, marker))
    {
        let name = clean(name)?;
        return Some(LogEvent::Join {
            session_id: None,
            name: Some(name),
        });
    }
    if let Some(rest) = after(line, &markers.join_begin) {
        return Some(LogEvent::Join {
            session_id: Some(leading_id(rest)?),
            name: None,
        });
    }

    if let Some(captures) = DISCONNECT.captures(line) {
        return Some(LogEvent::Disconnect {
            session_id: captures[2].parse().ok()?,
            name: clean(&captures[1]),
        });
    }
    if let Some(rest) = after(line, &markers.disconnect) {
        return Some(LogEvent::Disconnect {
            session_id: leading_id(rest)?,
            name: None,
        });
    }

    if let Some(rest) = after(line, &markers.userinfo) {
        return rename(rest, markers);
    }

    if let Some(captures) = ACCOUNT.captures(line) {
        let name = clean(&captures[1])?;
        return Some(match &captures[3] {
            "in" => LogEvent::Login {
                name,
                account: clean(&captures[2])?,
            },
            _ => LogEvent::Logout { name },
        });
    }

    if let Some(map) = after(line, &markers.map_loaded) {
        return Some(LogEvent::MapLoaded { map: clean(map)? });
    }

    None
}

fn chat(line: &str, markers: &Markers) -> Option<ChatEvent> {
    let rest = after(line, &markers.chat)?;
    let (speaker, message) = rest.split_once(": ")?;
    let speaker = clean(speaker)?;
    let message = clean(message)?;

    // Our own relayed messages come back through the log.
    if contains(&speaker, &markers.bridge_tag) || contains(&message, &markers.bridge_tag) {
        return None;
    }

    Some(ChatEvent {
        speaker,
        message,
        source: ChatSource::Game,
    })
}

fn duel(line: &str, markers: &Markers) -> Option<LogEvent> {
    let rest = after(line, &markers.duel)?;
    let (winner, loser) = rest.split_once(markers.duel_won.as_str())?;
    Some(LogEvent::Duel {
        winner: clean(winner)?,
        loser: clean(loser)?,
    })
}

/// `<id> n\Name\t\0\model\...`
fn rename(rest: &str, markers: &Markers) -> Option<LogEvent> {
    let rest = rest.trim_start();
    let (id, blob) = rest.split_once(char::is_whitespace)?;
    let session_id = id.parse().ok()?;

    let mut fields = blob.trim().trim_start_matches('\\').split('\\');
    while let (Some(key), Some(value)) = (fields.next(), fields.next()) {
        if key == markers.userinfo_name_key {
            return Some(LogEvent::Rename {
                session_id,
                name: clean(value)?,
            });
        }
    }
    None
}

/// `<date> <time> info: IP: <ip> ... <id>`; the address is the fifth token
/// and the id the last.
fn vpn_flag(line: &str) -> Option<LogEvent> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 6 {
        return None;
    }
    let session_id = tokens.last()?.parse().ok()?;
    let ip = match tokens[4].rsplit_once(':') {
        Some((host, port))
            if host.contains('.') && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host
        }
        _ => tokens[4],
    };
    Some(LogEvent::VpnFlag {
        session_id,
        ip: ip.to_owned(),
    })
}

// Useful

fn contains(haystack: &str, marker: &str) -> bool {
    !marker.is_empty() && haystack.contains(marker)
}

fn after<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    if marker.is_empty() {
        return None;
    }
    line.find(marker).map(|i| &line[i + marker.len()..])
}

/// Color-stripped and trimmed, or `None` if nothing is left.
fn clean(text: &str) -> Option<String> {
    let cleaned = strip_colors(text).trim().to_owned();
    (!cleaned.is_empty()).then_some(cleaned)
}

fn leading_id(text: &str) -> Option<SessionId> {
    let digits: String = text
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}
