//! Requests issued from the chat platform side: raw RCON, server status,
//! account lookups, the connected player list and settings.

use std::{collections::HashMap, sync::Arc};

use event_loop::{try_get, Handled, Is, Message, MessageHandler};
use serde::Serialize;
use tokio::sync::mpsc::Sender;

use crate::{
    ambient::ReloadChatLines,
    chat::Card,
    console::{strip_colors, tailer::ReloadTailer},
    players::{Session, SessionId},
    rcon::{clean_latin1, RconClient, RconError},
    state::BridgeState,
    tracker::{self, TrackerError},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCommand {
    Rcon(String),
    Status,
    Account(String),
    Players,
    Player(SessionId),
    GetSetting(String),
    SetSetting { key: String, value: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CommandReply {
    Text { text: String },
    Card(Card),
    Sessions { sessions: Vec<Session> },
    Setting { key: String, value: Option<String> },
    NotFound { text: String },
    Failed { text: String },
}

impl CommandReply {
    fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    fn failed(text: impl Into<String>) -> Self {
        Self::Failed { text: text.into() }
    }
}

const MISSING: &str = "N/A";

/// `accountinfo` reply, one `Key: value` pair per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo(HashMap<String, String>);

impl AccountInfo {
    /// `None` unless the reply names an account `Id`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let fields: HashMap<String, String> = text
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_owned(), strip_colors(value).trim().to_owned()))
            .filter(|(key, _)| !key.is_empty())
            .collect();
        fields.contains_key("Id").then_some(Self(fields))
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn number(&self, key: &str) -> u64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// `HH:MM` is shown as whole hours.
    #[must_use]
    pub fn playtime(&self) -> String {
        match self.get("Time") {
            Some(time) => match time.split_once(':') {
                Some((hours, _)) => format!("{} Hrs", hours.trim()),
                None => time.to_owned(),
            },
            None => MISSING.to_owned(),
        }
    }

    #[must_use]
    pub fn to_card(&self, lookup: &str) -> Card {
        let or_missing = |key: &str| self.get(key).unwrap_or(MISSING).to_owned();
        let won = self.number("Duels won");
        let total = self.number("Total duels");

        Card::new(format!(
            "Player Stats for {}",
            self.get("Name").unwrap_or(lookup)
        ))
        .field("Playtime", self.playtime())
        .field("Level", or_missing("Level"))
        .field("Profession", or_missing("Profession"))
        .field("Credits", or_missing("Credits"))
        .field("Stashes", or_missing("Stashes"))
        .field("Duel Score", or_missing("Score"))
        .field("Duels Won", won.to_string())
        .field("Duels Lost", total.saturating_sub(won).to_string())
        .field("Total Kills", self.get("Kills").unwrap_or("0").to_owned())
        .footer(format!("Last login: {}", or_missing("Last login")))
    }
}

// Messages *************************

/// A command plus where to send its reply.
#[derive(Debug)]
pub struct CommandRequest {
    pub command: BridgeCommand,
    pub reply: Sender<CommandReply>,
}
impl<S> Message<S> for CommandRequest {}

#[derive(Debug)]
pub struct SettingUpdate {
    pub key: String,
    pub value: String,
    pub reply: Sender<CommandReply>,
}

impl Message<BridgeState> for SettingUpdate {
    fn update_state(self, state: &mut BridgeState) {
        let reply = match state.settings.set(&self.key, &self.value) {
            Ok(()) => {
                tracing::info!("Setting {} updated.", self.key);
                state.settings_changed(&self.key);
                state.settings.save_ok();
                CommandReply::Setting {
                    value: state.settings.get(&self.key).ok().flatten(),
                    key: self.key,
                }
            }
            Err(e) => CommandReply::failed(e.to_string()),
        };
        respond(&self.reply, reply);
    }
}

// Handlers *************************

pub struct CommandHandler {
    rcon: Arc<RconClient>,
    http: reqwest::Client,
}

impl CommandHandler {
    #[must_use]
    pub fn new(rcon: Arc<RconClient>, http: reqwest::Client) -> Self {
        Self { rcon, http }
    }
}

impl<IM, OM> MessageHandler<BridgeState, IM, OM> for CommandHandler
where
    IM: Is<CommandRequest> + Is<SettingUpdate>,
    OM: Is<SettingUpdate> + Is<ReloadTailer> + Is<ReloadChatLines> + 'static,
{
    fn handle_message(&mut self, state: &BridgeState, message: &IM) -> Option<Handled<OM>> {
        // Follow-ups run once the update has landed.
        if let Some(update) = try_get::<SettingUpdate>(message) {
            return match update.key.as_str() {
                "log_base_path" | "log_file_name" => Handled::single(ReloadTailer),
                "random_chat_path" => Handled::single(ReloadChatLines),
                _ => Handled::none(),
            };
        }

        let request = try_get::<CommandRequest>(message)?;
        let reply = request.reply.clone();

        match &request.command {
            BridgeCommand::Rcon(command) => self.rcon_command(state, command, reply),
            BridgeCommand::Status => self.status(state, reply),
            BridgeCommand::Account(name) => self.account(state, name, reply),
            BridgeCommand::Players => {
                let sessions = state.registry.all().into_iter().cloned().collect();
                respond(&reply, CommandReply::Sessions { sessions });
                Handled::none()
            }
            BridgeCommand::Player(session_id) => {
                let response = match state.registry.get(*session_id) {
                    Some(session) => CommandReply::Sessions {
                        sessions: vec![session.clone()],
                    },
                    None => CommandReply::NotFound {
                        text: format!("No player in slot {session_id}."),
                    },
                };
                respond(&reply, response);
                Handled::none()
            }
            BridgeCommand::GetSetting(key) => {
                let response = match state.settings.get(key) {
                    Ok(value) => CommandReply::Setting {
                        key: key.clone(),
                        value,
                    },
                    Err(e) => CommandReply::failed(e.to_string()),
                };
                respond(&reply, response);
                Handled::none()
            }
            BridgeCommand::SetSetting { key, value } => Handled::single(SettingUpdate {
                key: key.clone(),
                value: value.clone(),
                reply,
            }),
        }
    }
}

impl CommandHandler {
    fn rcon_command<OM: 'static>(
        &self,
        state: &BridgeState,
        command: &str,
        reply: Sender<CommandReply>,
    ) -> Option<Handled<OM>> {
        let Some(target) = state.settings.rcon_target() else {
            respond(&reply, CommandReply::failed(RconError::NotConfigured.to_string()));
            return Handled::none();
        };

        let rcon = self.rcon.clone();
        let command = clean_latin1(command);
        Handled::future(async move {
            let response = match rcon.send(&target, &command).await {
                Ok(response) => {
                    let output = strip_colors(response.text().trim());
                    if output.is_empty() {
                        CommandReply::text(format!("RCON command sent: `{command}`"))
                    } else {
                        CommandReply::text(format!(
                            "RCON command sent: `{command}`\n```\n{output}\n```"
                        ))
                    }
                }
                Err(e) => {
                    CommandReply::failed(format!("Failed to send RCON command `{command}`: {e}"))
                }
            };
            respond(&reply, response);
            None
        })
    }

    fn status<OM: 'static>(
        &self,
        state: &BridgeState,
        reply: Sender<CommandReply>,
    ) -> Option<Handled<OM>> {
        let Some(url) = state.settings.tracker_url.clone() else {
            respond(&reply, CommandReply::failed(TrackerError::NotConfigured.to_string()));
            return Handled::none();
        };

        let http = self.http.clone();
        Handled::future(async move {
            let response = match tracker::fetch_status(&http, &url).await {
                Ok(status) => CommandReply::Card(status.to_card()),
                Err(e) => {
                    tracing::warn!("Server status lookup failed: {e}");
                    CommandReply::failed(format!("Failed to fetch server status: {e}"))
                }
            };
            respond(&reply, response);
            None
        })
    }

    fn account<OM: 'static>(
        &self,
        state: &BridgeState,
        name: &str,
        reply: Sender<CommandReply>,
    ) -> Option<Handled<OM>> {
        let Some(target) = state.settings.rcon_target() else {
            respond(&reply, CommandReply::failed(RconError::NotConfigured.to_string()));
            return Handled::none();
        };

        let rcon = self.rcon.clone();
        let name = clean_latin1(name.trim());
        Handled::future(async move {
            let response = match rcon.send(&target, &format!("accountinfo {name}")).await {
                Ok(response) => match AccountInfo::parse(&response.text()) {
                    Some(info) => CommandReply::Card(info.to_card(&name)),
                    None => CommandReply::NotFound {
                        text: format!("Player '{name}' not found."),
                    },
                },
                Err(e) => CommandReply::failed(format!("Failed to look up '{name}': {e}")),
            };
            respond(&reply, response);
            None
        })
    }
}

fn respond(reply: &Sender<CommandReply>, response: CommandReply) {
    if reply.try_send(response).is_err() {
        tracing::debug!("Command requester went away before the reply.");
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::channel;

    use super::*;
    use crate::settings::Settings;

    const ACCOUNT: &str = "\
Id: 42
Name: ^2Kyle
Time: 12:30
Level: 7
Profession: Jedi
Credits: 1500
Stashes: 3
Score: 1210
Kills: 88
Duels won: 10
Total duels: 14
Last login: 2024-03-09
";

    #[test]
    fn parses_account_info() {
        let info = AccountInfo::parse(ACCOUNT).expect("account");
        assert_eq!(info.get("Name"), Some("Kyle"));
        assert_eq!(info.get("Time"), Some("12:30"));
        assert_eq!(info.playtime(), "12 Hrs");

        let card = info.to_card("kyle");
        assert_eq!(card.title, "Player Stats for Kyle");
        let lost = card.fields.iter().find(|f| f.name == "Duels Lost").expect("lost");
        assert_eq!(lost.value, "4");
        assert_eq!(card.footer.as_deref(), Some("Last login: 2024-03-09"));
    }

    #[test]
    fn missing_stats_show_as_not_available() {
        let info = AccountInfo::parse("Id: 7\nName: Jan\n").expect("account");
        let card = info.to_card("jan");
        let value = |name: &str| {
            card.fields
                .iter()
                .find(|f| f.name == name)
                .map(|f| f.value.clone())
                .expect("field")
        };
        assert_eq!(value("Playtime"), "N/A");
        assert_eq!(value("Level"), "N/A");
        assert_eq!(value("Total Kills"), "0");
        assert_eq!(value("Duels Lost"), "0");
        assert_eq!(card.footer.as_deref(), Some("Last login: N/A"));
    }

    #[test]
    fn unknown_account_has_no_id() {
        assert_eq!(AccountInfo::parse("Account not found.\n"), None);
    }

    #[tokio::test]
    async fn setting_update_replies_and_applies() {
        let mut state = BridgeState::new(Settings::default());
        let (tx, mut rx) = channel(1);
        SettingUpdate {
            key: "placeholder_prefixes".into(),
            value: "Newbie".into(),
            reply: tx,
        }
        .update_state(&mut state);

        assert!(state.registry.is_placeholder("Newbie7"));
        assert!(matches!(
            rx.recv().await,
            Some(CommandReply::Setting { value: Some(v), .. }) if v == "Newbie"
        ));
    }

    #[tokio::test]
    async fn invalid_setting_reports_failure() {
        let mut state = BridgeState::new(Settings::default());
        let (tx, mut rx) = channel(1);
        SettingUpdate {
            key: "rcon_port".into(),
            value: "not a port".into(),
            reply: tx,
        }
        .update_state(&mut state);

        assert!(matches!(rx.recv().await, Some(CommandReply::Failed { .. })));
        assert_eq!(state.settings.rcon_port, None);
    }
}
