//! Periodic RCON player polls and the parsers for their replies.

use std::{sync::Arc, time::Instant};

use event_loop::{try_get, Handled, Is, Message, MessageHandler};

use crate::{
    console::strip_colors,
    players::{PollSnapshot, PolledPlayer},
    rcon::RconClient,
    settings::PollCommand,
    state::BridgeState,
};

/// Parses a `status` reply. `None` if the reply has no player table at all
/// (bad password, server still loading), which is different from an empty
/// server.
#[must_use]
pub fn parse_status(text: &str) -> Option<Vec<PolledPlayer>> {
    let mut lines = text.lines();
    lines.find(|l| {
        let mut words = l.split_whitespace();
        words.next() == Some("num") && words.next() == Some("score")
    })?;

    let players = lines
        .skip_while(|l| l.trim_start().starts_with("---"))
        .filter_map(status_row)
        .collect();
    Some(players)
}

/// `num score ping name lastmsg address qport rate`, where the name may
/// contain spaces.
fn status_row(line: &str) -> Option<PolledPlayer> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 8 {
        return None;
    }
    let session_id = tokens[0].parse().ok()?;
    let name = strip_colors(&tokens[3..tokens.len() - 4].join(" "));
    Some(PolledPlayer {
        session_id,
        name: name.trim().to_owned(),
        account: None,
    })
}

/// Parses a `playerlist` reply, locating the name and account columns from
/// the header line. Columns count characters, not bytes, since names decoded
/// from Latin-1 can take two bytes per character.
#[must_use]
pub fn parse_playerlist(text: &str) -> Option<Vec<PolledPlayer>> {
    let mut lines = text.lines();
    let header = lines.find(|l| {
        let lower = l.to_ascii_lowercase();
        lower.contains("name") && lower.contains("account")
    })?;
    let lower = header.to_ascii_lowercase();
    let name_at = lower[..lower.find("name")?].chars().count();
    let account_at = lower[..lower.find("account")?].chars().count();
    if account_at <= name_at {
        return None;
    }

    let players = lines
        .filter_map(|line| playerlist_row(line, name_at, account_at))
        .collect();
    Some(players)
}

fn playerlist_row(line: &str, name_at: usize, account_at: usize) -> Option<PolledPlayer> {
    let session_id = line.split_whitespace().next()?.parse().ok()?;

    let name_start = byte_offset(line, name_at)?;
    let (name, account) = match byte_offset(line, account_at) {
        Some(account_start) => (
            &line[name_start..account_start],
            line[account_start..].split_whitespace().next(),
        ),
        // Short rows without an account column.
        None => (&line[name_start..], None),
    };

    let name = strip_colors(name).trim().to_owned();
    if name.is_empty() {
        return None;
    }
    let account = account
        .map(strip_colors)
        .filter(|a| !a.is_empty() && a != "-" && !a.eq_ignore_ascii_case("none"));

    Some(PolledPlayer {
        session_id,
        name,
        account,
    })
}

/// Byte offset of the character in `column`, or of the end of the line.
fn byte_offset(line: &str, column: usize) -> Option<usize> {
    line.char_indices()
        .map(|(at, _)| at)
        .chain(std::iter::once(line.len()))
        .nth(column)
}

#[must_use]
pub fn parse_poll(command: PollCommand, text: &str) -> Option<Vec<PolledPlayer>> {
    match command {
        PollCommand::Status => parse_status(text),
        PollCommand::Playerlist => parse_playerlist(text),
    }
}

// Messages *************************

#[derive(Debug, Clone, Copy)]
pub struct PollTick;
impl<S> Message<S> for PollTick {}

#[derive(Debug, Clone, Copy)]
pub struct PollFailed;
impl<S> Message<S> for PollFailed {}

// Handlers *************************

/// Keeps at most one poll in flight and skips polling while the server is
/// restarting, since an empty reply then would look like everyone left.
pub struct PlayerPoller {
    rcon: Arc<RconClient>,
    in_flight: bool,
}

impl PlayerPoller {
    #[must_use]
    pub const fn new(rcon: Arc<RconClient>) -> Self {
        Self {
            rcon,
            in_flight: false,
        }
    }
}

impl<IM, OM> MessageHandler<BridgeState, IM, OM> for PlayerPoller
where
    IM: Is<PollTick> + Is<PollSnapshot> + Is<PollFailed>,
    OM: Is<PollSnapshot> + Is<PollFailed> + 'static,
{
    fn handle_message(&mut self, state: &BridgeState, message: &IM) -> Option<Handled<OM>> {
        if try_get::<PollSnapshot>(message).is_some() || try_get::<PollFailed>(message).is_some() {
            self.in_flight = false;
            return Handled::none();
        }

        try_get::<PollTick>(message)?;
        if self.in_flight || state.restart.is_suspended() {
            return Handled::none();
        }
        let target = state.settings.rcon_target()?;

        self.in_flight = true;
        let command = state.settings.poll_command;
        let rcon = self.rcon.clone();
        Handled::future(async move {
            let taken_at = Instant::now();
            let response = match rcon.send(&target, command.command()).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!("Player poll failed: {e}");
                    return Some(PollFailed.into());
                }
            };

            match parse_poll(command, &response.text()) {
                Some(players) => Some(PollSnapshot { taken_at, players }.into()),
                None => {
                    tracing::debug!("Player poll reply had no player table.");
                    Some(PollFailed.into())
                }
            }
        })
    }
}
