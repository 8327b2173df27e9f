//! Occasional bot chatter picked from a text file of lines.

use std::{path::PathBuf, sync::Arc, time::Duration};

use event_loop::{try_get, Handled, Is, Message, MessageHandler};
use rand::{seq::SliceRandom, Rng};

use crate::{
    rcon::{clean_latin1, RconClient},
    state::BridgeState,
};

pub const AMBIENT_INTERVAL: Duration = Duration::from_secs(300);
pub const AMBIENT_CHANCE: f64 = 0.5;

/// Non-empty lines that aren't `#` comments.
#[must_use]
pub fn parse_chat_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

async fn load_chat_lines(path: PathBuf) -> Vec<String> {
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => {
            let lines = parse_chat_lines(&text);
            tracing::info!("Loaded {} chat lines from {path:?}", lines.len());
            lines
        }
        Err(e) => {
            tracing::warn!("Couldn't read chat lines from {path:?}: {e}");
            Vec::new()
        }
    }
}

// Messages *************************

#[derive(Debug, Clone, Copy)]
pub struct AmbientChatTick;
impl<S> Message<S> for AmbientChatTick {}

/// Re-reads `random_chat_path`.
#[derive(Debug, Clone, Copy)]
pub struct ReloadChatLines;
impl<S> Message<S> for ReloadChatLines {}

#[derive(Debug, Clone)]
pub struct ChatLinesLoaded(pub Vec<String>);

impl Message<BridgeState> for ChatLinesLoaded {
    fn update_state(self, state: &mut BridgeState) {
        state.chat_lines = self.0;
    }
}

// Handlers *************************

pub struct AmbientChat {
    rcon: Arc<RconClient>,
    chance: f64,
}

impl AmbientChat {
    #[must_use]
    pub const fn new(rcon: Arc<RconClient>) -> Self {
        Self {
            rcon,
            chance: AMBIENT_CHANCE,
        }
    }

    #[must_use]
    pub const fn with_chance(mut self, chance: f64) -> Self {
        self.chance = chance;
        self
    }

    /// The command for this tick, if one should be said at all.
    fn pick(&self, state: &BridgeState) -> Option<String> {
        let bot = state.settings.bot_name()?;
        let mut rng = rand::thread_rng();
        if !rng.gen_bool(self.chance.clamp(0.0, 1.0)) {
            return None;
        }
        let line = state.chat_lines.choose(&mut rng)?;
        Some(clean_latin1(&format!("sayasbot {bot} {line}")))
    }
}

impl<IM, OM> MessageHandler<BridgeState, IM, OM> for AmbientChat
where
    IM: Is<AmbientChatTick> + Is<ReloadChatLines>,
    OM: Is<ChatLinesLoaded> + 'static,
{
    fn handle_message(&mut self, state: &BridgeState, message: &IM) -> Option<Handled<OM>> {
        if try_get::<ReloadChatLines>(message).is_some() {
            let Some(path) = state.settings.random_chat_path.clone() else {
                return Handled::single(ChatLinesLoaded(Vec::new()));
            };
            return Handled::future(async move { Some(ChatLinesLoaded(load_chat_lines(path).await).into()) });
        }

        try_get::<AmbientChatTick>(message)?;
        if state.restart.is_suspended() {
            return Handled::none();
        }
        let target = state.settings.rcon_target()?;
        let command = self.pick(state)?;

        let rcon = self.rcon.clone();
        Handled::future(async move {
            if let Err(e) = rcon.send(&target, &command).await {
                tracing::debug!("Ambient chat failed: {e}");
            }
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::settings::Settings;

    #[test]
    fn skips_comments_and_blanks() {
        let lines = parse_chat_lines("# greetings\nHello there\n\n   \n  General Kenobi  \n#end\n");
        assert_eq!(lines, vec!["Hello there", "General Kenobi"]);
    }

    fn configured() -> BridgeState {
        let mut settings = Settings::default();
        settings.bot_name = Some("Jawa".into());
        let mut state = BridgeState::new(settings);
        state.chat_lines = vec!["Utinni!".into()];
        state
    }

    #[test]
    fn picks_a_line_for_the_bot() {
        let ambient = AmbientChat::new(Arc::new(RconClient::new())).with_chance(1.0);
        assert_eq!(
            ambient.pick(&configured()).as_deref(),
            Some("sayasbot Jawa Utinni!")
        );
    }

    #[test]
    fn stays_quiet_without_luck_lines_or_bot() {
        let rcon = Arc::new(RconClient::new());
        assert_eq!(AmbientChat::new(rcon.clone()).with_chance(0.0).pick(&configured()), None);

        let mut state = configured();
        state.chat_lines.clear();
        assert_eq!(AmbientChat::new(rcon.clone()).with_chance(1.0).pick(&state), None);

        let mut state = configured();
        state.settings.bot_name = None;
        assert_eq!(AmbientChat::new(rcon).with_chance(1.0).pick(&state), None);
    }

    #[tokio::test]
    async fn loads_lines_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "# comment\nfirst\nsecond").expect("write");

        let lines = load_chat_lines(file.path().to_path_buf()).await;
        assert_eq!(lines, vec!["first", "second"]);
        assert!(load_chat_lines(PathBuf::from("/nonexistent/chat.txt")).await.is_empty());
    }
}
