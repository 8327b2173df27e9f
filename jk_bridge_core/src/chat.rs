use std::{sync::Arc, time::Duration};

use event_loop::{try_get, Handled, Is, Message, MessageHandler};
use futures::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedSender},
    task::JoinHandle,
};

use crate::{
    rcon::{clean_latin1, RconClient, RconError},
    state::BridgeState,
};

/// Content limit of the first relayed line, after the speaker prefix.
pub const FIRST_CHUNK_LIMIT: usize = 115;
pub const CONTINUATION_LIMIT: usize = 124;
pub const CONTINUATION_PREFIX: &str = "say ";
/// Pause between consecutive chunks of one relayed message.
pub const CHUNK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Request({0})")]
    Request(#[from] reqwest::Error),
    #[error("Webhook rejected the message with status {0}")]
    Rejected(reqwest::StatusCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChatSource {
    Game,
    Discord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub speaker: String,
    pub message: String,
    pub source: ChatSource,
}

impl ChatEvent {
    /// How game chat appears in the Discord channel.
    #[must_use]
    pub fn to_discord(&self) -> Outbound {
        Outbound::text(format!("**{}**: {}", self.speaker, self.message))
    }

    /// The `say` commands that replay Discord chat in game.
    #[must_use]
    pub fn to_game_commands(&self) -> Vec<String> {
        let speaker = clean_latin1(&self.speaker);
        let message = clean_latin1(&self.message);
        let chunks = chunk_message(&message, FIRST_CHUNK_LIMIT, CONTINUATION_LIMIT);

        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                if i == 0 {
                    format!("say ^7(^5Discord^7) ^7{speaker}: ^2{chunk}")
                } else {
                    format!("{CONTINUATION_PREFIX}{chunk}")
                }
            })
            .collect()
    }
}

/// Splits `message` into chunks of at most `first` characters for the first
/// and `rest` for the others, breaking at the last whitespace that fits and
/// hard-cutting words that don't.
#[must_use]
pub fn chunk_message(message: &str, first: usize, rest: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = message.trim();

    while !remaining.is_empty() {
        let limit = if chunks.is_empty() { first } else { rest }.max(1);

        let Some((cut, _)) = remaining.char_indices().nth(limit) else {
            chunks.push(remaining.to_owned());
            break;
        };

        // Whitespace right at the limit still lets the whole head fit.
        let head = &remaining[..cut];
        let split = if remaining[cut..].starts_with(char::is_whitespace) {
            cut
        } else {
            head.rfind(char::is_whitespace).filter(|&i| i > 0).unwrap_or(cut)
        };

        chunks.push(remaining[..split].trim_end().to_owned());
        remaining = remaining[split..].trim_start();
    }

    chunks
}

// **** Outbound ****

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// A title, some labelled fields and an optional footer. How it's drawn is up
/// to the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct Card {
    pub title: String,
    pub fields: Vec<CardField>,
    pub footer: Option<String>,
}

impl Card {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(CardField {
            name: name.into(),
            value: value.into(),
            inline: true,
        });
        self
    }

    #[must_use]
    pub fn wide_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(CardField {
            name: name.into(),
            value: value.into(),
            inline: false,
        });
        self
    }

    #[must_use]
    pub fn footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = Some(footer.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Outbound {
    Text { content: String },
    Card(Card),
}

impl Outbound {
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    /// Discord webhook execute payload. Mentions are never resolved so game
    /// chat can't ping anyone.
    #[must_use]
    pub fn webhook_payload(&self) -> serde_json::Value {
        match self {
            Self::Text { content } => json!({
                "content": content,
                "allowed_mentions": { "parse": [] },
            }),
            Self::Card(card) => {
                let fields: Vec<_> = card
                    .fields
                    .iter()
                    .map(|f| json!({ "name": f.name, "value": f.value, "inline": f.inline }))
                    .collect();
                let mut embed = json!({ "title": card.title, "fields": fields });
                if let Some(footer) = &card.footer {
                    embed["footer"] = json!({ "text": footer });
                }
                json!({ "embeds": [embed], "allowed_mentions": { "parse": [] } })
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelTarget {
    pub channel_id: Option<u64>,
    pub webhook_url: Option<String>,
}

pub trait ChatSink: Send + Sync {
    fn send(
        &self,
        target: &ChannelTarget,
        message: Outbound,
    ) -> BoxFuture<'static, Result<(), ChatError>>;
}

/// Posts to the channel's webhook, or logs the message when none is set.
pub struct WebhookSink {
    client: reqwest::Client,
}

impl WebhookSink {
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ChatSink for WebhookSink {
    fn send(
        &self,
        target: &ChannelTarget,
        message: Outbound,
    ) -> BoxFuture<'static, Result<(), ChatError>> {
        let Some(url) = target.webhook_url.clone() else {
            tracing::info!("[chat] {message:?}");
            return futures::future::ready(Ok(())).boxed();
        };

        let request = self.client.post(url).json(&message.webhook_payload());
        async move {
            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(ChatError::Rejected(response.status()));
            }
            Ok(())
        }
        .boxed()
    }
}

/// Delivers outbound messages one at a time, in the order they were posted.
#[derive(Clone)]
pub struct ChatOutbox {
    tx: UnboundedSender<(ChannelTarget, Outbound)>,
}

impl ChatOutbox {
    /// Spawns the delivery task, so it must be called from within a tokio
    /// runtime. The task ends once every outbox clone is dropped and the
    /// queue has drained.
    pub fn spawn(sink: Arc<dyn ChatSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = unbounded_channel::<(ChannelTarget, Outbound)>();
        let handle = tokio::task::spawn(async move {
            while let Some((target, message)) = rx.recv().await {
                if let Err(e) = sink.send(&target, message).await {
                    tracing::warn!("Failed to send chat message: {e}");
                }
            }
        });
        (Self { tx }, handle)
    }

    pub fn post(&self, target: ChannelTarget, message: Outbound) {
        if self.tx.send((target, message)).is_err() {
            tracing::error!("Chat delivery task has stopped, dropping message.");
        }
    }
}

// Messages *************************

/// A message posted in the chat platform, as handed over by its adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundChat {
    pub channel_id: u64,
    pub author: String,
    pub text: String,
    #[serde(default)]
    pub is_bot: bool,
}
impl<S> Message<S> for InboundChat {}

// Handlers *************************

/// Relays Discord chat into the game.
pub struct ChatRelay {
    rcon: Arc<RconClient>,
    outbox: ChatOutbox,
}

impl ChatRelay {
    #[must_use]
    pub fn new(rcon: Arc<RconClient>, outbox: ChatOutbox) -> Self {
        Self { rcon, outbox }
    }
}

impl<IM, OM> MessageHandler<BridgeState, IM, OM> for ChatRelay
where
    IM: Is<InboundChat>,
    OM: 'static,
{
    fn handle_message(&mut self, state: &BridgeState, message: &IM) -> Option<Handled<OM>> {
        let inbound = try_get::<InboundChat>(message)?;
        if inbound.is_bot || state.settings.discord_channel_id != Some(inbound.channel_id) {
            return Handled::none();
        }

        let event = ChatEvent {
            speaker: inbound.author.clone(),
            message: inbound.text.clone(),
            source: ChatSource::Discord,
        };
        let commands = event.to_game_commands();
        if commands.is_empty() {
            return Handled::none();
        }

        let channel = state.settings.channel_target();
        let Some(target) = state.settings.rcon_target() else {
            self.outbox
                .post(channel, Outbound::text(RconError::NotConfigured.to_string()));
            return Handled::none();
        };

        let rcon = self.rcon.clone();
        let outbox = self.outbox.clone();
        Handled::future(async move {
            for (i, command) in commands.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(CHUNK_INTERVAL).await;
                }
                if let Err(e) = rcon.send(&target, command).await {
                    tracing::warn!("Failed to relay chat: {e}");
                    outbox.post(channel, Outbound::text(format!("Failed to send: {e}")));
                    break;
                }
            }
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_prefer_the_last_space() {
        let chunks = chunk_message("aaa bbb ccc", 8, 8);
        assert_eq!(chunks, vec!["aaa bbb", "ccc"]);
    }

    #[test]
    fn chunks_hard_cut_long_words() {
        let chunks = chunk_message("abcdefghij", 4, 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn chunks_respect_limits_and_keep_content() {
        let message = "the quick brown fox jumps over the lazy dog ".repeat(12);
        let chunks = chunk_message(&message, FIRST_CHUNK_LIMIT, CONTINUATION_LIMIT);

        assert!(chunks[0].chars().count() <= FIRST_CHUNK_LIMIT);
        for chunk in &chunks[1..] {
            assert!(chunk.chars().count() <= CONTINUATION_LIMIT);
        }

        let rebuilt: Vec<&str> = chunks.iter().flat_map(|c| c.split_whitespace()).collect();
        let original: Vec<&str> = message.split_whitespace().collect();
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn short_messages_are_one_chunk() {
        assert_eq!(chunk_message("hi", 115, 124), vec!["hi"]);
        assert!(chunk_message("   ", 115, 124).is_empty());
    }

    #[test]
    fn relayed_chat_carries_speaker_prefix_once() {
        let event = ChatEvent {
            speaker: "Bob✓".into(),
            message: "word ".repeat(40),
            source: ChatSource::Discord,
        };
        let commands = event.to_game_commands();
        assert!(commands.len() > 1);
        assert!(commands[0].starts_with("say ^7(^5Discord^7) ^7Bob: ^2word"));
        assert!(commands[1..].iter().all(|c| c.starts_with("say word")));
    }

    #[test]
    fn game_chat_for_discord() {
        let event = ChatEvent {
            speaker: "Kyle".into(),
            message: "hello".into(),
            source: ChatSource::Game,
        };
        assert_eq!(event.to_discord(), Outbound::text("**Kyle**: hello"));
    }

    #[derive(Default)]
    struct RecordingSink(std::sync::Mutex<Vec<Outbound>>);

    impl ChatSink for RecordingSink {
        fn send(
            &self,
            _: &ChannelTarget,
            message: Outbound,
        ) -> BoxFuture<'static, Result<(), ChatError>> {
            self.0.lock().unwrap().push(message);
            futures::future::ready(Ok(())).boxed()
        }
    }

    #[tokio::test]
    async fn outbox_delivers_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let (outbox, handle) = ChatOutbox::spawn(sink.clone());
        for i in 0..5 {
            outbox.post(ChannelTarget::default(), Outbound::text(i.to_string()));
        }
        drop(outbox);
        handle.await.expect("delivery task");

        let delivered = sink.0.lock().unwrap().clone();
        let expected: Vec<Outbound> = (0..5).map(|i| Outbound::text(i.to_string())).collect();
        assert_eq!(delivered, expected);
    }

    #[test]
    fn cards_become_embeds() {
        let card = Card::new("Status").field("Map", "mp/ffa3").footer("ok");
        let payload = Outbound::Card(card).webhook_payload();
        assert_eq!(payload["embeds"][0]["title"], "Status");
        assert_eq!(payload["embeds"][0]["fields"][0]["value"], "mp/ffa3");
        assert_eq!(payload["embeds"][0]["footer"]["text"], "ok");
    }
}
