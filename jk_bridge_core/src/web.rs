//! Local HTTP API used by the chat-platform adapter to post inbound chat and
//! run commands. Requests are forwarded onto the event loop as messages.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::mpsc::{channel, unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::{
    chat::InboundChat,
    commands::{BridgeCommand, CommandReply, CommandRequest},
    players::SessionId,
};

/// How long a request waits for the event loop to answer.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct WebState {
    chat: UnboundedSender<InboundChat>,
    commands: UnboundedSender<CommandRequest>,
    token: Option<Arc<str>>,
}

impl WebState {
    /// The receivers are meant to be added to the event loop as sources.
    #[must_use]
    pub fn new(
        token: Option<String>,
    ) -> (
        Self,
        UnboundedReceiver<InboundChat>,
        UnboundedReceiver<CommandRequest>,
    ) {
        let (chat, chat_rx) = unbounded_channel();
        let (commands, commands_rx) = unbounded_channel();
        let state = Self {
            chat,
            commands,
            token: token.filter(|t| !t.is_empty()).map(Into::into),
        };
        (state, chat_rx, commands_rx)
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(token) = &self.token else {
            return true;
        };
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|given| given.trim() == token.as_ref())
    }

    async fn run(&self, command: BridgeCommand) -> Result<Response, ApiError> {
        let (reply, mut replies) = channel(1);
        self.commands
            .send(CommandRequest { command, reply })
            .map_err(|_| ApiError::unavailable())?;

        match tokio::time::timeout(REPLY_TIMEOUT, replies.recv()).await {
            Ok(Some(reply)) => Ok(reply_response(reply)),
            Ok(None) => Err(ApiError::unavailable()),
            Err(_) => Err(ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "Timed out waiting for a reply.",
            )),
        }
    }
}

fn reply_response(reply: CommandReply) -> Response {
    let status = match &reply {
        CommandReply::NotFound { .. } => StatusCode::NOT_FOUND,
        CommandReply::Failed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::OK,
    };
    (status, Json(reply)).into_response()
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn unavailable() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "Bridge is shutting down.")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::debug!("API request failed ({}): {}", self.status, self.message);
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

// Routes *************************

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/api/chat", post(post_chat))
        .route("/api/rcon", post(post_rcon))
        .route("/api/status", get(get_status))
        .route("/api/players", get(get_players))
        .route("/api/players/:id", get(get_player))
        .route("/api/account/:name", get(get_account))
        .route("/api/settings/:key", get(get_setting).put(put_setting))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}

/// Serves the API on localhost until the task is dropped.
pub async fn serve(port: u16, state: WebState) {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    if state.token.is_none() {
        tracing::warn!("No api_token set, the HTTP API accepts any local request.");
    }

    match axum::Server::try_bind(&addr) {
        Ok(builder) => {
            tracing::info!("Starting HTTP API on http://{addr}");
            if let Err(e) = builder.serve(router(state).into_make_service()).await {
                tracing::error!("HTTP API stopped: {e}");
            }
        }
        Err(e) => tracing::error!("Couldn't bind HTTP API to {addr}: {e}"),
    }
}

async fn require_token<B>(
    State(state): State<WebState>,
    request: Request<B>,
    next: Next<B>,
) -> Result<Response, ApiError> {
    if state.authorized(request.headers()) {
        Ok(next.run(request).await)
    } else {
        Err(ApiError::new(StatusCode::UNAUTHORIZED, "Missing or wrong API token."))
    }
}

async fn post_chat(
    State(state): State<WebState>,
    Json(chat): Json<InboundChat>,
) -> Result<StatusCode, ApiError> {
    state.chat.send(chat).map_err(|_| ApiError::unavailable())?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct RconBody {
    command: String,
}

async fn post_rcon(
    State(state): State<WebState>,
    Json(body): Json<RconBody>,
) -> Result<Response, ApiError> {
    if body.command.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Empty command."));
    }
    state.run(BridgeCommand::Rcon(body.command)).await
}

async fn get_status(State(state): State<WebState>) -> Result<Response, ApiError> {
    state.run(BridgeCommand::Status).await
}

async fn get_players(State(state): State<WebState>) -> Result<Response, ApiError> {
    state.run(BridgeCommand::Players).await
}

async fn get_player(
    State(state): State<WebState>,
    Path(id): Path<SessionId>,
) -> Result<Response, ApiError> {
    state.run(BridgeCommand::Player(id)).await
}

async fn get_account(
    State(state): State<WebState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    state.run(BridgeCommand::Account(name)).await
}

async fn get_setting(
    State(state): State<WebState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    state.run(BridgeCommand::GetSetting(key)).await
}

#[derive(Debug, Deserialize)]
struct SettingBody {
    #[serde(default)]
    value: String,
}

async fn put_setting(
    State(state): State<WebState>,
    Path(key): Path<String>,
    Json(body): Json<SettingBody>,
) -> Result<Response, ApiError> {
    state
        .run(BridgeCommand::SetSetting {
            key,
            value: body.value,
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Binds the router to an ephemeral port and answers every command with
    /// its debug text.
    fn spawn(token: Option<&str>) -> (String, UnboundedReceiver<InboundChat>) {
        let (state, chat_rx, mut commands_rx) = WebState::new(token.map(ToOwned::to_owned));
        let server = axum::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0)))
            .serve(router(state).into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);

        tokio::spawn(async move {
            while let Some(request) = commands_rx.recv().await {
                let reply = match request.command {
                    BridgeCommand::Player(7) => CommandReply::NotFound {
                        text: "No player in slot 7.".into(),
                    },
                    command => CommandReply::Text {
                        text: format!("{command:?}"),
                    },
                };
                request.reply.try_send(reply).expect("reply");
            }
        });

        (format!("http://{addr}"), chat_rx)
    }

    #[tokio::test]
    async fn rejects_missing_or_wrong_token() {
        let (base, _chat) = spawn(Some("secret"));
        let client = reqwest::Client::new();

        let missing = client.get(format!("{base}/api/players")).send().await.expect("request");
        assert_eq!(missing.status(), reqwest::StatusCode::UNAUTHORIZED);

        let wrong = client
            .get(format!("{base}/api/players"))
            .bearer_auth("guess")
            .send()
            .await
            .expect("request");
        assert_eq!(wrong.status(), reqwest::StatusCode::UNAUTHORIZED);

        let right = client
            .get(format!("{base}/api/players"))
            .bearer_auth("secret")
            .send()
            .await
            .expect("request");
        assert_eq!(right.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn forwards_commands_and_maps_replies() {
        let (base, _chat) = spawn(None);
        let client = reqwest::Client::new();

        let reply: serde_json::Value = client
            .post(format!("{base}/api/rcon"))
            .json(&serde_json::json!({ "command": "status" }))
            .send()
            .await
            .expect("request")
            .json()
            .await
            .expect("json");
        assert_eq!(reply["type"], "text");
        assert_eq!(reply["text"], "Rcon(\"status\")");

        let missing = client.get(format!("{base}/api/players/7")).send().await.expect("request");
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn accepts_inbound_chat() {
        let (base, mut chat) = spawn(None);
        let response = reqwest::Client::new()
            .post(format!("{base}/api/chat"))
            .json(&serde_json::json!({
                "channelId": 42,
                "author": "Kyle",
                "text": "hello there"
            }))
            .send()
            .await
            .expect("request");

        assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
        let inbound = chat.recv().await.expect("forwarded");
        assert_eq!(inbound.author, "Kyle");
        assert!(!inbound.is_bot);
    }
}
