//! Server status from a ParaTracker JSON endpoint.

use std::{collections::HashMap, time::Duration};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::{chat::Card, console::strip_colors};

const TRACKER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Tracker URL not set.")]
    NotConfigured,
    #[error("Request({0})")]
    Request(#[from] reqwest::Error),
    #[error("Tracker answered with status {0}")]
    Status(reqwest::StatusCode),
    #[error("Tracker did not return JSON")]
    NotJson,
    #[error("Json({0})")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default, Deserialize)]
struct TrackerDocument {
    #[serde(rename = "serverInfo", default)]
    server_info: HashMap<String, Value>,
    #[serde(default)]
    info: HashMap<String, Value>,
    #[serde(default)]
    players: Vec<TrackerPlayer>,
}

#[derive(Debug, Deserialize)]
struct TrackerPlayer {
    #[serde(default)]
    name: String,
    #[serde(default)]
    score: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub name: String,
    pub map: String,
    pub max_players: Option<u32>,
    pub game: Option<String>,
    pub version: Option<String>,
    pub address: Option<String>,
    pub country: Option<String>,
    /// `(name, score)`
    pub players: Vec<(String, String)>,
}

impl ServerStatus {
    /// # Errors
    /// If `json` isn't a tracker document
    pub fn from_json(json: &str) -> Result<Self, TrackerError> {
        let document: TrackerDocument = serde_json::from_str(json)?;
        Ok(Self::from_document(document))
    }

    fn from_document(document: TrackerDocument) -> Self {
        let server = |key: &str| document.server_info.get(key).and_then(text);
        let info = |key: &str| document.info.get(key).and_then(text);

        Self {
            name: server("servername").map_or_else(|| "Unknown".into(), |n| strip_colors(&n)),
            map: server("mapname").unwrap_or_else(|| "Unknown".into()),
            max_players: server("sv_maxclients").and_then(|m| m.parse().ok()),
            game: info("gamename"),
            version: info("Lugormod_Version"),
            address: server("serverIPAddress"),
            country: server("geoIPcountryCode"),
            players: document
                .players
                .iter()
                .map(|p| {
                    let score = text(&p.score).unwrap_or_else(|| "0".into());
                    (strip_colors(&p.name).trim().to_owned(), score)
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn to_card(&self) -> Card {
        let players = match self.max_players {
            Some(max) => format!("{}/{max}", self.players.len()),
            None => self.players.len().to_string(),
        };

        let mut card = Card::new(&self.name)
            .field("Map", &self.map)
            .field("Players", players);
        if let Some(game) = &self.game {
            let game = match &self.version {
                Some(version) => format!("{game} {version}"),
                None => game.clone(),
            };
            card = card.field("Mod", game);
        }
        if let Some(address) = &self.address {
            card = card.field("Address", address);
        }
        if !self.players.is_empty() {
            let table = self
                .players
                .iter()
                .map(|(name, score)| format!("{name} ({score})"))
                .collect::<Vec<_>>()
                .join("\n");
            card = card.wide_field("Online", table);
        }
        match &self.country {
            Some(country) => card.footer(format!("Location: {country}")),
            None => card,
        }
    }
}

/// # Errors
/// If the request fails, the tracker errors, or the reply isn't a tracker
/// document
pub async fn fetch_status(client: &reqwest::Client, url: &str) -> Result<ServerStatus, TrackerError> {
    let response = client.get(url).timeout(TRACKER_TIMEOUT).send().await?;
    if !response.status().is_success() {
        return Err(TrackerError::Status(response.status()));
    }
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("json"));
    if !is_json {
        return Err(TrackerError::NotJson);
    }
    ServerStatus::from_json(&response.text().await?)
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
