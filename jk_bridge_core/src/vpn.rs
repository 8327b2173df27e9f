use std::time::Duration;

use event_loop::Message;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::players::SessionId;

pub const VPN_API: &str = "https://vpnapi.io/api/";
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum VpnError {
    #[error("Url({0})")]
    Url(#[from] url::ParseError),
    #[error("Request({0})")]
    Request(#[from] reqwest::Error),
    #[error("Lookup failed with status {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Default, Deserialize)]
struct Reputation {
    #[serde(default)]
    security: Security,
}

#[derive(Debug, Default, Deserialize)]
struct Security {
    #[serde(default)]
    vpn: bool,
}

#[must_use]
pub fn alert(bot_name: Option<&str>, ip: &str, session_id: SessionId) -> String {
    format!(
        "sayasbot {} VPN Detected ^3(^7IP: {ip} ^3| ^7Player ID: {session_id}^7) :eyes:",
        bot_name.unwrap_or("Server")
    )
}

/// # Errors
/// If `ip` doesn't fit in a URL path
pub fn lookup_url(ip: &str, api_key: &str) -> Result<Url, VpnError> {
    let mut url = Url::parse(VPN_API)?.join(ip)?;
    url.query_pairs_mut().append_pair("key", api_key);
    Ok(url)
}

/// Whether the reputation service flags `ip` as a VPN.
///
/// # Errors
/// If the request fails or the service answers with an error status
pub async fn is_vpn(client: &reqwest::Client, ip: &str, api_key: &str) -> Result<bool, VpnError> {
    let response = client
        .get(lookup_url(ip, api_key)?)
        .timeout(LOOKUP_TIMEOUT)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(VpnError::Status(response.status()));
    }
    let reputation: Reputation = response.json().await?;
    Ok(reputation.security.vpn)
}

// Messages *************************

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnVerdict {
    pub session_id: SessionId,
    pub ip: String,
    pub is_vpn: bool,
}
impl<S> Message<S> for VpnVerdict {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_lookup_url() {
        let url = lookup_url("203.0.113.9", "abc123").expect("url");
        assert_eq!(url.as_str(), "https://vpnapi.io/api/203.0.113.9?key=abc123");
    }

    #[test]
    fn reads_vpn_flag() {
        let body = r#"{"ip":"203.0.113.9","security":{"vpn":true,"proxy":false}}"#;
        let reputation: Reputation = serde_json::from_str(body).expect("json");
        assert!(reputation.security.vpn);

        let reputation: Reputation = serde_json::from_str("{}").expect("json");
        assert!(!reputation.security.vpn);
    }

    #[test]
    fn alert_text() {
        assert_eq!(
            alert(None, "203.0.113.9", 4),
            "sayasbot Server VPN Detected ^3(^7IP: 203.0.113.9 ^3| ^7Player ID: 4^7) :eyes:"
        );
    }
}
