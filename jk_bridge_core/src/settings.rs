use std::{
    fmt::Display,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use atomic_write_file::AtomicWriteFile;
use directories_next::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    chat::ChannelTarget, console::classify::Markers, console::tailer::LogPath, rcon::RconTarget,
};

pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Every key understood by [`Settings::get`] and [`Settings::set`].
pub const KEYS: &[&str] = &[
    "log_base_path",
    "log_file_name",
    "discord_channel_id",
    "discord_webhook_url",
    "rcon_host",
    "rcon_port",
    "rcon_password",
    "join_disconnect_enabled",
    "vpn_check_enabled",
    "vpn_api_key",
    "bot_name",
    "tracker_url",
    "random_chat_path",
    "placeholder_prefixes",
    "poll_command",
    "web_port",
    "api_token",
];

#[derive(Debug, Clone, Copy)]
pub struct AppDetails<'a> {
    pub qualifier: &'a str,
    pub organization: &'a str,
    pub application: &'a str,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("No valid home directory found")]
    NoValidHome,
    #[error("IO({0})")]
    IO(#[from] io::Error),
    #[error("Yaml({0})")]
    Yaml(#[from] serde_yaml::Error),
    #[error("No config file path is set")]
    NoConfigSet,
    #[error("Unknown setting `{0}`")]
    UnknownKey(String),
    #[error("Invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PollCommand {
    Status,
    Playerlist,
}

impl PollCommand {
    #[must_use]
    pub const fn command(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Playerlist => "playerlist",
        }
    }
}

impl Display for PollCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command())
    }
}

impl FromStr for PollCommand {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "status" => Ok(Self::Status),
            "playerlist" => Ok(Self::Playerlist),
            _ => Err(()),
        }
    }
}

#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    pub log_base_path: Option<PathBuf>,
    /// File name inside `log_base_path`. May contain chrono specifiers such
    /// as `%Y-%m-%d` for servers that write one log per day.
    pub log_file_name: String,

    pub discord_channel_id: Option<u64>,
    pub discord_webhook_url: Option<String>,

    pub rcon_host: Option<String>,
    pub rcon_port: Option<u16>,
    pub rcon_password: Option<String>,

    pub join_disconnect_enabled: bool,
    pub vpn_check_enabled: bool,
    pub vpn_api_key: Option<String>,

    pub bot_name: Option<String>,
    pub tracker_url: Option<String>,
    pub random_chat_path: Option<PathBuf>,

    pub placeholder_prefixes: Vec<String>,
    pub poll_command: PollCommand,

    pub web_port: u16,
    pub api_token: Option<String>,

    pub markers: Markers,
}

#[allow(dead_code)]
impl Settings {
    /// Attempts to locate the default file location for the settings config file
    ///
    /// # Errors
    /// If an appropriate location could not be found
    pub fn default_file_location(app_details: AppDetails) -> Result<PathBuf, SettingsError> {
        Ok(Self::locate_config_directory(app_details)?.join(CONFIG_FILE_NAME))
    }

    /// Attempts to load the [Settings] at the specified location.
    /// If it cannot be found, new [Settings] will be
    /// created at that location.
    ///
    /// # Errors
    /// * `IO` - If the file could not be loaded from some reason
    /// * `Yaml` - If the contents of the file were not valid
    pub fn load_or_create(config_file_path: PathBuf) -> Result<Self, SettingsError> {
        match Self::load_from(config_file_path.clone()) {
            Ok(settings) => Ok(settings),
            Err(SettingsError::IO(e)) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!("Could not locate {config_file_path:?}, creating new file.");
                Ok(Self {
                    config_path: Some(config_file_path),
                    ..Default::default()
                })
            }
            Err(e) => Err(e),
        }
    }

    /// # Errors
    /// If the file could not be read or did not contain valid settings
    pub fn load_from(config_file_path: PathBuf) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(&config_file_path)?;
        let mut settings = serde_yaml::from_str::<Self>(&contents)?;
        tracing::debug!("Successfully loaded {config_file_path:?}");
        settings.config_path = Some(config_file_path);
        Ok(settings)
    }

    /// Attempt to save the settings back to the loaded configuration file
    ///
    /// # Errors
    /// If the settings could not be serialized or written back to disk
    pub fn save(&self) -> Result<(), SettingsError> {
        let config_path = self
            .config_path
            .as_ref()
            .ok_or(SettingsError::NoConfigSet)?;

        let mut file = AtomicWriteFile::open(config_path)?;
        write!(&mut file, "{}", serde_yaml::to_string(self)?)?;
        file.commit()?;

        Ok(())
    }

    pub fn save_ok(&self) {
        match self.save() {
            Ok(()) => tracing::debug!("Successfully saved settings to {:?}", self.config_path),
            Err(e) => tracing::error!("Failed to save settings to {:?}: {e}", self.config_path),
        }
    }

    /// Attempts to find (and create) a directory to be used for configuration
    /// files
    ///
    /// # Errors
    /// If a valid config file directory could not be found (usually because a
    /// valid home directory was not found)
    pub fn locate_config_directory(app_details: AppDetails) -> Result<PathBuf, SettingsError> {
        let dirs = ProjectDirs::from(
            app_details.qualifier,
            app_details.organization,
            app_details.application,
        )
        .ok_or(SettingsError::NoValidHome)?;
        let dir = dirs.config_dir();
        std::fs::create_dir_all(dir)?;
        Ok(PathBuf::from(dir))
    }

    // **** Derived views ****

    /// `None` unless host, port and password are all present.
    #[must_use]
    pub fn rcon_target(&self) -> Option<RconTarget> {
        let host = self.rcon_host.as_deref().filter(|h| !h.is_empty())?;
        let port = self.rcon_port.filter(|&p| p != 0)?;
        let password = self.rcon_password.as_deref().filter(|p| !p.is_empty())?;
        Some(RconTarget {
            host: host.to_owned(),
            port,
            password: password.to_owned(),
        })
    }

    #[must_use]
    pub fn log_path(&self) -> Option<LogPath> {
        self.log_base_path
            .as_ref()
            .map(|base| LogPath::new(base.clone(), self.log_file_name.clone()))
    }

    #[must_use]
    pub fn bot_name(&self) -> Option<&str> {
        self.bot_name.as_deref().filter(|n| !n.is_empty())
    }

    #[must_use]
    pub fn channel_target(&self) -> ChannelTarget {
        ChannelTarget {
            channel_id: self.discord_channel_id,
            webhook_url: self.discord_webhook_url.clone(),
        }
    }

    #[must_use]
    pub fn vpn_api_key(&self) -> Option<&str> {
        self.vpn_api_key.as_deref().filter(|k| !k.is_empty())
    }

    // **** Key-value access ****

    /// Reads a setting as text. Secrets are reported as `set` rather than
    /// echoed back.
    ///
    /// # Errors
    /// If `key` is not one of [`KEYS`]
    pub fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        fn secret(value: Option<&String>) -> Option<String> {
            value.filter(|v| !v.is_empty()).map(|_| "set".to_owned())
        }

        let value = match key {
            "log_base_path" => self.log_base_path.as_deref().map(path_string),
            "log_file_name" => Some(self.log_file_name.clone()),
            "discord_channel_id" => self.discord_channel_id.map(|id| id.to_string()),
            "discord_webhook_url" => secret(self.discord_webhook_url.as_ref()),
            "rcon_host" => self.rcon_host.clone(),
            "rcon_port" => self.rcon_port.map(|p| p.to_string()),
            "rcon_password" => secret(self.rcon_password.as_ref()),
            "join_disconnect_enabled" => Some(self.join_disconnect_enabled.to_string()),
            "vpn_check_enabled" => Some(self.vpn_check_enabled.to_string()),
            "vpn_api_key" => secret(self.vpn_api_key.as_ref()),
            "bot_name" => self.bot_name.clone(),
            "tracker_url" => self.tracker_url.clone(),
            "random_chat_path" => self.random_chat_path.as_deref().map(path_string),
            "placeholder_prefixes" => Some(self.placeholder_prefixes.join(",")),
            "poll_command" => Some(self.poll_command.to_string()),
            "web_port" => Some(self.web_port.to_string()),
            "api_token" => secret(self.api_token.as_ref()),
            _ => return Err(SettingsError::UnknownKey(key.to_owned())),
        };
        Ok(value)
    }

    /// Updates a setting from text. An empty value (or `none`) clears
    /// optional settings. Boolean settings also accept `toggle`.
    ///
    /// # Errors
    /// If `key` is unknown or `value` can't be parsed for it
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let invalid = || SettingsError::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
        };
        let trimmed = value.trim();
        let cleared = trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none");
        let text = || (!cleared).then(|| trimmed.to_owned());

        match key {
            "log_base_path" => self.log_base_path = text().map(PathBuf::from),
            "log_file_name" => {
                if cleared {
                    return Err(invalid());
                }
                self.log_file_name = trimmed.to_owned();
            }
            "discord_channel_id" => {
                self.discord_channel_id = parse_optional(text()).map_err(|()| invalid())?;
            }
            "discord_webhook_url" => self.discord_webhook_url = text(),
            "rcon_host" => self.rcon_host = text(),
            "rcon_port" => self.rcon_port = parse_optional(text()).map_err(|()| invalid())?,
            "rcon_password" => self.rcon_password = text(),
            "join_disconnect_enabled" => {
                self.join_disconnect_enabled =
                    parse_flag(trimmed, self.join_disconnect_enabled).ok_or_else(invalid)?;
            }
            "vpn_check_enabled" => {
                self.vpn_check_enabled =
                    parse_flag(trimmed, self.vpn_check_enabled).ok_or_else(invalid)?;
            }
            "vpn_api_key" => self.vpn_api_key = text(),
            "bot_name" => self.bot_name = text(),
            "tracker_url" => {
                if let Some(url) = text() {
                    url::Url::parse(&url).map_err(|_| invalid())?;
                }
                self.tracker_url = text();
            }
            "random_chat_path" => self.random_chat_path = text().map(PathBuf::from),
            "placeholder_prefixes" => {
                self.placeholder_prefixes = trimmed
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(ToOwned::to_owned)
                    .collect();
            }
            "poll_command" => self.poll_command = trimmed.parse().map_err(|()| invalid())?,
            "web_port" => self.web_port = trimmed.parse().map_err(|_| invalid())?,
            "api_token" => self.api_token = text(),
            _ => return Err(SettingsError::UnknownKey(key.to_owned())),
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: None,
            log_base_path: None,
            log_file_name: "qconsole.log".into(),
            discord_channel_id: None,
            discord_webhook_url: None,
            rcon_host: None,
            rcon_port: None,
            rcon_password: None,
            join_disconnect_enabled: true,
            vpn_check_enabled: false,
            vpn_api_key: None,
            bot_name: None,
            tracker_url: None,
            random_chat_path: None,
            placeholder_prefixes: vec!["Padawan".into()],
            poll_command: PollCommand::Status,
            web_port: 3622,
            api_token: None,
            markers: Markers::default(),
        }
    }
}

// Useful

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_optional<T: FromStr>(value: Option<String>) -> Result<Option<T>, ()> {
    value.map(|v| v.parse().map_err(|_| ())).transpose()
}

fn parse_flag(value: &str, current: bool) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "enabled" | "1" => Some(true),
        "false" | "off" | "no" | "disabled" | "0" => Some(false),
        "toggle" => Some(!current),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rcon_target_requires_every_field() {
        let mut settings = Settings::default();
        assert!(settings.rcon_target().is_none());

        settings.set("rcon_host", "127.0.0.1").expect("host");
        settings.set("rcon_port", "29070").expect("port");
        assert!(settings.rcon_target().is_none());

        settings.set("rcon_password", "hunter2").expect("password");
        let target = settings.rcon_target().expect("complete target");
        assert_eq!(target.port, 29070);
        assert_eq!(target.password, "hunter2");
    }

    #[test]
    fn secrets_are_not_echoed() {
        let mut settings = Settings::default();
        settings.set("rcon_password", "hunter2").expect("set");
        assert_eq!(settings.get("rcon_password").expect("get"), Some("set".into()));

        settings.set("rcon_password", "").expect("clear");
        assert_eq!(settings.get("rcon_password").expect("get"), None);
    }

    #[test]
    fn flags_accept_toggle() {
        let mut settings = Settings::default();
        assert!(!settings.vpn_check_enabled);
        settings.set("vpn_check_enabled", "toggle").expect("toggle");
        assert!(settings.vpn_check_enabled);
        settings.set("vpn_check_enabled", "off").expect("off");
        assert!(!settings.vpn_check_enabled);
        assert!(settings.set("vpn_check_enabled", "maybe").is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut settings = Settings::default();
        assert!(matches!(
            settings.set("custom_emoji", "x"),
            Err(SettingsError::UnknownKey(_))
        ));
        assert!(matches!(
            settings.get("custom_emoji"),
            Err(SettingsError::UnknownKey(_))
        ));
    }

    #[test]
    fn every_listed_key_is_readable() {
        let settings = Settings::default();
        for key in KEYS {
            assert!(settings.get(key).is_ok(), "{key}");
        }
    }

    #[test]
    fn placeholder_prefixes_are_comma_separated() {
        let mut settings = Settings::default();
        settings
            .set("placeholder_prefixes", "Padawan, Player ,")
            .expect("set");
        assert_eq!(settings.placeholder_prefixes, vec!["Padawan", "Player"]);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut settings = Settings::load_or_create(path.clone()).expect("create");
        settings.set("bot_name", "Jedi Master").expect("set");
        settings.set("poll_command", "playerlist").expect("set");
        settings.save().expect("save");

        let loaded = Settings::load_from(path).expect("load");
        assert_eq!(loaded.bot_name(), Some("Jedi Master"));
        assert_eq!(loaded.poll_command, PollCommand::Playerlist);
        assert!(loaded.join_disconnect_enabled);
    }
}
