use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use dirs::home_dir;
use serde::Deserialize;

use crate::error::ConfigErr;
use crate::flags::ELEPHIE_RELAY_URL;
use crate::flags::ELEPHIE_STREAM_IDLE_TIMEOUT_MS;
use crate::flags::ELEPHIE_UPSTREAM_URL;
use crate::history_window::DEFAULT_HISTORY_CHAR_BUDGET;

const CONFIG_TOML_FILE: &str = "config.toml";

/// Upper bound on generated tokens requested from the completion service.
const DEFAULT_MAX_TOKENS: u32 = 300;

const DEFAULT_REVERT_GRACE_MS: u64 = 500;

/// Settings of the relay: where the completion service lives and which
/// generation parameters accompany every request.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Full URL of the upstream chat-completions endpoint.
    pub endpoint_url: String,
    /// Content of the system message prepended to every request.
    pub system_prompt: String,
    pub max_tokens: u32,
    /// Sent as the `model` field when set.
    pub model: Option<String>,
    /// Character budget for the forwarded history.
    pub history_char_budget: usize,
    /// Maximum silence between upstream events before the relay gives up.
    pub stream_idle_timeout_ms: Option<u64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoint_url: ELEPHIE_UPSTREAM_URL.to_string(),
            system_prompt: String::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
            model: None,
            history_char_budget: DEFAULT_HISTORY_CHAR_BUDGET,
            stream_idle_timeout_ms: None,
        }
    }
}

impl RelayConfig {
    pub fn stream_idle_timeout(&self) -> Duration {
        self.stream_idle_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(*ELEPHIE_STREAM_IDLE_TIMEOUT_MS)
    }
}

/// Settings of the chat client.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the relay serving `/api/chat`.
    pub relay_url: String,
    /// How long `revert` waits for an in-flight reply to observe
    /// cancellation before truncating.
    pub revert_grace_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: ELEPHIE_RELAY_URL.to_string(),
            revert_grace_ms: DEFAULT_REVERT_GRACE_MS,
        }
    }
}

impl ClientConfig {
    pub fn revert_grace(&self) -> Duration {
        Duration::from_millis(self.revert_grace_ms)
    }
}

/// Contents of `~/.elephie/config.toml`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub relay: RelayConfig,
    pub client: ClientConfig,
}

/// Optional overrides for user configuration (e.g., from CLI flags).
#[derive(Default, Debug, Clone)]
pub struct ConfigOverrides {
    pub endpoint_url: Option<String>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub model: Option<String>,
    pub relay_url: Option<String>,
}

impl Config {
    /// Loads `config.toml` from [`elephie_home`] and applies `overrides`
    /// (highest precedence). A missing file yields the defaults.
    pub fn load_with_overrides(overrides: ConfigOverrides) -> Result<Self, ConfigErr> {
        let path = elephie_home()?.join(CONFIG_TOML_FILE);
        Self::load_from_path(&path, overrides)
    }

    pub fn load_from_path(path: &Path, overrides: ConfigOverrides) -> Result<Self, ConfigErr> {
        let mut cfg = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str::<Config>(&contents).map_err(|source| {
                ConfigErr::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config at {}, using defaults", path.display());
                Config::default()
            }
            Err(source) => {
                return Err(ConfigErr::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        cfg.apply_overrides(overrides);
        Ok(cfg)
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        let ConfigOverrides {
            endpoint_url,
            system_prompt,
            max_tokens,
            model,
            relay_url,
        } = overrides;

        if let Some(endpoint_url) = endpoint_url {
            self.relay.endpoint_url = endpoint_url;
        }
        if let Some(system_prompt) = system_prompt {
            self.relay.system_prompt = system_prompt;
        }
        if let Some(max_tokens) = max_tokens {
            self.relay.max_tokens = max_tokens;
        }
        if model.is_some() {
            self.relay.model = model;
        }
        if let Some(relay_url) = relay_url {
            self.client.relay_url = relay_url;
        }
    }
}

/// Returns the configuration directory: `$ELEPHIE_HOME` when set, otherwise
/// `~/.elephie`. Does not verify that the directory exists.
pub fn elephie_home() -> Result<PathBuf, ConfigErr> {
    if let Ok(val) = std::env::var("ELEPHIE_HOME") {
        if !val.is_empty() {
            return Ok(PathBuf::from(val));
        }
    }

    let mut p = home_dir().ok_or(ConfigErr::NoHomeDir)?;
    p.push(".elephie");
    Ok(p)
}
