use std::{collections::HashMap, fs, path::Path, str::FromStr, time::Duration};

use anyhow::{anyhow, bail, Context};
use url::Url;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

/// What `release()` does with the local session when the release call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleasePolicy {
    #[default]
    ClearOnSuccess,
    ClearAlways,
}

impl FromStr for ReleasePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clear_on_success" => Ok(ReleasePolicy::ClearOnSuccess),
            "clear_always" => Ok(ReleasePolicy::ClearAlways),
            other => bail!("unknown release policy '{other}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub api_url: String,
    pub auth_path: String,
    pub booking_path: String,
    pub events_path: String,
    pub feed_path: String,
    pub lock_duration: Duration,
    pub reconnect_delay: Duration,
    pub heartbeat_outgoing: Duration,
    pub heartbeat_incoming: Duration,
    pub release_policy: ReleasePolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".into(),
            auth_path: "/api/auth".into(),
            booking_path: "/api/bookings".into(),
            events_path: "/api/events".into(),
            feed_path: "/ws/websocket".into(),
            lock_duration: Duration::from_secs(600),
            reconnect_delay: Duration::from_millis(5000),
            heartbeat_outgoing: Duration::from_millis(4000),
            heartbeat_incoming: Duration::from_millis(4000),
            release_policy: ReleasePolicy::ClearOnSuccess,
        }
    }
}

impl Settings {
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_url.trim_end_matches('/'), path)
    }

    pub fn feed_url(&self) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.api_url)
            .with_context(|| format!("invalid api url '{}'", self.api_url))?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => bail!("api url must start with http:// or https://, got {other}://"),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive feed url from '{}'", self.api_url))?;
        let path = format!("{}{}", url.path().trim_end_matches('/'), self.feed_path);
        url.set_path(&path);
        Ok(url)
    }

    pub fn apply_file_overrides(&mut self, file_cfg: &HashMap<String, String>) -> anyhow::Result<()> {
        for (key, value) in file_cfg {
            self.apply_override(key, value)
                .with_context(|| format!("invalid value for '{key}' in settings file"))?;
        }
        Ok(())
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        const ENV_KEYS: &[(&str, &str)] = &[
            ("EMS_API_URL", "api_url"),
            ("APP__API_URL", "api_url"),
            ("APP__BOOKING_PATH", "booking_path"),
            ("APP__EVENTS_PATH", "events_path"),
            ("APP__FEED_PATH", "feed_path"),
            ("APP__LOCK_DURATION_SECS", "lock_duration_secs"),
            ("APP__RECONNECT_DELAY_MS", "reconnect_delay_ms"),
            ("APP__HEARTBEAT_MS", "heartbeat_ms"),
            ("APP__RELEASE_POLICY", "release_policy"),
        ];

        for (var, key) in ENV_KEYS {
            if let Some(value) = lookup(var) {
                self.apply_override(key, &value)
                    .with_context(|| format!("invalid value for {var}"))?;
            }
        }
        Ok(())
    }

    fn apply_override(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "api_url" => self.api_url = value.trim().to_string(),
            "auth_path" => self.auth_path = value.trim().to_string(),
            "booking_path" => self.booking_path = value.trim().to_string(),
            "events_path" => self.events_path = value.trim().to_string(),
            "feed_path" => self.feed_path = value.trim().to_string(),
            "lock_duration_secs" => {
                self.lock_duration = Duration::from_secs(value.trim().parse()?);
            }
            "reconnect_delay_ms" => {
                self.reconnect_delay = Duration::from_millis(value.trim().parse()?);
            }
            "heartbeat_ms" => {
                let interval = Duration::from_millis(value.trim().parse()?);
                self.heartbeat_outgoing = interval;
                self.heartbeat_incoming = interval;
            }
            "release_policy" => self.release_policy = value.parse()?,
            other => tracing::warn!(key = other, "config: ignoring unknown settings key"),
        }
        Ok(())
    }
}

pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        let file_cfg = parse_settings_file(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        settings.apply_file_overrides(&file_cfg)?;
    }

    settings.apply_env_overrides(|var| std::env::var(var).ok())?;
    Ok(settings)
}

fn parse_settings_file(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    let table: toml::Table = toml::from_str(raw)?;
    let mut file_cfg = HashMap::new();
    for (key, value) in table {
        let value = match value {
            toml::Value::String(s) => s,
            toml::Value::Integer(i) => i.to_string(),
            other => bail!("unsupported value for '{key}': {other}"),
        };
        file_cfg.insert(key, value);
    }
    Ok(file_cfg)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
