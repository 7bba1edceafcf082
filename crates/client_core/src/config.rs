use std::{fs, path::Path, path::PathBuf, time::Duration};

use tracing::warn;

use crate::connection::DEFAULT_RECONNECT_DELAY;

pub const SETTINGS_FILE: &str = "teammy.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_base_url: String,
    pub hub_url: String,
    pub reconnect_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub credentials_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000/api".into(),
            hub_url: "http://localhost:5000/hubs/notifications".into(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY.as_millis() as u64,
            request_timeout_secs: 15,
            keepalive_interval_secs: 15,
            credentials_path: None,
        }
    }
}

impl Settings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }
}

/// Defaults, then `teammy.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<toml::Table>(&raw) {
            Ok(file_cfg) => apply(&mut settings, |key| file_value(&file_cfg, key)),
            Err(err) => warn!(path = %path.display(), "config: ignoring malformed settings file: {err}"),
        }
    }

    apply(&mut settings, |key| {
        env(&format!("APP__{}", key.to_ascii_uppercase()))
            .or_else(|| env(&format!("TEAMMY_{}", key.to_ascii_uppercase())))
    });

    settings
}

fn file_value(table: &toml::Table, key: &str) -> Option<String> {
    match table.get(key)? {
        toml::Value::String(v) => Some(v.clone()),
        toml::Value::Integer(v) => Some(v.to_string()),
        _ => None,
    }
}

fn apply(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("api_base_url") {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("hub_url") {
        settings.hub_url = v;
    }
    if let Some(v) = lookup("reconnect_delay_ms") {
        match v.parse() {
            Ok(parsed) => settings.reconnect_delay_ms = parsed,
            Err(_) => warn!(value = %v, "config: reconnect_delay_ms is not a number"),
        }
    }
    if let Some(v) = lookup("request_timeout_secs") {
        match v.parse() {
            Ok(parsed) => settings.request_timeout_secs = parsed,
            Err(_) => warn!(value = %v, "config: request_timeout_secs is not a number"),
        }
    }
    if let Some(v) = lookup("keepalive_interval_secs") {
        match v.parse() {
            Ok(parsed) => settings.keepalive_interval_secs = parsed,
            Err(_) => warn!(value = %v, "config: keepalive_interval_secs is not a number"),
        }
    }
    if let Some(v) = lookup("credentials_path") {
        settings.credentials_path = Some(PathBuf::from(v));
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    #[test]
    fn defaults_keep_three_second_reconnect_delay() {
        let settings = load_settings_from(Path::new("does-not-exist.toml"), |_| None);
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.reconnect_delay(), Duration::from_secs(3));
    }

    #[test]
    fn file_values_are_overridden_by_environment() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = env::temp_dir().join(format!("teammy_settings_{suffix}.toml"));
        fs::write(
            &path,
            "api_base_url = \"https://api.example.test\"\nreconnect_delay_ms = 500\n",
        )
        .expect("write settings");

        let vars = HashMap::from([
            ("TEAMMY_RECONNECT_DELAY_MS".to_string(), "750".to_string()),
            ("APP__HUB_URL".to_string(), "wss://hub.example.test/hub".to_string()),
        ]);
        let settings = load_settings_from(&path, |key| vars.get(key).cloned());

        assert_eq!(settings.api_base_url, "https://api.example.test");
        assert_eq!(settings.reconnect_delay_ms, 750);
        assert_eq!(settings.hub_url, "wss://hub.example.test/hub");

        fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn unparsable_numbers_keep_previous_value() {
        let settings = load_settings_from(Path::new("does-not-exist.toml"), |key| {
            (key == "TEAMMY_REQUEST_TIMEOUT_SECS").then(|| "soon".to_string())
        });
        assert_eq!(settings.request_timeout_secs, 15);
    }
}
