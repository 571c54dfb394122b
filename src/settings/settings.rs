use crate::http::ApiConfig;
use crate::logger::LogConfig;
use crate::realtime::{HeartbeatPolicy, RealtimeConfig};
use anyhow::{Result, anyhow};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub api: Api,
    pub realtime: Realtime,
    pub session: Session,
    pub log: Log,
}

#[derive(Debug, Deserialize)]
pub struct Api {
    pub base_url: String,
    pub timeout_ms: u64,
    pub refresh_path: String,
}

#[derive(Debug, Deserialize)]
pub struct Realtime {
    pub url: String,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: Option<u64>, // unset: pings are keep-alive only
    pub warning_delay_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct Session {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct Log {
    pub filter: String,
}

#[cfg(debug_assertions)]
const SETTINGS_PATH: &str = "settings/dev.toml";
#[cfg(not(debug_assertions))]
const SETTINGS_PATH: &str = "settings/release.toml";

const ENV_PREFIX: &str = "PORTAL";

pub fn parse_settings(path: Option<&str>) -> Result<Settings> {
    let path = path.unwrap_or(SETTINGS_PATH);

    let settings: Settings = Config::builder()
        .add_source(File::with_name(path))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .map_err(|e| anyhow!(e))?
        .try_deserialize()
        .map_err(|e| anyhow!(e))?;

    Ok(settings)
}

impl From<&Api> for ApiConfig {
    fn from(api: &Api) -> Self {
        ApiConfig {
            base_url: api.base_url.clone(),
            timeout: Duration::from_millis(api.timeout_ms),
            refresh_path: api.refresh_path.clone(),
        }
    }
}

impl From<&Realtime> for RealtimeConfig {
    fn from(realtime: &Realtime) -> Self {
        let heartbeat = match realtime.heartbeat_timeout_ms {
            Some(ms) => HeartbeatPolicy::ReconnectOnMissedPong {
                timeout: Duration::from_millis(ms),
            },
            None => HeartbeatPolicy::KeepAlive,
        };
        RealtimeConfig {
            url: realtime.url.clone(),
            reconnect_interval: Duration::from_millis(realtime.reconnect_interval_ms),
            max_reconnect_attempts: realtime.max_reconnect_attempts,
            heartbeat_interval: Duration::from_millis(realtime.heartbeat_interval_ms),
            heartbeat,
            warning_delay: Duration::from_millis(realtime.warning_delay_ms),
        }
    }
}

impl From<&Log> for LogConfig {
    fn from(log: &Log) -> Self {
        LogConfig::new(log.filter.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[api]
base_url = "https://gateway.test/api/v1"
timeout_ms = 2500
refresh_path = "/auth/refresh"

[realtime]
url = "wss://gateway.test/ws"
reconnect_interval_ms = 3000
max_reconnect_attempts = 5
heartbeat_interval_ms = 30000
heartbeat_timeout_ms = 10000
warning_delay_ms = 3000

[session]
path = "/tmp/portal-session.json"

[log]
filter = "debug"
"#;

    #[test]
    fn converts_into_runtime_configs() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = parse_settings(file.path().to_str()).unwrap();
        let api = ApiConfig::from(&settings.api);
        assert_eq!(api.timeout, Duration::from_millis(2500));

        let realtime = RealtimeConfig::from(&settings.realtime);
        assert_eq!(realtime.max_reconnect_attempts, 5);
        assert_eq!(
            realtime.heartbeat,
            HeartbeatPolicy::ReconnectOnMissedPong {
                timeout: Duration::from_secs(10)
            }
        );
        assert_eq!(LogConfig::from(&settings.log).filter, "debug");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(parse_settings(Some("settings/does-not-exist.toml")).is_err());
    }
}
