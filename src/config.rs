//! Layered configuration: an optional `TSPI_CONFIG_JSON` environment blob
//! overrides an optional `config.json` file on disk, which overrides
//! compiled-in defaults. Every struct here is `#[serde(default)]` so a
//! partial override document only needs to name the fields it changes.

use log::{error, LevelFilter};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

const CONFIG_ENV_VAR: &str = "TSPI_CONFIG_JSON";
const CONFIG_FILE_PATH: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub host: IpAddr,
    #[serde(with = "level_filter_serde")]
    pub logging: LevelFilter,
    pub broker: BrokerConfig,
    pub archiver: ArchiverConfig,
    pub player: PlayerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4890,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            logging: LevelFilter::Info,
            broker: BrokerConfig::default(),
            archiver: ArchiverConfig::default(),
            player: PlayerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub subject_prefix: String,
    pub stream_name: String,
    pub replay_stream_name: String,
    pub connect_deadline_ms: u64,
    pub publish_timeout_ms: u64,
    pub pull_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subject_prefix: "tspi".to_string(),
            stream_name: "TSPI".to_string(),
            replay_stream_name: "TSPI_REPLAY".to_string(),
            connect_deadline_ms: 2_000,
            publish_timeout_ms: 2_000,
            pull_timeout_ms: 750,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverConfig {
    pub batch_size: usize,
    pub database_file: String,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            database_file: "data/tspi.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub scrub_history_size: usize,
    pub metrics_interval_ms: u64,
    pub rate_min: f64,
    pub rate_max: f64,
    pub default_rate: f64,
    pub default_units: String,
    pub default_marker_color: String,
    pub smooth_center: f64,
    pub smooth_zoom: f64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            scrub_history_size: 600,
            metrics_interval_ms: 1_000,
            rate_min: 0.01,
            rate_max: 4.0,
            default_rate: 1.0,
            default_units: "metric".to_string(),
            default_marker_color: "#00ff00".to_string(),
            smooth_center: 0.85,
            smooth_zoom: 0.85,
        }
    }
}

impl From<&PlayerConfig> for crate::player::PlayerConfig {
    fn from(config: &PlayerConfig) -> Self {
        crate::player::PlayerConfig {
            scrub_history_size: config.scrub_history_size,
            rate_min: config.rate_min,
            rate_max: config.rate_max,
            default_rate: config.default_rate,
            default_units: config.default_units.clone(),
            default_marker_color: config.default_marker_color.clone(),
            smooth_center: config.smooth_center,
            smooth_zoom: config.smooth_zoom,
        }
    }
}

mod level_filter_serde {
    use log::LevelFilter;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(value: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<LevelFilter, D::Error> {
        let raw = String::deserialize(deserializer)?;
        LevelFilter::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

/// Loads configuration, preferring `TSPI_CONFIG_JSON` over `config.json`
/// over the compiled default. A malformed override at either layer is
/// reported to stderr and falls through to the next layer rather than
/// aborting startup.
pub fn load_config() -> Config {
    if let Ok(raw) = std::env::var(CONFIG_ENV_VAR) {
        match serde_json::from_str(&raw) {
            Ok(config) => return config,
            Err(err) => error!("{CONFIG_ENV_VAR} was set but did not parse as JSON: {err}"),
        }
    }

    let path = Path::new(CONFIG_FILE_PATH);
    if path.exists() {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => return config,
                Err(err) => error!("{CONFIG_FILE_PATH} did not parse as JSON: {err}"),
            },
            Err(err) => error!("failed to read {CONFIG_FILE_PATH}: {err}"),
        }
    }

    Config::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 4890);
        assert_eq!(config.broker.subject_prefix, "tspi");
        assert_eq!(config.archiver.batch_size, 50);
        assert_eq!(config.player.scrub_history_size, 600);
    }

    #[test]
    fn partial_override_document_keeps_remaining_defaults() {
        let config: Config = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.broker.stream_name, "TSPI");
    }
}
