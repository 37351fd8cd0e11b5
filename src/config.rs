use std::{fs, path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use serde::Deserialize;
use url::Url;

use crate::connectivity::connection::Thresholds;

const CHANNELS_PER_CONNECTION_DEFAULT: usize = 4;
const ORDERED_CHANNELS_DEFAULT: bool = true;
const MAX_INCOMING_CONNECTIONS_DEFAULT: usize = 8;
const SEND_HIGH_WATER_DEFAULT: usize = 15 * 1024 * 1024;
const OVERFLOW_THRESHOLD_DEFAULT: usize = 8 * 1024 * 1024;
const CHUNK_SIZE_DEFAULT: u64 = 64 * 1024;
const DATA_SUPPLIER_CONCURRENCY_DEFAULT: usize = 2;
const EVENTS_PAGE_SIZE_DEFAULT: usize = 100;
const TEMP_COPY_TTL_DEFAULT: u64 = 3600;
const STUN_SERVER_DEFAULT: &str = "stun:stun.l.google.com:19302";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub credential: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub node_id: String,

    pub signaling_url: String,

    #[serde(default)]
    pub token: String,

    #[serde(default = "data_directory_default")]
    pub data_directory: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_path: Option<String>,

    #[serde(default = "ice_servers_default")]
    pub ice_servers: Vec<IceServer>,

    #[serde(default = "channels_per_connection_default")]
    pub channels_per_connection: usize,

    #[serde(default = "ordered_channels_default")]
    pub ordered_channels: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retransmits: Option<u16>,

    #[serde(default = "max_incoming_connections_default")]
    pub max_incoming_connections: usize,

    #[serde(default = "send_high_water_default")]
    pub send_high_water: usize,

    #[serde(default = "overflow_threshold_default")]
    pub overflow_threshold: usize,

    #[serde(default = "chunk_size_default")]
    pub chunk_size: u64,

    #[serde(default = "data_supplier_concurrency_default")]
    pub data_supplier_concurrency: usize,

    #[serde(default = "events_page_size_default")]
    pub events_page_size: usize,

    #[serde(default = "temp_copy_ttl_default")]
    pub temp_copy_ttl: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_seed: Option<u64>,
}

impl Config {
    pub fn new(config_path: &str) -> Result<Self> {
        info!("Using configuration file {config_path}. ");

        let config = fs::read_to_string(config_path)?;
        Self::parse(config.trim())
    }

    fn parse(config: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(config)?;

        if config.token.is_empty() {
            warn!("config.token is not set, the sync session cannot authorize. ");
        }

        if let Err(e) = Url::parse(&config.signaling_url) {
            error!("config.signaling_url is not a valid URL: {e}. ");
            return Err(anyhow!("invalid configuration"));
        }

        if config.overflow_threshold >= config.send_high_water {
            error!("config.overflow_threshold must be below config.send_high_water. ");
            return Err(anyhow!("invalid configuration"));
        }

        if config.chunk_size == 0 {
            error!("config.chunk_size must not be zero. ");
            return Err(anyhow!("invalid configuration"));
        }

        if config.channels_per_connection == 0 {
            error!("config.channels_per_connection must not be zero. ");
            return Err(anyhow!("invalid configuration"));
        }

        if config.data_supplier_concurrency == 0 {
            warn!("config.data_supplier_concurrency is zero, no data will be served. ");
        }

        Ok(config)
    }

    pub fn signaling_url(&self) -> Result<Url> {
        Ok(Url::parse(&self.signaling_url)?)
    }

    pub fn index_path(&self) -> PathBuf {
        match &self.index_path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(&self.data_directory).join("index.json"),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            send_high_water: self.send_high_water,
            overflow_threshold: self.overflow_threshold,
        }
    }

    pub fn temp_copy_ttl(&self) -> Duration {
        Duration::from_secs(self.temp_copy_ttl)
    }
}

fn data_directory_default() -> String {
    let directory = format!("/var/lib/{}", env!("CARGO_PKG_NAME"));
    debug!("Defaulting config.data_directory to {directory}. ");
    directory
}

fn ice_servers_default() -> Vec<IceServer> {
    debug!("Defaulting config.ice_servers to {STUN_SERVER_DEFAULT}. ");
    vec![IceServer {
        urls: vec![String::from(STUN_SERVER_DEFAULT)],
        username: String::new(),
        credential: String::new(),
    }]
}

fn channels_per_connection_default() -> usize {
    debug!("Defaulting config.channels_per_connection to {CHANNELS_PER_CONNECTION_DEFAULT}. ");
    CHANNELS_PER_CONNECTION_DEFAULT
}

fn ordered_channels_default() -> bool {
    debug!("Defaulting config.ordered_channels to {ORDERED_CHANNELS_DEFAULT}. ");
    ORDERED_CHANNELS_DEFAULT
}

fn max_incoming_connections_default() -> usize {
    debug!("Defaulting config.max_incoming_connections to {MAX_INCOMING_CONNECTIONS_DEFAULT}. ");
    MAX_INCOMING_CONNECTIONS_DEFAULT
}

fn send_high_water_default() -> usize {
    debug!("Defaulting config.send_high_water to {SEND_HIGH_WATER_DEFAULT}. ");
    SEND_HIGH_WATER_DEFAULT
}

fn overflow_threshold_default() -> usize {
    debug!("Defaulting config.overflow_threshold to {OVERFLOW_THRESHOLD_DEFAULT}. ");
    OVERFLOW_THRESHOLD_DEFAULT
}

fn chunk_size_default() -> u64 {
    debug!("Defaulting config.chunk_size to {CHUNK_SIZE_DEFAULT}. ");
    CHUNK_SIZE_DEFAULT
}

fn data_supplier_concurrency_default() -> usize {
    debug!("Defaulting config.data_supplier_concurrency to {DATA_SUPPLIER_CONCURRENCY_DEFAULT}. ");
    DATA_SUPPLIER_CONCURRENCY_DEFAULT
}

fn events_page_size_default() -> usize {
    debug!("Defaulting config.events_page_size to {EVENTS_PAGE_SIZE_DEFAULT}. ");
    EVENTS_PAGE_SIZE_DEFAULT
}

fn temp_copy_ttl_default() -> u64 {
    debug!("Defaulting config.temp_copy_ttl to {TEMP_COPY_TTL_DEFAULT}. ");
    TEMP_COPY_TTL_DEFAULT
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "node_id: n1\nsignaling_url: wss://relay.example/ws\ntoken: t\n";

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.channels_per_connection, 4);
        assert!(config.ordered_channels);
        assert_eq!(config.max_retransmits, None);
        assert_eq!(config.thresholds(), Thresholds {
            send_high_water: 15 * 1024 * 1024,
            overflow_threshold: 8 * 1024 * 1024,
        });
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.index_path(), PathBuf::from("/var/lib/syncmesh/index.json"));
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn inconsistent_thresholds_are_rejected() {
        let config = format!("{MINIMAL}send_high_water: 100\noverflow_threshold: 100\n");
        assert!(Config::parse(&config).is_err());

        let config = format!("{MINIMAL}chunk_size: 0\n");
        assert!(Config::parse(&config).is_err());

        let config = "node_id: n1\nsignaling_url: not a url\n";
        assert!(Config::parse(config).is_err());
    }

    #[test]
    fn ice_servers_with_credentials() {
        let config = format!(
            "{MINIMAL}ice_servers:\n  - urls: [\"turn:turn.example:3478\"]\n    username: u\n    credential: p\n"
        );
        let config = Config::parse(&config).unwrap();
        assert_eq!(config.ice_servers[0].username, "u");
        assert_eq!(config.ice_servers[0].credential, "p");
    }
}
