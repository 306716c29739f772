//! Server-mode configuration file, loaded from the path given by `-f` (default `config.json`).
//!
//! Grounded on the Go original's `config.go` (`Config`/`ServerCfg`/`MappingCfg`, one
//! `encoding/json` document) and the teacher's `config.rs` staging-struct pattern. Field names
//! match the original's JSON tags exactly so existing config files keep working unchanged.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerCfg {
    pub ip: String,
    pub port: u16,
    pub serv: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MappingCfg {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub sn: String,
    pub server: ServerCfg,
    pub braport: u16,
    /// Carried for config-file compatibility; the core tunnel never reads from it, matching
    /// the original where this field was parsed but never consulted anywhere.
    #[serde(default)]
    pub mapping: Vec<MappingCfg>,
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_config() {
        let json = r#"{
            "sn": "AA",
            "server": {"ip": "0.0.0.0", "port": 9000, "serv": 9001},
            "braport": 9100,
            "mapping": [{"ip": "10.0.0.5", "port": 5900}]
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.sn, "AA");
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.serv, 9001);
        assert_eq!(cfg.braport, 9100);
        assert_eq!(cfg.mapping.len(), 1);
    }

    #[test]
    fn mapping_defaults_to_empty_when_absent() {
        let json = r#"{
            "sn": "AA",
            "server": {"ip": "0.0.0.0", "port": 9000, "serv": 9001},
            "braport": 9100
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert!(cfg.mapping.is_empty());
    }
}
