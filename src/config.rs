//! Server config file and client settings.
//!
//! The server reads a JSON file:
//!
//! ```json
//! {
//!     "listen": ":20220",
//!     "psk": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="
//! }
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(rename = "listen")]
    pub listen_address: String,
    #[serde(deserialize_with = "deserialize_psk")]
    pub psk: Vec<u8>,
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let f = File::open(path)
            .map_err(|e| Error::Config(format!("failed to open {}: {}", path.display(), e)))?;
        Self::from_reader(BufReader::new(f))
            .map_err(|e| Error::Config(format!("failed to decode {}: {}", path.display(), e)))
    }

    pub fn from_reader<R: std::io::Read>(r: R) -> serde_json::Result<Self> {
        serde_json::from_reader(r)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_address: SocketAddr,
    /// empty to let the system choose
    pub bind_address: String,
    pub psk: Vec<u8>,
}

pub fn decode_psk(s: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(s)
        .map_err(|e| Error::Config(format!("invalid psk: {}", e)))
}

fn deserialize_psk<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
    let s = String::deserialize(d)?;
    STANDARD.decode(s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config() {
        let c = ServerConfig::from_reader(
            &br#"{"listen": ":20220", "psk": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="}"#[..],
        )
        .unwrap();
        assert_eq!(c.listen_address, ":20220");
        assert_eq!(c.psk, vec![0u8; 32]);
    }

    #[test]
    fn test_server_config_rejects() {
        assert!(ServerConfig::from_reader(
            &br#"{"listen": ":1", "psk": "AAAA", "extra": 1}"#[..]
        )
        .is_err());
        assert!(ServerConfig::from_reader(&br#"{"listen": ":1", "psk": "not base64!"}"#[..]).is_err());
        assert!(ServerConfig::from_reader(&br#"{"psk": "AAAA"}"#[..]).is_err());
    }

    #[test]
    fn test_load_missing() {
        assert!(matches!(
            ServerConfig::load("/nonexistent/opdt.json"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_decode_psk() {
        assert_eq!(decode_psk("AQID").unwrap(), vec![1, 2, 3]);
        assert!(decode_psk("%%").is_err());
    }
}
