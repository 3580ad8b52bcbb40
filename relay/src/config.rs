use serde_derive::{Deserialize, Serialize};
use serdeconv;
use std::path::Path;

pub const DEFAULT_PORT: u16 = 29011;

#[derive(Serialize, Deserialize)]
pub struct Server {
    pub address: String,
    pub port: u16,
    pub identification: String,
}

#[derive(Serialize, Deserialize)]
pub struct Connections {
    /// Heartbeat timeout for attached links, in milliseconds.
    pub timeout_ms: u64,
    /// Budget for the handshake of an inbound socket, in milliseconds.
    pub handshake_timeout_ms: u64,
}

#[derive(Serialize, Deserialize)]
pub struct Log {
    pub file: Option<String>,
    pub verbosity: i32,
}

#[derive(Serialize, Deserialize)]
pub struct RelayConfig {
    pub server: Server,
    pub connections: Connections,
    pub log: Log,
}

impl Default for RelayConfig {
    fn default() -> RelayConfig {
        RelayConfig {
            server: Server {
                address: "0.0.0.0".to_owned(),
                port: DEFAULT_PORT,
                identification: "arbor-relay".to_owned(),
            },
            connections: Connections {
                timeout_ms: 30_000,
                handshake_timeout_ms: 5_000,
            },
            log: Log {
                file: None,
                verbosity: arbor::logging::VB_INFO,
            },
        }
    }
}

impl RelayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> RelayConfig {
        serdeconv::from_toml_file(path).expect("Error loading relay configuration file")
    }
}
