use std::{net::SocketAddr, path::Path, time::Duration};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_MESSAGE_SIZE;

mod extractor;

// Default iouring/epoll entries: 32k
const DEFAULT_ENTRIES: u32 = 32768;
// HTTP/2 protocol defaults (RFC 9113 section 6.5.2)
const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 1000;
const DEFAULT_MAX_HEADER_LIST_SIZE: u32 = 16 * 1024;
const DEFAULT_HANDSHAKE_TIMEOUT_SEC: u64 = 10;

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

define_const!(default_entries, DEFAULT_ENTRIES, u32);
define_const!(default_initial_window_size, DEFAULT_INITIAL_WINDOW_SIZE, u32);
define_const!(default_max_frame_size, DEFAULT_MAX_FRAME_SIZE, u32);
define_const!(
    default_max_concurrent_streams,
    DEFAULT_MAX_CONCURRENT_STREAMS,
    u32
);
define_const!(
    default_max_header_list_size,
    DEFAULT_MAX_HEADER_LIST_SIZE,
    u32
);
define_const!(
    default_handshake_timeout_sec,
    Some(DEFAULT_HANDSHAKE_TIMEOUT_SEC),
    Option<u64>
);
define_const!(default_max_message_size, DEFAULT_MAX_MESSAGE_SIZE, usize);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_entries")]
    pub entries: u32,
    pub sqpoll_idle: Option<u32>,
    #[serde(default)]
    pub runtime_type: RuntimeType,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            entries: default_entries(),
            sqpoll_idle: None,
            runtime_type: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub h2: H2Config,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listener: Default::default(),
            h2: Default::default(),
            max_message_size: default_max_message_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ListenerConfig {
    Socket(SocketAddr),
    Unix(std::path::PathBuf),
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::Socket(SocketAddr::from(([0, 0, 0, 0], 50051)))
    }
}

/// Server side HTTP/2 settings advertised to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct H2Config {
    #[serde(default = "default_initial_window_size")]
    pub initial_window_size: u32,
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,
    #[serde(default = "default_max_header_list_size")]
    pub max_header_list_size: u32,
    // Whole connection preface and settings exchange.
    #[serde(default = "default_handshake_timeout_sec")]
    pub handshake_timeout_sec: Option<u64>,
}

impl Default for H2Config {
    fn default() -> Self {
        Self {
            initial_window_size: default_initial_window_size(),
            max_concurrent_streams: default_max_concurrent_streams(),
            max_frame_size: default_max_frame_size(),
            max_header_list_size: default_max_header_list_size(),
            handshake_timeout_sec: default_handshake_timeout_sec(),
        }
    }
}

impl H2Config {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_sec.map(Duration::from_secs)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read(path)?;
        parse_from_slice(&content)
    }
}

/// Parses JSON when the first non-blank byte opens an object, TOML otherwise.
pub fn parse_from_slice<T: DeserializeOwned>(content: &[u8]) -> anyhow::Result<T> {
    let is_json = content
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|first| *first == b'{');
    match is_json {
        true => serde_json::from_slice::<T>(content).map_err(Into::into),
        false => toml::from_str::<T>(&String::from_utf8_lossy(content)).map_err(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_deserialize() {
        const TEST_CONFIG: &str = "
            [runtime]
            runtime_type = 'legacy'

            [server]
            listener = { type = 'socket', value = '127.0.0.1:9000' }
            max_message_size = 1024

            [server.h2]
            max_concurrent_streams = 16
            handshake_timeout_sec = 3
        ";

        let config: Config = parse_from_slice(TEST_CONFIG.as_bytes()).unwrap();
        assert_eq!(config.runtime.runtime_type, RuntimeType::Legacy);
        assert_eq!(config.runtime.entries, DEFAULT_ENTRIES);
        assert_eq!(
            config.server.listener,
            ListenerConfig::Socket("127.0.0.1:9000".parse().unwrap())
        );
        assert_eq!(config.server.max_message_size, 1024);
        assert_eq!(config.server.h2.max_concurrent_streams, 16);
        assert_eq!(config.server.h2.initial_window_size, DEFAULT_INITIAL_WINDOW_SIZE);
        assert_eq!(
            config.server.h2.handshake_timeout(),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_json_deserialize() {
        const TEST_CONFIG: &str = r#"
            {
                "server": {
                    "listener": {"type": "unix", "value": "/tmp/monogrpc.sock"}
                }
            }
        "#;

        let config: Config = parse_from_slice(TEST_CONFIG.as_bytes()).unwrap();
        assert_eq!(
            config.server.listener,
            ListenerConfig::Unix("/tmp/monogrpc.sock".into())
        );
        assert_eq!(config.server.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(config.server.h2, H2Config::default());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = parse_from_slice(b"").unwrap();
        assert_eq!(config.server.listener, ListenerConfig::default());
    }
}
