//! Construction-time configuration.
//!
//! Every knob is optional and falls back to the defaults below, so a peer
//! can be built from an empty JSON object. Extensions are listed in wiring
//! order, matching the reference deployment's `[{name: "gossip"}, {name:
//! "media"}]` shape.

use std::time::Duration;

use serde::Deserialize;

/// Default max residual forwards for outbound forwardable messages.
pub const DEFAULT_TTL: u32 = 3;

/// Default retry-queue tick period in milliseconds.
pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 1000;

/// Default max view size (`C`).
pub const DEFAULT_VIEW_SIZE: usize = 10;

/// Default healing parameter (`H`).
pub const DEFAULT_HEAL: usize = 0;

/// Default swap parameter (`S`).
pub const DEFAULT_SWAP: usize = 0;

/// Default active-thread gossip period in milliseconds.
pub const DEFAULT_GOSSIP_PERIOD_MS: u64 = 2500;

/// Default per-part download timeout in milliseconds.
pub const DEFAULT_DOWNLOAD_TIMEOUT_MS: u64 = 5000;

/// Default number of parts requested concurrently after the head arrives.
pub const DEFAULT_CONCURRENT_PARTS: usize = 3;

/// Default chunk size in bytes, conservatively below the 64 KB
/// data-channel ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 17_500;

/// Top-level peer configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default)]
    pub peer: PeerSettings,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<ExtensionConfig>,
}

impl Config {
    /// Configuration with both extensions enabled at their defaults.
    pub fn with_default_extensions() -> Self {
        Self {
            signal: SignalConfig::default(),
            peer: PeerSettings::default(),
            extensions: default_extensions(),
        }
    }
}

fn default_extensions() -> Vec<ExtensionConfig> {
    vec![
        ExtensionConfig::Gossip(RpsConfig::default()),
        ExtensionConfig::Media(MediaConfig::default()),
    ]
}

/// Rendezvous service endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignalConfig {
    pub url: Option<String>,
}

/// Mesh-node settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerSettings {
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default = "default_queue_timeout_ms", alias = "queueTimeout")]
    pub queue_timeout_ms: u64,
}

impl PeerSettings {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            queue_timeout_ms: default_queue_timeout_ms(),
        }
    }
}

/// One entry of the ordered extension list.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum ExtensionConfig {
    Gossip(RpsConfig),
    Media(MediaConfig),
}

/// How the active gossip thread picks its exchange partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    #[default]
    Random,
    Oldest,
}

/// Random peer sampling parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct RpsConfig {
    /// Max view size.
    #[serde(default = "default_view_size", alias = "C")]
    pub view_size: usize,
    /// How many of the oldest descriptors to prefer dropping on overflow.
    #[serde(default = "default_heal", alias = "H")]
    pub heal: usize,
    /// How many sent-and-echoed descriptors to prefer dropping on
    /// overflow.
    #[serde(default = "default_swap", alias = "S")]
    pub swap: usize,
    #[serde(default = "default_gossip_period_ms", alias = "gossipPeriod")]
    pub gossip_period_ms: u64,
    #[serde(default)]
    pub selection: SelectionPolicy,
}

impl RpsConfig {
    pub fn gossip_period(&self) -> Duration {
        Duration::from_millis(self.gossip_period_ms)
    }
}

impl Default for RpsConfig {
    fn default() -> Self {
        Self {
            view_size: default_view_size(),
            heal: default_heal(),
            swap: default_swap(),
            gossip_period_ms: default_gossip_period_ms(),
            selection: SelectionPolicy::default(),
        }
    }
}

/// Media fetcher parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_download_timeout_ms", alias = "downloadTimeout")]
    pub download_timeout_ms: u64,
    #[serde(default = "default_concurrent_parts", alias = "concurrentParts")]
    pub concurrent_parts: usize,
    #[serde(default = "default_chunk_size", alias = "chunkSize")]
    pub chunk_size: usize,
    /// Start fetching as soon as a media is added.
    #[serde(default = "default_autoload")]
    pub autoload: bool,
}

impl MediaConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            download_timeout_ms: default_download_timeout_ms(),
            concurrent_parts: default_concurrent_parts(),
            chunk_size: default_chunk_size(),
            autoload: default_autoload(),
        }
    }
}

fn default_ttl() -> u32 {
    DEFAULT_TTL
}

fn default_queue_timeout_ms() -> u64 {
    DEFAULT_QUEUE_TIMEOUT_MS
}

fn default_view_size() -> usize {
    DEFAULT_VIEW_SIZE
}

fn default_heal() -> usize {
    DEFAULT_HEAL
}

fn default_swap() -> usize {
    DEFAULT_SWAP
}

fn default_gossip_period_ms() -> u64 {
    DEFAULT_GOSSIP_PERIOD_MS
}

fn default_download_timeout_ms() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_MS
}

fn default_concurrent_parts() -> usize {
    DEFAULT_CONCURRENT_PARTS
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_autoload() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.peer.ttl, 3);
        assert_eq!(config.peer.queue_timeout(), Duration::from_millis(1000));
        assert_eq!(config.extensions.len(), 2);
    }

    #[test]
    fn test_extension_list_parses_reference_shape() {
        let config: Config = serde_json::from_str(
            r#"{
                "signal": {"url": "wss://rendezvous.example"},
                "peer": {"ttl": 5, "queueTimeout": 500},
                "extensions": [
                    {"name": "gossip", "C": 20, "H": 2, "S": 3,
                     "gossipPeriod": 1000, "selection": "oldest"},
                    {"name": "media", "downloadTimeout": 2500,
                     "concurrentParts": 5, "chunkSize": 16000,
                     "autoload": false}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.peer.ttl, 5);
        match &config.extensions[0] {
            ExtensionConfig::Gossip(rps) => {
                assert_eq!(rps.view_size, 20);
                assert_eq!(rps.heal, 2);
                assert_eq!(rps.swap, 3);
                assert_eq!(rps.gossip_period(), Duration::from_millis(1000));
                assert_eq!(rps.selection, SelectionPolicy::Oldest);
            }
            other => panic!("unexpected extension: {:?}", other),
        }
        match &config.extensions[1] {
            ExtensionConfig::Media(media) => {
                assert_eq!(media.download_timeout(), Duration::from_millis(2500));
                assert_eq!(media.concurrent_parts, 5);
                assert_eq!(media.chunk_size, 16000);
                assert!(!media.autoload);
            }
            other => panic!("unexpected extension: {:?}", other),
        }
    }
}
