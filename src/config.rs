//! Application configuration
//!
//! Loaded once at startup from a YAML file:
//!
//! ```yaml
//! server:
//!   rtmpPort: 1935
//!   broadcastServerAddress: "127.0.0.1:8080"
//!   packetSize: 4096
//!   requestTimeoutMs: 3000
//! media:
//!   encoding:
//!     - resolution: "1280x720"
//!       frame: 30
//!       keyint: 60
//!       segmentTime: 2
//! segment:
//!   basePath: "/var/lib/media"
//!   tsRange: 2000
//!   cutPolicy: keyframe
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::segment::CutPolicy;
use crate::server::ServerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_rtmp_port() -> u16 {
    1935
}

fn default_packet_size() -> usize {
    4096
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_fanout() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    256
}

fn default_ts_range() -> u64 {
    2000
}

/// Accepts the port either as a YAML number or as a quoted string.
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port {text:?}"))),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaProcessorConfig {
    /// host:port of the downstream frame processor
    pub address: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSection {
    #[serde(default = "default_rtmp_port", deserialize_with = "deserialize_port")]
    pub rtmp_port: u16,
    #[serde(default)]
    pub broadcast_server_address: String,
    #[serde(default = "default_packet_size")]
    pub packet_size: usize,
    #[serde(default = "default_request_timeout_ms", alias = "requestTimeout")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default = "default_fanout")]
    pub fanout: bool,
    #[serde(default)]
    pub media_processor: Option<MediaProcessorConfig>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            rtmp_port: default_rtmp_port(),
            broadcast_server_address: String::new(),
            packet_size: default_packet_size(),
            request_timeout_ms: default_request_timeout_ms(),
            max_connections: 0,
            fanout: default_fanout(),
            media_processor: None,
        }
    }
}

impl ServerSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// One output rendition handed to the external encoder
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingProfile {
    /// "WIDTHxHEIGHT"
    pub resolution: String,
    #[serde(default)]
    pub frame: u32,
    #[serde(default)]
    pub keyint: u32,
    #[serde(default)]
    pub segment_time: u32,
}

impl EncodingProfile {
    /// Parsed (width, height), if the resolution is well formed
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let (w, h) = self.resolution.trim().split_once(['x', 'X'])?;
        let w: u32 = w.parse().ok()?;
        let h: u32 = h.parse().ok()?;
        (w > 0 && h > 0).then_some((w, h))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSection {
    #[serde(default)]
    pub encoding: Vec<EncodingProfile>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CutPolicyKind {
    #[default]
    Keyframe,
    Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentSection {
    pub base_path: PathBuf,
    #[serde(default = "default_ts_range")]
    pub ts_range: u64,
    #[serde(default)]
    pub cut_policy: CutPolicyKind,
}

impl SegmentSection {
    pub fn policy(&self) -> CutPolicy {
        match self.cut_policy {
            CutPolicyKind::Keyframe => CutPolicy::Keyframe,
            CutPolicyKind::Duration => CutPolicy::Duration {
                max: self.ts_range,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub media: MediaSection,
    pub segment: SegmentSection,
}

impl AppConfig {
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.rtmp_port == 0 {
            return Err(ConfigError::Invalid("server.rtmpPort must be non-zero".into()));
        }
        if self.server.broadcast_server_address.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "server.broadcastServerAddress is required".into(),
            ));
        }
        if self.server.packet_size == 0 {
            return Err(ConfigError::Invalid("server.packetSize must be positive".into()));
        }
        if let Some(processor) = &self.server.media_processor {
            if processor.address.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "server.mediaProcessor.address is required".into(),
                ));
            }
            if processor.channel_capacity == 0 {
                return Err(ConfigError::Invalid(
                    "server.mediaProcessor.channelCapacity must be positive".into(),
                ));
            }
        }
        if self.segment.base_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("segment.basePath is required".into()));
        }
        if self.segment.cut_policy == CutPolicyKind::Duration && self.segment.ts_range == 0 {
            return Err(ConfigError::Invalid(
                "segment.tsRange must be positive for the duration cut policy".into(),
            ));
        }
        for profile in &self.media.encoding {
            if profile.dimensions().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "media.encoding resolution {:?} is not WIDTHxHEIGHT",
                    profile.resolution
                )));
            }
        }
        Ok(())
    }

    /// Listener settings derived from the server section
    pub fn listener(&self) -> ServerConfig {
        ServerConfig::with_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.server.rtmp_port)))
            .max_connections(self.server.max_connections)
            .read_buffer_size(self.server.packet_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
server:
  rtmpPort: "1936"
  broadcastServerAddress: "127.0.0.1:8080"
  packetSize: 8192
  requestTimeoutMs: 1500
  maxConnections: 16
  fanout: false
  mediaProcessor:
    address: "127.0.0.1:50051"
media:
  encoding:
    - resolution: "1280x720"
      frame: 30
      keyint: 60
      segmentTime: 2
segment:
  basePath: "/tmp/media"
  tsRange: 4000
  cutPolicy: duration
"#;

    #[test]
    fn test_parse_full_config() {
        let config = AppConfig::from_yaml(FULL).unwrap();
        assert_eq!(config.server.rtmp_port, 1936);
        assert_eq!(config.server.packet_size, 8192);
        assert_eq!(config.server.request_timeout(), Duration::from_millis(1500));
        assert!(!config.server.fanout);
        let processor = config.server.media_processor.as_ref().unwrap();
        assert_eq!(processor.address, "127.0.0.1:50051");
        assert_eq!(processor.channel_capacity, 256);
        assert_eq!(config.media.encoding[0].dimensions(), Some((1280, 720)));
        assert_eq!(config.segment.policy(), CutPolicy::Duration { max: 4000 });

        let listener = config.listener();
        assert_eq!(listener.bind_addr.port(), 1936);
        assert_eq!(listener.max_connections, 16);
        assert_eq!(listener.read_buffer_size, 8192);
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_yaml(
            "server:\n  broadcastServerAddress: \"auth:80\"\nsegment:\n  basePath: /data\n",
        )
        .unwrap();
        assert_eq!(config.server.rtmp_port, 1935);
        assert_eq!(config.server.request_timeout_ms, 3000);
        assert!(config.server.fanout);
        assert!(config.server.media_processor.is_none());
        assert_eq!(config.segment.ts_range, 2000);
        assert_eq!(config.segment.policy(), CutPolicy::Keyframe);
    }

    #[test]
    fn test_legacy_request_timeout_key() {
        let config = AppConfig::from_yaml(
            "server:\n  broadcastServerAddress: a:1\n  requestTimeout: 250\nsegment:\n  basePath: /d\n",
        )
        .unwrap();
        assert_eq!(config.server.request_timeout_ms, 250);
    }

    #[test]
    fn test_missing_segment_section_is_parse_error() {
        let err = AppConfig::from_yaml("server:\n  rtmpPort: 1935\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            "server:\n  broadcastServerAddress: \"\"\nsegment:\n  basePath: /d\n",
            "server:\n  broadcastServerAddress: a:1\n  rtmpPort: 0\nsegment:\n  basePath: /d\n",
            "server:\n  broadcastServerAddress: a:1\nsegment:\n  basePath: /d\n  tsRange: 0\n  cutPolicy: duration\n",
            "server:\n  broadcastServerAddress: a:1\nmedia:\n  encoding:\n    - resolution: wide\nsegment:\n  basePath: /d\n",
            "server:\n  broadcastServerAddress: a:1\n  mediaProcessor:\n    address: \"\"\nsegment:\n  basePath: /d\n",
        ];
        for yaml in cases {
            let err = AppConfig::from_yaml(yaml).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{yaml}");
        }
    }

    #[test]
    fn test_invalid_port_string() {
        let err = AppConfig::from_yaml(
            "server:\n  rtmpPort: \"abc\"\n  broadcastServerAddress: a:1\nsegment:\n  basePath: /d\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = AppConfig::load_from("/nonexistent/media-preprocessor.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
