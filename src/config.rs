use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_drift_threshold() -> u64 {
    crate::playback::DRIFT_THRESHOLD_MS
}

fn default_fps() -> f64 {
    25.0
}

fn default_remote_duration() -> u64 {
    40_000
}

fn default_volume() -> u8 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayerConfig {
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold_ms: u64,
    #[serde(default = "default_fps")]
    pub default_fps: f64,
    #[serde(default = "default_remote_duration")]
    pub remote_duration_ms: u64,
    #[serde(default = "default_volume")]
    pub initial_volume: u8,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            drift_threshold_ms: default_drift_threshold(),
            default_fps: default_fps(),
            remote_duration_ms: default_remote_duration(),
            initial_volume: default_volume(),
        }
    }
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_notify_capacity() -> usize {
    64
}

fn default_ready_timeout() -> u64 {
    1000
}

fn default_join_timeout() -> u64 {
    2000
}

fn default_connect_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_notify_capacity")]
    pub notify_capacity: usize,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl DownloadConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            notify_capacity: default_notify_capacity(),
            ready_timeout_ms: default_ready_timeout(),
            join_timeout_ms: default_join_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecodeBackend {
    #[default]
    Ffmpeg,
    Mjpeg,
}

fn default_decode_width() -> u32 {
    1280
}

fn default_decode_height() -> u32 {
    720
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecodeConfig {
    #[serde(default)]
    pub backend: DecodeBackend,
    #[serde(default = "default_decode_width")]
    pub width: u32,
    #[serde(default = "default_decode_height")]
    pub height: u32,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            backend: DecodeBackend::default(),
            width: default_decode_width(),
            height: default_decode_height(),
        }
    }
}

fn default_display_width() -> i32 {
    800
}

fn default_display_height() -> i32 {
    600
}

fn default_jpeg_quality() -> i32 {
    85
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_display_width")]
    pub width: i32,
    #[serde(default = "default_display_height")]
    pub height: i32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: i32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: default_display_width(),
            height: default_display_height(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

fn default_resolver_program() -> String {
    "yt-dlp".to_string()
}

fn default_format_filter() -> String {
    // AV1 and HEVC are skipped, the decoders are not guaranteed to handle them
    "(bv*+ba/b)[vcodec!*=av01][vcodec!*=hev1][vcodec!*=hvc]".to_string()
}

fn default_browsers() -> Vec<String> {
    ["chrome", "edge", "safari", "firefox"]
        .iter()
        .map(|b| b.to_string())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_resolver_program")]
    pub program: String,
    #[serde(default = "default_format_filter")]
    pub format: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_browsers")]
    pub cookie_browsers: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            program: default_resolver_program(),
            format: default_format_filter(),
            proxy: None,
            cookie_browsers: default_browsers(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub decode: DecodeConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

impl Config {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match Self::load_from(&path) {
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    path = %path.as_ref().display(),
                    "config file not found, using defaults"
                );
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.player.default_fps.is_nan() || self.player.default_fps <= 0.0 {
            return Err(ConfigError::Invalid("player.default_fps must be positive".into()));
        }
        if self.download.chunk_size == 0 {
            return Err(ConfigError::Invalid("download.chunk_size must be non-zero".into()));
        }
        if self.download.notify_capacity == 0 {
            return Err(ConfigError::Invalid(
                "download.notify_capacity must be non-zero".into(),
            ));
        }
        if self.display.width <= 0 || self.display.height <= 0 {
            return Err(ConfigError::Invalid("display size must be positive".into()));
        }
        if self.decode.width == 0 || self.decode.height == 0 {
            return Err(ConfigError::Invalid("decode size must be non-zero".into()));
        }
        if self.player.initial_volume > 100 {
            return Err(ConfigError::Invalid("player.initial_volume must be 0..=100".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.player.drift_threshold_ms, 80);
        assert_eq!(config.player.default_fps, 25.0);
        assert_eq!(config.player.remote_duration_ms, 40_000);
        assert_eq!(config.download.chunk_size, 65536);
        assert_eq!(config.download.ready_timeout(), Duration::from_secs(1));
        assert_eq!(config.decode.backend, DecodeBackend::Ffmpeg);
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.resolver.cookie_browsers.len(), 4);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
            [player]
            drift_threshold_ms = 120

            [decode]
            backend = "mjpeg"

            [resolver]
            proxy = "127.0.0.1:1080"
            "#,
        )
        .unwrap();
        assert_eq!(config.player.drift_threshold_ms, 120);
        assert_eq!(config.player.default_fps, 25.0);
        assert_eq!(config.decode.backend, DecodeBackend::Mjpeg);
        assert_eq!(config.decode.width, 1280);
        assert_eq!(config.resolver.proxy.as_deref(), Some("127.0.0.1:1080"));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            Config::parse("[download]\nchunk_size = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[player]\ndefault_fps = 0.0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[display]\nwidth = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(Config::parse("[player"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let path = std::env::temp_dir().join("roiplay-config-does-not-exist.toml");
        let config = Config::load_or_default(&path).unwrap();
        assert_eq!(config.display.width, 800);
    }
}
