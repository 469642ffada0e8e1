use std::process::Command;

use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

use crate::config::{PlayerConfig, ResolverConfig};
use crate::media::{Headers, MediaSource};
use crate::playback::AudioStream;

const DEFAULT_PROXY_SCHEME: &str = "socks5://";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("not an http(s) page url: {0}")]
    InvalidUrl(String),
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("extraction failed: {0}")]
    Extract(String),
    #[error("unreadable extractor output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("extractor returned no playable stream")]
    NoStream,
    #[error("every extraction attempt failed, last: {0}")]
    Exhausted(Box<ResolveError>),
}

/// Playable URLs extracted from a web page.
#[derive(Debug, Clone)]
pub struct ResolvedStream {
    pub video: MediaSource,
    pub audio: Option<AudioStream>,
}

pub trait StreamResolver {
    fn resolve(&self, page_url: &str) -> Result<ResolvedStream, ResolveError>;
}

#[derive(Debug, Deserialize)]
struct YtInfo {
    url: Option<String>,
    #[serde(default)]
    http_headers: Headers,
    #[serde(default)]
    formats: Vec<YtFormat>,
    duration: Option<f64>,
    fps: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct YtFormat {
    url: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    abr: Option<f64>,
    fps: Option<f64>,
    #[serde(default)]
    http_headers: Headers,
}

impl YtFormat {
    fn video_only(&self) -> bool {
        self.vcodec.as_deref() != Some("none") && self.acodec.as_deref() == Some("none")
    }

    fn audio_only(&self) -> bool {
        self.acodec.as_deref() != Some("none") && self.vcodec.as_deref() == Some("none")
    }
}

/// Resolves pages by running yt-dlp in JSON mode, trying each cookie browser
/// in turn and finally no cookies at all.
pub struct YtDlpResolver {
    program: String,
    format: String,
    proxy: Option<String>,
    browsers: Vec<String>,
    default_fps: f64,
    default_duration_ms: u64,
}

impl YtDlpResolver {
    pub fn new(resolver: &ResolverConfig, player: &PlayerConfig) -> Self {
        Self {
            program: resolver.program.clone(),
            format: resolver.format.clone(),
            proxy: resolver.proxy.as_deref().and_then(normalize_proxy),
            browsers: resolver.cookie_browsers.clone(),
            default_fps: player.default_fps,
            default_duration_ms: player.remote_duration_ms,
        }
    }

    fn args(&self, page_url: &str, browser: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = [
            "-J",
            "--no-playlist",
            "--no-warnings",
            "-f",
            self.format.as_str(),
            "--force-ipv4",
            "--retries",
            "5",
            "--fragment-retries",
            "5",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        if let Some(browser) = browser {
            args.push("--cookies-from-browser".to_string());
            args.push(browser.to_string());
        }
        args.push(page_url.to_string());
        args
    }

    fn extract(&self, page_url: &str, browser: Option<&str>) -> Result<YtInfo, ResolveError> {
        let output = Command::new(&self.program)
            .args(self.args(page_url, browser))
            .output()
            .map_err(|source| ResolveError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no diagnostic output")
                .trim()
                .to_string();
            return Err(ResolveError::Extract(reason));
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }

    fn select_best(&self, info: YtInfo) -> Result<ResolvedStream, ResolveError> {
        let duration_ms = info
            .duration
            .filter(|d| *d > 0.0)
            .map(|d| (d * 1000.0).round() as u64)
            .unwrap_or(self.default_duration_ms);

        let video = info
            .formats
            .iter()
            .filter(|f| f.video_only() && f.url.is_some())
            .max_by_key(|f| f.height.unwrap_or(0));

        if let Some(video) = video {
            let audio = info
                .formats
                .iter()
                .filter(|f| f.audio_only() && f.url.is_some())
                .max_by(|a, b| a.abr.unwrap_or(0.0).total_cmp(&b.abr.unwrap_or(0.0)))
                .and_then(|a| {
                    Some(AudioStream {
                        url: a.url.clone()?,
                        headers: a.http_headers.clone(),
                    })
                });

            let fps = video
                .fps
                .or(info.fps)
                .filter(|f| *f > 0.0)
                .unwrap_or(self.default_fps);
            let url = video.url.clone().ok_or(ResolveError::NoStream)?;

            return Ok(ResolvedStream {
                video: MediaSource::remote(url, video.http_headers.clone(), fps, duration_ms),
                audio,
            });
        }

        // Single combined stream.
        let url = info.url.ok_or(ResolveError::NoStream)?;
        let fps = info.fps.filter(|f| *f > 0.0).unwrap_or(self.default_fps);
        Ok(ResolvedStream {
            video: MediaSource::remote(url, info.http_headers, fps, duration_ms),
            audio: None,
        })
    }
}

impl StreamResolver for YtDlpResolver {
    fn resolve(&self, page_url: &str) -> Result<ResolvedStream, ResolveError> {
        if !valid_page_url(page_url) {
            return Err(ResolveError::InvalidUrl(page_url.to_string()));
        }

        let candidates = self
            .browsers
            .iter()
            .map(|b| Some(b.as_str()))
            .chain(std::iter::once(None));

        let mut last = ResolveError::NoStream;
        for browser in candidates {
            tracing::info!(url = %page_url, browser = browser.unwrap_or("none"), "extracting stream");
            match self
                .extract(page_url, browser)
                .and_then(|info| self.select_best(info))
            {
                Ok(resolved) => {
                    tracing::info!(
                        url = %page_url,
                        fps = resolved.video.fps(),
                        duration_ms = resolved.video.duration_ms(),
                        separate_audio = resolved.audio.is_some(),
                        "stream resolved"
                    );
                    return Ok(resolved);
                }
                // Without the program no other attempt can work.
                Err(e @ ResolveError::Spawn { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(url = %page_url, browser = browser.unwrap_or("none"), error = %e, "extraction attempt failed");
                    last = e;
                }
            }
        }
        Err(ResolveError::Exhausted(Box::new(last)))
    }
}

/// A bare `host:port` proxy gets the SOCKS5 scheme.
pub fn normalize_proxy(proxy: &str) -> Option<String> {
    let proxy = proxy.trim();
    if proxy.is_empty() {
        None
    } else if proxy.contains("://") {
        Some(proxy.to_string())
    } else {
        Some(format!("{DEFAULT_PROXY_SCHEME}{proxy}"))
    }
}

pub fn valid_page_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https")
                && parsed.host_str().is_some_and(|h| !h.is_empty())
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> YtDlpResolver {
        YtDlpResolver::new(&ResolverConfig::default(), &PlayerConfig::default())
    }

    #[test]
    fn test_proxy_normalization() {
        assert_eq!(
            normalize_proxy("127.0.0.1:1080").as_deref(),
            Some("socks5://127.0.0.1:1080")
        );
        assert_eq!(
            normalize_proxy(" http://proxy:3128 ").as_deref(),
            Some("http://proxy:3128")
        );
        assert_eq!(normalize_proxy("   "), None);
    }

    #[test]
    fn test_page_url_validation() {
        assert!(valid_page_url("https://www.example.com/watch?v=1"));
        assert!(valid_page_url("http://10.0.0.2:8080/live"));
        assert!(!valid_page_url("ftp://example.com/a"));
        assert!(!valid_page_url("/home/user/clip.mp4"));
        assert!(!valid_page_url("https://"));
    }

    #[test]
    fn test_args_include_proxy_and_browser() {
        let mut config = ResolverConfig::default();
        config.proxy = Some("10.0.0.1:9050".into());
        let resolver = YtDlpResolver::new(&config, &PlayerConfig::default());

        let args = resolver.args("https://example.com/v", Some("firefox"));
        assert_eq!(args[0], "-J");
        assert!(args.windows(2).any(|w| w == ["--proxy", "socks5://10.0.0.1:9050"]));
        assert!(args.windows(2).any(|w| w == ["--cookies-from-browser", "firefox"]));
        assert_eq!(args.last().unwrap(), "https://example.com/v");

        let bare = resolver.args("https://example.com/v", None);
        assert!(!bare.iter().any(|a| a == "--cookies-from-browser"));
    }

    #[test]
    fn test_select_best_splits_video_and_audio() {
        let json = r#"{
            "url": null,
            "duration": 12.5,
            "formats": [
                {"url": "https://v/360", "vcodec": "avc1", "acodec": "none", "height": 360, "fps": 30},
                {"url": "https://v/720", "vcodec": "avc1", "acodec": "none", "height": 720, "fps": 60,
                 "http_headers": {"Referer": "https://example.com"}},
                {"url": "https://a/lo", "vcodec": "none", "acodec": "mp4a", "abr": 48.0},
                {"url": "https://a/hi", "vcodec": "none", "acodec": "opus", "abr": 160.0,
                 "http_headers": {"User-Agent": "ua"}},
                {"url": "https://av/muxed", "vcodec": "avc1", "acodec": "mp4a", "height": 1080}
            ]
        }"#;
        let info: YtInfo = serde_json::from_str(json).unwrap();
        let resolved = resolver().select_best(info).unwrap();

        assert_eq!(resolved.video.location(), "https://v/720");
        assert_eq!(resolved.video.fps(), 60.0);
        assert_eq!(resolved.video.duration_ms(), 12_500);
        assert_eq!(
            resolved.video.headers().get("Referer").map(String::as_str),
            Some("https://example.com")
        );
        let audio = resolved.audio.unwrap();
        assert_eq!(audio.url, "https://a/hi");
        assert_eq!(audio.headers.get("User-Agent").map(String::as_str), Some("ua"));
    }

    #[test]
    fn test_select_best_falls_back_to_combined_stream() {
        let json = r#"{
            "url": "https://live/stream.m3u8",
            "http_headers": {"Origin": "https://example.com"},
            "formats": [{"url": "https://live/stream.m3u8", "vcodec": "avc1", "acodec": "mp4a"}]
        }"#;
        let info: YtInfo = serde_json::from_str(json).unwrap();
        let resolved = resolver().select_best(info).unwrap();

        assert_eq!(resolved.video.location(), "https://live/stream.m3u8");
        assert_eq!(resolved.video.fps(), 25.0);
        assert_eq!(resolved.video.duration_ms(), 40_000);
        assert!(resolved.audio.is_none());
        assert!(resolved.video.is_remote());
    }

    #[test]
    fn test_select_best_without_any_url_fails() {
        let info: YtInfo = serde_json::from_str(r#"{"formats": []}"#).unwrap();
        assert!(matches!(
            resolver().select_best(info),
            Err(ResolveError::NoStream)
        ));
    }

    #[test]
    fn test_missing_program_stops_early() {
        let mut config = ResolverConfig::default();
        config.program = "roiplay-no-such-extractor".into();
        let resolver = YtDlpResolver::new(&config, &PlayerConfig::default());
        assert!(matches!(
            resolver.resolve("https://example.com/v"),
            Err(ResolveError::Spawn { .. })
        ));
        assert!(matches!(
            resolver.resolve("not a url"),
            Err(ResolveError::InvalidUrl(_))
        ));
    }
}
