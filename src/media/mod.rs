mod ffmpeg;
mod jpeg;
mod local;
mod remote;
mod source;

use std::collections::HashMap;

use opencv::core::Mat;

pub use ffmpeg::FfmpegPipeDecoder;
pub use jpeg::JpegStreamDecoder;
pub use local::LocalSource;
pub use remote::{ChunkDecoder, RemoteSource};
pub use source::{FrameSource, ReadOutcome, SeekMode, SourceError};

#[cfg(test)]
pub(crate) use local::tests::SyntheticDecoder;

pub type Headers = HashMap<String, String>;

/// What is being played. Built once when the source is opened.
#[derive(Debug, Clone)]
pub struct MediaSource {
    location: String,
    headers: Headers,
    is_remote: bool,
    fps: f64,
    duration_ms: u64,
    frame_count: u64,
}

impl MediaSource {
    pub fn local(path: impl Into<String>, fps: f64, frame_count: u64) -> Self {
        let duration_ms = frames_to_ms(frame_count, fps);
        Self {
            location: path.into(),
            headers: Headers::new(),
            is_remote: false,
            fps,
            duration_ms,
            frame_count,
        }
    }

    /// Remote streams rarely report reliable metadata, so fps and duration are
    /// estimates supplied by the caller.
    pub fn remote(url: impl Into<String>, headers: Headers, fps: f64, duration_ms: u64) -> Self {
        let frame_count = (duration_ms as f64 * fps / 1000.0).floor() as u64;
        Self {
            location: url.into(),
            headers,
            is_remote: true,
            fps,
            duration_ms,
            frame_count,
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn frame_interval_ms(&self) -> f64 {
        1000.0 / self.fps
    }

    pub fn ms_to_frame(&self, ms: u64) -> u64 {
        (ms as f64 / self.frame_interval_ms()).floor() as u64
    }

    pub fn frame_to_ms(&self, index: u64) -> u64 {
        frames_to_ms(index, self.fps)
    }
}

fn frames_to_ms(frames: u64, fps: f64) -> u64 {
    (frames as f64 * 1000.0 / fps).round() as u64
}

/// A decoded picture in BGR order.
pub struct Frame {
    pub image: Mat,
    pub index: u64,
    pub pts_ms: u64,
}
