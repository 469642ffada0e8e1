use std::time::Instant;

use thiserror::Error;

use crate::media::Headers;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio load failed: {0}")]
    Load(String),
}

/// A separate audio stream to play alongside the video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioStream {
    pub url: String,
    pub headers: Headers,
}

/// The playback clock. Whatever implements this is authoritative for position;
/// the video follows it.
pub trait AudioTransport: Send {
    /// Loads a stream; `None` means clock only.
    fn load(&mut self, stream: Option<&AudioStream>) -> Result<(), AudioError>;
    fn play(&mut self) -> Result<(), AudioError>;
    fn pause(&mut self) -> Result<(), AudioError>;
    fn stop(&mut self) -> Result<(), AudioError>;
    fn seek(&mut self, position_ms: u64) -> Result<(), AudioError>;
    /// Clamped to 0..=100.
    fn set_volume(&mut self, volume: u8);
    fn volume(&self) -> u8;
    fn position_ms(&self) -> u64;
}

/// Monotonic clock used when audio output lives outside this process. Any
/// loaded stream is recorded so the position can be matched by an external
/// player, but no sound is produced.
#[derive(Debug)]
pub struct WallClock {
    anchor_ms: u64,
    started: Option<Instant>,
    volume: u8,
    stream: Option<AudioStream>,
}

impl WallClock {
    pub fn new(volume: u8) -> Self {
        Self {
            anchor_ms: 0,
            started: None,
            volume: volume.min(100),
            stream: None,
        }
    }
}

impl AudioTransport for WallClock {
    fn load(&mut self, stream: Option<&AudioStream>) -> Result<(), AudioError> {
        if let Some(stream) = stream {
            if stream.url.is_empty() {
                return Err(AudioError::Load("empty audio url".to_string()));
            }
            tracing::info!(url = %stream.url, "audio stream attached to clock");
        }
        self.stream = stream.cloned();
        self.anchor_ms = 0;
        self.started = None;
        Ok(())
    }

    fn play(&mut self) -> Result<(), AudioError> {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), AudioError> {
        self.anchor_ms = self.position_ms();
        self.started = None;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        if let Some(stream) = self.stream.take() {
            tracing::debug!(url = %stream.url, "audio stream detached");
        }
        self.anchor_ms = 0;
        self.started = None;
        Ok(())
    }

    fn seek(&mut self, position_ms: u64) -> Result<(), AudioError> {
        self.anchor_ms = position_ms;
        if self.started.is_some() {
            self.started = Some(Instant::now());
        }
        Ok(())
    }

    fn set_volume(&mut self, volume: u8) {
        self.volume = volume.min(100);
    }

    fn volume(&self) -> u8 {
        self.volume
    }

    fn position_ms(&self) -> u64 {
        match self.started {
            Some(at) => self.anchor_ms + at.elapsed().as_millis() as u64,
            None => self.anchor_ms,
        }
    }
}
