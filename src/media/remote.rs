use std::sync::Arc;
use std::time::{Duration, Instant};

use opencv::core::Mat;

use crate::buffer::{StreamBuffer, Take};
use crate::config::DownloadConfig;
use crate::download::{ChunkDownloader, DownloadError, Readiness};

use super::source::{FrameSource, ReadOutcome, SeekMode, SourceError};
use super::{Frame, MediaSource};

/// Bytes offered to the decoder per attempt. Doubles whenever a single frame
/// does not fit.
const INITIAL_WINDOW: usize = 256 * 1024;

/// Outcome of one decode attempt over the resident bytes. `consumed` counts the
/// leading bytes the decoder used up; the rest goes back to the buffer.
pub enum DecodeStep {
    Frame { image: Mat, consumed: usize },
    NeedMore { consumed: usize },
    Corrupt { consumed: usize, reason: String },
    /// The decoder is still working through earlier input and cannot take
    /// more yet. Retry on a later read.
    Stalled { consumed: usize },
}

/// Turns a growing byte stream into frames.
pub trait ChunkDecoder: Send {
    fn decode(&mut self, data: &[u8]) -> DecodeStep;

    /// No more input will arrive.
    fn finish(&mut self) {}

    /// Prepares for a fresh stream after a reconnect.
    fn reset(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Opens a download into the given buffer.
pub type Connector = Box<
    dyn FnMut(&MediaSource, Arc<StreamBuffer>) -> Result<ChunkDownloader, DownloadError> + Send,
>;

/// A network stream read through a [`ChunkDownloader`]. Seeking is
/// best-effort: forward seeks skip decoded frames, anything else reconnects
/// and skips from the start.
pub struct RemoteSource {
    media: MediaSource,
    connector: Connector,
    decoder: Box<dyn ChunkDecoder>,
    buffer: Arc<StreamBuffer>,
    downloader: Option<ChunkDownloader>,
    ready_timeout: Duration,
    window: usize,
    emitted: u64,
    skip_until_ms: Option<u64>,
    input_closed: bool,
    ended: bool,
}

impl RemoteSource {
    pub fn open(
        media: MediaSource,
        decoder: Box<dyn ChunkDecoder>,
        config: &DownloadConfig,
    ) -> Result<Self, SourceError> {
        let download = config.clone();
        let connector: Connector =
            Box::new(move |media, buffer| ChunkDownloader::open(media, buffer, &download));
        Self::with_connector(media, decoder, connector, config.ready_timeout())
    }

    pub fn with_connector(
        media: MediaSource,
        decoder: Box<dyn ChunkDecoder>,
        mut connector: Connector,
        ready_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let buffer = StreamBuffer::new();
        let downloader =
            connector(&media, Arc::clone(&buffer)).map_err(|e| SourceError::Open {
                location: media.location().to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            media,
            connector,
            decoder,
            buffer,
            downloader: Some(downloader),
            ready_timeout,
            window: INITIAL_WINDOW,
            emitted: 0,
            skip_until_ms: None,
            input_closed: false,
            ended: false,
        })
    }

    fn reconnect(&mut self) -> Result<(), SourceError> {
        if let Some(mut old) = self.downloader.take() {
            if let Err(e) = old.stop() {
                tracing::warn!(source = %self.media.location(), error = %e, "previous download did not stop cleanly");
            }
        }

        self.decoder.reset()?;
        self.buffer = StreamBuffer::new();
        let downloader = (self.connector)(&self.media, Arc::clone(&self.buffer)).map_err(|e| {
            SourceError::Open {
                location: self.media.location().to_string(),
                reason: e.to_string(),
            }
        })?;

        self.downloader = Some(downloader);
        self.emitted = 0;
        self.skip_until_ms = None;
        self.input_closed = false;
        self.ended = false;
        Ok(())
    }

    fn next_stamp(&mut self) -> (u64, u64) {
        let index = self.emitted;
        self.emitted += 1;
        (index, self.media.frame_to_ms(index))
    }
}

impl FrameSource for RemoteSource {
    fn media(&self) -> &MediaSource {
        &self.media
    }

    fn current_position_ms(&self) -> u64 {
        self.skip_until_ms
            .unwrap_or_else(|| self.media.frame_to_ms(self.emitted))
    }

    /// Returns `Pending` once `ready_timeout` has passed without a frame, even
    /// while data keeps arriving.
    fn read_next(&mut self) -> Result<ReadOutcome, SourceError> {
        if self.ended {
            return Ok(ReadOutcome::EndOfStream);
        }

        let deadline = Instant::now() + self.ready_timeout;
        loop {
            let data = self.buffer.consume_prefix(Take::Upto(self.window));
            let full_window = data.len() == self.window;
            match self.decoder.decode(&data) {
                DecodeStep::Frame { image, consumed } => {
                    self.buffer.return_remainder(&data[consumed.min(data.len())..]);
                    let (index, pts_ms) = self.next_stamp();
                    if let Some(target) = self.skip_until_ms {
                        if pts_ms < target {
                            if Instant::now() >= deadline {
                                return Ok(ReadOutcome::Pending);
                            }
                            continue;
                        }
                        self.skip_until_ms = None;
                        tracing::debug!(source = %self.media.location(), pts_ms, "reached seek target");
                    }
                    return Ok(ReadOutcome::Frame(Frame {
                        image,
                        index,
                        pts_ms,
                    }));
                }
                DecodeStep::Corrupt { consumed, reason } if consumed > 0 => {
                    self.buffer.return_remainder(&data[consumed.min(data.len())..]);
                    let (index, _) = self.next_stamp();
                    tracing::warn!(
                        source = %self.media.location(),
                        index,
                        reason = %reason,
                        "skipping undecodable frame"
                    );
                    return Err(SourceError::Decode(reason));
                }
                DecodeStep::Corrupt { .. } => self.buffer.return_remainder(&data),
                DecodeStep::NeedMore { consumed } => {
                    self.buffer.return_remainder(&data[consumed.min(data.len())..]);
                    if full_window {
                        // More may be resident than was offered. Grow only when
                        // the decoder could not use any of this window.
                        if consumed == 0 {
                            self.window = self.window.saturating_mul(2);
                            tracing::debug!(source = %self.media.location(), window = self.window, "frame exceeds decode window, growing");
                        }
                        if Instant::now() >= deadline {
                            return Ok(ReadOutcome::Pending);
                        }
                        continue;
                    }
                }
                DecodeStep::Stalled { consumed } => {
                    self.buffer.return_remainder(&data[consumed.min(data.len())..]);
                    tracing::trace!(resident = self.buffer.len(), "decoder busy");
                    return Ok(ReadOutcome::Pending);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ReadOutcome::Pending);
            }
            let readiness = match &self.downloader {
                Some(downloader) => downloader.wait_ready(remaining),
                None => Readiness::Finished,
            };
            match readiness {
                Readiness::Data(_) => continue,
                Readiness::Timeout => {
                    tracing::trace!(resident = self.buffer.len(), "waiting for stream data");
                    return Ok(ReadOutcome::Pending);
                }
                Readiness::Finished if !self.input_closed => {
                    // Let the decoder flush whatever it still holds.
                    self.input_closed = true;
                    self.decoder.finish();
                }
                Readiness::Finished => {
                    self.ended = true;
                    let stats = self.buffer.stats();
                    tracing::info!(
                        source = %self.media.location(),
                        frames = self.emitted,
                        bytes = stats.written,
                        undecoded = stats.resident,
                        "remote stream exhausted"
                    );
                    if !self.buffer.is_empty() {
                        tracing::warn!(
                            source = %self.media.location(),
                            bytes = self.buffer.len(),
                            "trailing bytes never formed a frame"
                        );
                    }
                    return Ok(ReadOutcome::EndOfStream);
                }
            }
        }
    }

    fn seek(&mut self, target_ms: u64, mode: SeekMode) -> Result<u64, SourceError> {
        let duration = self.media.duration_ms();
        let target = if target_ms > duration {
            tracing::warn!(
                source = %self.media.location(),
                requested_ms = target_ms,
                duration_ms = duration,
                "seek beyond estimated duration, clamping"
            );
            duration
        } else {
            target_ms
        };

        let decoded_ms = self.media.frame_to_ms(self.emitted);
        if mode == SeekMode::User || target < decoded_ms {
            tracing::info!(
                source = %self.media.location(),
                target_ms = target,
                ?mode,
                "reconnecting for seek"
            );
            self.reconnect()?;
        }

        self.skip_until_ms = (target > self.media.frame_to_ms(self.emitted)).then_some(target);
        Ok(target)
    }

    fn stop_fetch(&mut self) -> Result<(), SourceError> {
        if let Some(downloader) = self.downloader.as_mut() {
            if downloader.is_running() {
                tracing::debug!(source = %self.media.location(), "stopping download");
            }
            downloader.stop()?;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), SourceError> {
        self.downloader = None;
        if !self.input_closed {
            self.input_closed = true;
            self.decoder.finish();
        }
        self.ended = true;
        Ok(())
    }
}
