use opencv::core::{Point, Rect, Size};

use crate::media::{Frame, FrameSource, ReadOutcome, SeekMode};
use crate::transform::{frame_to_display, normalized_rect};

use super::audio::{AudioStream, AudioTransport};
use super::render::{DisplaySink, PlaybackSnapshot, RenderPipeline, ViewState};
use super::session::{PlayerCommand, SessionError};

/// Largest clock/video divergence tolerated before a forced seek.
pub const DRIFT_THRESHOLD_MS: u64 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Rendered { pts_ms: u64 },
    /// Paused, ended, or waiting on data.
    Idle,
    /// A frame failed to decode and was dropped.
    Skipped,
    /// Local end of stream, restarted from zero.
    Looped,
    Ended,
}

/// Keeps the video cursor on the audio clock and applies viewer commands.
pub struct SyncController {
    source: Box<dyn FrameSource>,
    audio: Box<dyn AudioTransport>,
    sink: Box<dyn DisplaySink>,
    pipeline: RenderPipeline,
    view: ViewState,
    state: PlayState,
    drift_threshold_ms: u64,
    ended: bool,
    visible_roi: Option<Rect>,
    source_crop: Option<Rect>,
    message: Option<String>,
}

impl SyncController {
    pub fn new(
        source: Box<dyn FrameSource>,
        audio: Box<dyn AudioTransport>,
        sink: Box<dyn DisplaySink>,
        display: Size,
        drift_threshold_ms: u64,
    ) -> Self {
        Self {
            source,
            audio,
            sink,
            pipeline: RenderPipeline,
            view: ViewState::new(display),
            state: PlayState::Playing,
            drift_threshold_ms,
            ended: false,
            visible_roi: None,
            source_crop: None,
            message: None,
        }
    }

    pub fn frame_interval_ms(&self) -> f64 {
        self.source.media().frame_interval_ms()
    }

    pub fn clock_position_ms(&self) -> u64 {
        self.audio.position_ms()
    }

    pub fn load_audio(&mut self, stream: Option<&AudioStream>) -> Result<(), SessionError> {
        self.audio.load(stream)?;
        Ok(())
    }

    /// Starts the clock. The controller begins in the playing state.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.audio.play()?;
        Ok(())
    }

    /// One clock tick: correct drift if needed, then show the next frame.
    pub fn on_tick(&mut self, position_ms: u64) -> Result<TickOutcome, SessionError> {
        if self.state == PlayState::Paused || self.ended {
            return Ok(TickOutcome::Idle);
        }

        let current_ms = self.source.current_position_ms();
        let delta_ms = current_ms.abs_diff(position_ms);
        if delta_ms > self.drift_threshold_ms {
            tracing::debug!(position_ms, current_ms, delta_ms, "video drifted, seeking");
            self.source.seek(position_ms, SeekMode::Drift)?;
        }

        self.advance()
    }

    pub fn toggle(&mut self) -> Result<PlayState, SessionError> {
        self.state = match self.state {
            PlayState::Playing => {
                self.audio.pause()?;
                PlayState::Paused
            }
            PlayState::Paused => {
                self.audio.play()?;
                PlayState::Playing
            }
        };
        tracing::info!(state = ?self.state, "playback toggled");
        Ok(self.state)
    }

    /// Viewer-requested seek. Always repositions, whatever the drift.
    pub fn seek_to(&mut self, position_ms: u64) -> Result<TickOutcome, SessionError> {
        let target = self.source.seek(position_ms, SeekMode::User)?;
        self.audio.seek(target)?;
        self.ended = false;
        tracing::info!(requested_ms = position_ms, target_ms = target, "seek");
        self.advance()
    }

    pub fn apply(&mut self, command: PlayerCommand) -> Result<(), SessionError> {
        match command {
            PlayerCommand::TogglePause => {
                self.toggle()?;
            }
            PlayerCommand::Seek { position_ms } => {
                self.seek_to(position_ms)?;
            }
            PlayerCommand::Rotate => {
                self.view.rotation = self.view.rotation.next();
                tracing::debug!(degrees = self.view.rotation.degrees(), "rotated");
            }
            PlayerCommand::SelectRoi { x0, y0, x1, y1 } => {
                let drawn = normalized_rect(Point::new(x0, y0), Point::new(x1, y1));
                let roi = self.view.roi.select(drawn);
                tracing::debug!(?drawn, ?roi, depth = self.view.roi.depth(), "roi selected");
            }
            PlayerCommand::ResetRoi => {
                self.view.roi.reset();
                self.visible_roi = None;
                self.source_crop = None;
            }
            PlayerCommand::SetVolume { volume } => self.audio.set_volume(volume.min(100)),
            PlayerCommand::Resize { width, height } => {
                if width > 0 && height > 0 {
                    self.view.display = Size::new(width, height);
                }
            }
            // The session loop owns shutdown.
            PlayerCommand::Stop => {}
        }
        Ok(())
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        let media = self.source.media();
        PlaybackSnapshot {
            location: media.location().to_string(),
            is_remote: media.is_remote(),
            position_ms: self.audio.position_ms(),
            duration_ms: media.duration_ms(),
            paused: self.state == PlayState::Paused,
            ended: self.ended,
            rotation_degrees: self.view.rotation.degrees(),
            roi: self.view.roi.rect().map(Into::into),
            visible_roi: self.visible_roi.map(Into::into),
            source_crop: self.source_crop.map(Into::into),
            volume: self.audio.volume(),
            message: self.message.clone(),
        }
    }

    pub fn publish(&mut self) {
        let snapshot = self.snapshot();
        self.sink.update(&snapshot);
    }

    /// Records a terminal failure for the viewer.
    pub fn fail(&mut self, error: &SessionError) {
        self.message = Some(error.to_string());
        self.publish();
    }

    /// Stops the fetch, releases the source, stops the clock. Every step runs
    /// even when an earlier one fails.
    pub fn shutdown(&mut self) -> Result<(), SessionError> {
        let mut failures = Vec::new();

        if let Err(e) = self.source.stop_fetch() {
            tracing::warn!(error = %e, "stopping fetch failed");
            failures.push(format!("stop fetch: {e}"));
        }
        if let Err(e) = self.source.release() {
            tracing::warn!(error = %e, "releasing source failed");
            failures.push(format!("release: {e}"));
        }
        if let Err(e) = self.audio.stop() {
            tracing::warn!(error = %e, "stopping audio failed");
            failures.push(format!("audio: {e}"));
        }

        if failures.is_empty() {
            tracing::info!(source = %self.source.media().location(), "playback stopped");
            Ok(())
        } else {
            Err(SessionError::Teardown(failures.join("; ")))
        }
    }

    fn advance(&mut self) -> Result<TickOutcome, SessionError> {
        match self.source.read_next() {
            Ok(ReadOutcome::Frame(frame)) => {
                self.present(&frame);
                Ok(TickOutcome::Rendered {
                    pts_ms: frame.pts_ms,
                })
            }
            Ok(ReadOutcome::Pending) => Ok(TickOutcome::Idle),
            Ok(ReadOutcome::EndOfStream) => self.end_of_stream(),
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "frame skipped");
                self.message = Some(e.to_string());
                Ok(TickOutcome::Skipped)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn end_of_stream(&mut self) -> Result<TickOutcome, SessionError> {
        if self.source.media().is_remote() {
            tracing::info!(source = %self.source.media().location(), "remote stream ended");
            self.ended = true;
            self.message = Some("stream ended".to_string());
            return Ok(TickOutcome::Ended);
        }

        tracing::debug!(source = %self.source.media().location(), "looping to start");
        self.source.seek(0, SeekMode::User)?;
        self.audio.seek(0)?;
        if self.state == PlayState::Playing {
            self.audio.play()?;
        }
        Ok(TickOutcome::Looped)
    }

    fn present(&mut self, frame: &Frame) {
        let rendered = match self.pipeline.render(frame, &self.view) {
            Ok(rendered) => rendered,
            Err(e) => {
                tracing::warn!(index = frame.index, error = %e, "render failed");
                return;
            }
        };

        self.visible_roi = rendered
            .crop
            .map(|crop| frame_to_display(crop, rendered.frame_size, self.view.display));
        let unrotate = self.view.rotation.inverse();
        self.source_crop = rendered
            .crop
            .map(|crop| unrotate.rotate_rect(crop, rendered.frame_size));
        self.message = None;

        if let Err(e) = self.sink.present(&rendered) {
            tracing::warn!(pts_ms = rendered.pts_ms, error = %e, "display rejected frame");
        }
    }
}
