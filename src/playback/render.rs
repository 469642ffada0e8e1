use opencv::core::{Mat, Rect, Size};
use opencv::imgproc;
use opencv::prelude::*;
use serde::Serialize;
use thiserror::Error;

use crate::media::Frame;
use crate::transform::{display_to_frame, fit_size, RoiSelection, Rotation};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("opencv error: {0}")]
    Cv(#[from] opencv::Error),
    #[error("frame has no pixels")]
    EmptyFrame,
    #[error("display sink closed")]
    SinkClosed,
}

/// Everything the viewer controls about how frames are shown.
#[derive(Debug, Clone)]
pub struct ViewState {
    pub rotation: Rotation,
    pub roi: RoiSelection,
    pub display: Size,
}

impl ViewState {
    pub fn new(display: Size) -> Self {
        Self {
            rotation: Rotation::R0,
            roi: RoiSelection::default(),
            display,
        }
    }
}

pub struct RenderedFrame {
    pub image: Mat,
    pub pts_ms: u64,
    /// Crop applied, in rotated frame coordinates.
    pub crop: Option<Rect>,
    /// Size of the frame after rotation, before cropping.
    pub frame_size: Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RectView {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl From<Rect> for RectView {
    fn from(rect: Rect) -> Self {
        Self {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        }
    }
}

/// Progress report for whoever displays playback. Flows one way, out of the
/// controller, so it can never be read back as a user command.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlaybackSnapshot {
    pub location: String,
    pub is_remote: bool,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub paused: bool,
    pub ended: bool,
    pub rotation_degrees: u16,
    /// ROI as drawn, in display coordinates.
    pub roi: Option<RectView>,
    /// Part of the display ROI that survived clamping to the frame.
    pub visible_roi: Option<RectView>,
    /// Crop in pixels of the unrotated source frame.
    pub source_crop: Option<RectView>,
    pub volume: u8,
    pub message: Option<String>,
}

pub trait DisplaySink: Send {
    fn present(&mut self, frame: &RenderedFrame) -> Result<(), RenderError>;
    fn update(&mut self, snapshot: &PlaybackSnapshot);
}

/// rotate, crop, then scale to fit the display.
#[derive(Debug, Default)]
pub struct RenderPipeline;

impl RenderPipeline {
    pub fn render(&self, frame: &Frame, view: &ViewState) -> Result<RenderedFrame, RenderError> {
        if frame.image.rows() == 0 || frame.image.cols() == 0 {
            return Err(RenderError::EmptyFrame);
        }

        let rotated = view.rotation.apply(&frame.image)?;
        let frame_size = rotated.size()?;

        let crop = view.roi.rect().and_then(|roi| {
            display_to_frame(roi, frame_size, view.display)
                .inspect_err(|e| tracing::debug!(error = %e, "roi outside frame, showing full frame"))
                .ok()
        });

        let cropped = match crop {
            Some(rect) => Mat::roi(&rotated, rect)?.try_clone()?,
            None => rotated,
        };

        let target = fit_size(cropped.size()?, view.display);
        let image = if target.width == 0 || target == cropped.size()? {
            cropped
        } else {
            let mut scaled = Mat::default();
            imgproc::resize(&cropped, &mut scaled, target, 0.0, 0.0, imgproc::INTER_LINEAR)?;
            scaled
        };

        Ok(RenderedFrame {
            image,
            pts_ms: frame.pts_ms,
            crop,
            frame_size,
        })
    }
}
