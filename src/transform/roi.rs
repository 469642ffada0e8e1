use opencv::core::{Point, Rect, Size};
use thiserror::Error;

/// Drags with either edge at or below this many display pixels clear the ROI.
pub const MIN_ROI_EDGE: i32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoiBoundsError {
    #[error("display area is empty")]
    EmptyDisplay,
    #[error("roi {0:?} is empty after clamping to the frame")]
    Empty(Rect),
}

/// A region of interest in display coordinates, linked to the one it replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct Roi {
    pub rect: Rect,
    pub previous: Option<Box<Roi>>,
}

impl Roi {
    /// Number of selections stacked under this one.
    fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.previous.as_deref();
        while let Some(roi) = cursor {
            depth += 1;
            cursor = roi.previous.as_deref();
        }
        depth
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoiSelection {
    current: Option<Roi>,
}

impl RoiSelection {
    pub fn rect(&self) -> Option<Rect> {
        self.current.as_ref().map(|roi| roi.rect)
    }

    /// Selections in the active chain, zero when nothing is selected.
    pub fn depth(&self) -> usize {
        self.current.as_ref().map_or(0, |roi| roi.depth() + 1)
    }

    /// Applies a drag gesture. Returns the active ROI afterwards.
    pub fn select(&mut self, drawn: Rect) -> Option<Rect> {
        if drawn.width <= MIN_ROI_EDGE || drawn.height <= MIN_ROI_EDGE {
            self.current = None;
            return None;
        }

        let next = match self.current.take() {
            Some(active) => {
                // Expressed relative to the active box, then expanded against
                // that same box again.
                let b = active.rect;
                let rel_x = drawn.x.saturating_sub(b.x) as f64 / b.width as f64;
                let rel_y = drawn.y.saturating_sub(b.y) as f64 / b.height as f64;
                let rel_w = drawn.width as f64 / b.width as f64;
                let rel_h = drawn.height as f64 / b.height as f64;
                let rect = Rect::new(
                    b.x.saturating_add((rel_x * b.width as f64) as i32),
                    b.y.saturating_add((rel_y * b.height as f64) as i32),
                    (rel_w * b.width as f64) as i32,
                    (rel_h * b.height as f64) as i32,
                );
                Roi {
                    rect,
                    previous: Some(Box::new(active)),
                }
            }
            None => Roi {
                rect: drawn,
                previous: None,
            },
        };

        let rect = next.rect;
        self.current = Some(next);
        Some(rect)
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Rectangle spanned by a press and a release point, whichever way the drag went.
/// Spans wider than `i32::MAX` saturate.
pub fn normalized_rect(a: Point, b: Point) -> Rect {
    Rect::new(
        a.x.min(b.x),
        a.y.min(b.y),
        a.x.max(b.x).saturating_sub(a.x.min(b.x)),
        a.y.max(b.y).saturating_sub(a.y.min(b.y)),
    )
}

fn scale_floor(value: i32, to: i32, from: i32) -> i32 {
    ((value as f64 * to as f64) / from as f64).floor() as i32
}

fn scale_ceil(value: i32, to: i32, from: i32) -> i32 {
    ((value as f64 * to as f64) / from as f64).ceil() as i32
}

/// Maps a display-space ROI onto a frame of `frame` size (already rotated),
/// rounding inward and clamping to the frame.
pub fn display_to_frame(roi: Rect, frame: Size, display: Size) -> Result<Rect, RoiBoundsError> {
    if display.width <= 0 || display.height <= 0 {
        return Err(RoiBoundsError::EmptyDisplay);
    }

    let x0 = scale_ceil(roi.x, frame.width, display.width).clamp(0, frame.width);
    let y0 = scale_ceil(roi.y, frame.height, display.height).clamp(0, frame.height);
    let x1 = scale_floor(roi.x.saturating_add(roi.width), frame.width, display.width)
        .clamp(0, frame.width);
    let y1 = scale_floor(roi.y.saturating_add(roi.height), frame.height, display.height)
        .clamp(0, frame.height);

    if x1 <= x0 || y1 <= y0 {
        return Err(RoiBoundsError::Empty(roi));
    }
    Ok(Rect::new(x0, y0, x1 - x0, y1 - y0))
}

/// Inverse of [`display_to_frame`], rounding outward.
pub fn frame_to_display(rect: Rect, frame: Size, display: Size) -> Rect {
    if frame.width <= 0 || frame.height <= 0 {
        return Rect::default();
    }
    let x0 = scale_floor(rect.x, display.width, frame.width);
    let y0 = scale_floor(rect.y, display.height, frame.height);
    let x1 = scale_ceil(rect.x.saturating_add(rect.width), display.width, frame.width);
    let y1 = scale_ceil(rect.y.saturating_add(rect.height), display.height, frame.height);
    Rect::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
}

/// Largest size with the aspect ratio of `content` that fits in `bounds`.
pub fn fit_size(content: Size, bounds: Size) -> Size {
    if content.width <= 0 || content.height <= 0 || bounds.width <= 0 || bounds.height <= 0 {
        return Size::default();
    }
    let scale = (bounds.width as f64 / content.width as f64)
        .min(bounds.height as f64 / content.height as f64);
    Size::new(
        ((content.width as f64 * scale).round() as i32).clamp(1, bounds.width),
        ((content.height as f64 * scale).round() as i32).clamp(1, bounds.height),
    )
}
