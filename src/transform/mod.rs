mod roi;
mod rotation;

pub use roi::{display_to_frame, fit_size, frame_to_display, normalized_rect, RoiSelection};
pub use rotation::Rotation;
