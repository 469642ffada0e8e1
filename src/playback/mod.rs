mod audio;
mod render;
mod session;
mod sync;

pub use audio::AudioStream;
pub use render::{DisplaySink, PlaybackSnapshot, RenderError, RenderedFrame};
pub use session::{spawn_session, PlayerCommand, SessionRequest};
pub use sync::DRIFT_THRESHOLD_MS;
