mod stream;

pub use stream::{BufferStats, StreamBuffer, Take};
