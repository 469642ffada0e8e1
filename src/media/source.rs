use thiserror::Error;

use crate::download::DownloadError;

use super::{Frame, MediaSource};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open {location}: {reason}")]
    Open { location: String, reason: String },
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("network error: {0}")]
    Network(#[from] DownloadError),
    #[error("seek failed: {0}")]
    Seek(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("source already released")]
    Released,
    #[error("opencv error: {0}")]
    Cv(#[from] opencv::Error),
}

impl SourceError {
    /// Errors after which the next read may still succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SourceError::Decode(_) | SourceError::Network(_))
    }
}

pub enum ReadOutcome {
    Frame(Frame),
    /// No complete frame yet; the bounded wait for data expired.
    Pending,
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Correcting drift against the clock.
    Drift,
    /// Requested by the viewer.
    User,
}

/// "Next decodable frame" over a local or remote source.
pub trait FrameSource: Send {
    fn media(&self) -> &MediaSource;

    /// Timestamp of the frame the next read will produce.
    fn current_position_ms(&self) -> u64;

    fn read_next(&mut self) -> Result<ReadOutcome, SourceError>;

    /// Repositions near `target_ms`, clamped to the known duration. Returns the
    /// target actually used.
    fn seek(&mut self, target_ms: u64, mode: SeekMode) -> Result<u64, SourceError>;

    /// Stops any background fetch. First step of teardown.
    fn stop_fetch(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Releases the connection or file handle.
    fn release(&mut self) -> Result<(), SourceError>;
}
