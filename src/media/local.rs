use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};

use super::source::{FrameSource, ReadOutcome, SeekMode, SourceError};
use super::{Frame, MediaSource};

/// Random-access decoder for a file on disk.
pub trait Decoder: Send {
    /// Frame rate reported by the container, if any.
    fn fps(&self) -> Option<f64>;
    fn frame_count(&self) -> u64;
    fn seek_frame(&mut self, index: u64) -> Result<(), SourceError>;
    /// `None` at end of stream.
    fn read(&mut self) -> Result<Option<Mat>, SourceError>;
    fn release(&mut self) -> Result<(), SourceError>;
}

pub struct CvCapture {
    cap: VideoCapture,
    fps: Option<f64>,
    frame_count: u64,
}

impl CvCapture {
    pub fn open(path: &str) -> Result<Self, SourceError> {
        let open_error = |reason: String| SourceError::Open {
            location: path.to_string(),
            reason,
        };

        let cap = VideoCapture::from_file(path, videoio::CAP_ANY)
            .map_err(|e| open_error(e.to_string()))?;
        if !cap.is_opened()? {
            return Err(open_error("not a readable video".to_string()));
        }

        let fps = cap.get(videoio::CAP_PROP_FPS)?;
        let frame_count = cap.get(videoio::CAP_PROP_FRAME_COUNT)?.max(0.0) as u64;

        Ok(Self {
            cap,
            fps: (fps.is_finite() && fps > 0.0).then_some(fps),
            frame_count,
        })
    }
}

impl Decoder for CvCapture {
    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn seek_frame(&mut self, index: u64) -> Result<(), SourceError> {
        if !self.cap.set(videoio::CAP_PROP_POS_FRAMES, index as f64)? {
            return Err(SourceError::Seek(format!("capture rejected frame {index}")));
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Mat>, SourceError> {
        let mut frame = Mat::default();
        if !self.cap.read(&mut frame)? || frame.rows() == 0 || frame.cols() == 0 {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    fn release(&mut self) -> Result<(), SourceError> {
        self.cap.release()?;
        Ok(())
    }
}

/// A local file: exact metadata, direct repositioning by frame index.
pub struct LocalSource<D: Decoder = CvCapture> {
    media: MediaSource,
    decoder: D,
    cursor: u64,
    released: bool,
}

impl LocalSource<CvCapture> {
    pub fn open(path: &str, default_fps: f64) -> Result<Self, SourceError> {
        let decoder = CvCapture::open(path)?;
        let source = Self::with_decoder(path, decoder, default_fps);
        tracing::info!(
            source = %path,
            fps = source.media.fps(),
            frames = source.media.frame_count(),
            duration_ms = source.media.duration_ms(),
            "opened local source"
        );
        Ok(source)
    }
}

impl<D: Decoder> LocalSource<D> {
    pub fn with_decoder(path: &str, decoder: D, default_fps: f64) -> Self {
        let fps = decoder.fps().unwrap_or(default_fps);
        let media = MediaSource::local(path, fps, decoder.frame_count());
        Self {
            media,
            decoder,
            cursor: 0,
            released: false,
        }
    }
}

impl<D: Decoder> FrameSource for LocalSource<D> {
    fn media(&self) -> &MediaSource {
        &self.media
    }

    fn current_position_ms(&self) -> u64 {
        self.media.frame_to_ms(self.cursor)
    }

    fn read_next(&mut self) -> Result<ReadOutcome, SourceError> {
        if self.released {
            return Err(SourceError::Released);
        }
        match self.decoder.read()? {
            Some(image) => {
                let frame = Frame {
                    image,
                    index: self.cursor,
                    pts_ms: self.media.frame_to_ms(self.cursor),
                };
                self.cursor += 1;
                Ok(ReadOutcome::Frame(frame))
            }
            None => Ok(ReadOutcome::EndOfStream),
        }
    }

    fn seek(&mut self, target_ms: u64, _mode: SeekMode) -> Result<u64, SourceError> {
        if self.released {
            return Err(SourceError::Released);
        }

        // Zero duration means the container did not report a frame count.
        let duration = self.media.duration_ms();
        let target = if duration > 0 && target_ms > duration {
            tracing::warn!(
                source = %self.media.location(),
                requested_ms = target_ms,
                duration_ms = duration,
                "seek beyond end, clamping"
            );
            duration
        } else {
            target_ms
        };

        let mut index = self.media.ms_to_frame(target);
        if self.media.frame_count() > 0 {
            index = index.min(self.media.frame_count() - 1);
        }
        self.decoder.seek_frame(index)?;
        self.cursor = index;
        Ok(target)
    }

    fn release(&mut self) -> Result<(), SourceError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.decoder.release()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    /// In-memory decoder whose frames are filled with their own index.
    pub(crate) struct SyntheticDecoder {
        pub fps: f64,
        pub frames: u64,
        pub position: u64,
    }

    impl SyntheticDecoder {
        pub(crate) fn new(fps: f64, frames: u64) -> Self {
            Self {
                fps,
                frames,
                position: 0,
            }
        }
    }

    impl Decoder for SyntheticDecoder {
        fn fps(&self) -> Option<f64> {
            Some(self.fps)
        }

        fn frame_count(&self) -> u64 {
            self.frames
        }

        fn seek_frame(&mut self, index: u64) -> Result<(), SourceError> {
            self.position = index;
            Ok(())
        }

        fn read(&mut self) -> Result<Option<Mat>, SourceError> {
            if self.position >= self.frames {
                return Ok(None);
            }
            let value = (self.position % 256) as f64;
            self.position += 1;
            Ok(Some(Mat::new_rows_cols_with_default(
                4,
                6,
                CV_8UC3,
                Scalar::all(value),
            )?))
        }

        fn release(&mut self) -> Result<(), SourceError> {
            Ok(())
        }
    }

    fn read_index(source: &mut LocalSource<SyntheticDecoder>) -> u64 {
        match source.read_next().unwrap() {
            ReadOutcome::Frame(frame) => frame.index,
            _ => panic!("expected a frame"),
        }
    }

    #[test]
    fn test_seek_converts_ms_to_frame_index() {
        let mut source =
            LocalSource::with_decoder("clip.mp4", SyntheticDecoder::new(25.0, 250), 30.0);
        assert_eq!(source.media().duration_ms(), 10_000);

        assert_eq!(source.seek(5000, SeekMode::User).unwrap(), 5000);
        assert_eq!(source.current_position_ms(), 5000);
        assert_eq!(read_index(&mut source), 125);
        assert_eq!(read_index(&mut source), 126);
        assert_eq!(source.current_position_ms(), 5080);
    }

    #[test]
    fn test_seek_past_end_clamps() {
        let mut source =
            LocalSource::with_decoder("clip.mp4", SyntheticDecoder::new(25.0, 250), 25.0);
        assert_eq!(source.seek(99_000, SeekMode::Drift).unwrap(), 10_000);
        assert_eq!(read_index(&mut source), 249);
        assert!(matches!(
            source.read_next().unwrap(),
            ReadOutcome::EndOfStream
        ));
    }

    #[test]
    fn test_frame_pts_follow_frame_rate() {
        let mut source =
            LocalSource::with_decoder("clip.mp4", SyntheticDecoder::new(50.0, 10), 25.0);
        let ReadOutcome::Frame(first) = source.read_next().unwrap() else {
            panic!("expected a frame");
        };
        let ReadOutcome::Frame(second) = source.read_next().unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(first.pts_ms, 0);
        assert_eq!(second.pts_ms, 20);
    }

    #[test]
    fn test_read_after_release_fails() {
        let mut source =
            LocalSource::with_decoder("clip.mp4", SyntheticDecoder::new(25.0, 10), 25.0);
        source.release().unwrap();
        assert!(matches!(source.read_next(), Err(SourceError::Released)));
        assert!(source.release().is_ok());
    }
}
