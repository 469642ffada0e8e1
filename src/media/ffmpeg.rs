use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use opencv::core::Mat;
use opencv::prelude::*;

use super::remote::{ChunkDecoder, DecodeStep};
use super::source::SourceError;

/// Decoded frames held on this side of the pipe. Input stops while full.
const MAX_QUEUED_FRAMES: usize = 8;
/// Wait for a frame when ffmpeg is not accepting input.
const STALL_WAIT: Duration = Duration::from_millis(20);
/// Wait for a frame after input has closed.
const FLUSH_WAIT: Duration = Duration::from_millis(200);

fn filter_graph(width: u32, height: u32, fps: f64) -> String {
    format!(
        "fps={fps},scale={width}:{height}:force_original_aspect_ratio=decrease,\
         pad={width}:{height}:(ow-iw)/2:(oh-ih)/2"
    )
}

/// Decodes any container ffmpeg understands by piping the stream through an
/// ffmpeg child that emits fixed-size BGR frames.
///
/// `decode` never blocks on the pipe: input is offered with `try_send` and
/// refused bytes stay with the caller, and finished frames are drained into a
/// local queue so ffmpeg can keep writing.
pub struct FfmpegPipeDecoder {
    width: u32,
    height: u32,
    fps: f64,
    input_tx: Option<SyncSender<Vec<u8>>>,
    frame_rx: Receiver<Vec<u8>>,
    queued: VecDeque<Vec<u8>>,
    child: Option<Child>,
    _writer_handle: JoinHandle<()>,
    _reader_handle: JoinHandle<()>,
}

impl FfmpegPipeDecoder {
    pub fn new(width: u32, height: u32, fps: f64) -> io::Result<Self> {
        let mut child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-i",
                "pipe:0",
                "-vf",
                &filter_graph(width, height, fps),
                "-f",
                "rawvideo",
                "-pix_fmt",
                "bgr24",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("ffmpeg stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("ffmpeg stdout not piped"))?;

        let (input_tx, input_rx) = mpsc::sync_channel::<Vec<u8>>(16);
        let (frame_tx, frame_rx) = mpsc::sync_channel::<Vec<u8>>(8);
        let frame_size = width as usize * height as usize * 3;

        let writer_handle = thread::Builder::new()
            .name("ffmpeg-writer".to_string())
            .spawn(move || {
                let mut stdin = stdin;
                while let Ok(data) = input_rx.recv() {
                    if stdin.write_all(&data).is_err() || stdin.flush().is_err() {
                        break;
                    }
                }
                // Dropping stdin signals end of input to ffmpeg.
            })?;

        let reader_handle = thread::Builder::new()
            .name("ffmpeg-reader".to_string())
            .spawn(move || {
                let mut stdout = stdout;
                let mut buf = vec![0u8; frame_size];
                while stdout.read_exact(&mut buf).is_ok() {
                    if frame_tx.send(buf.clone()).is_err() {
                        break;
                    }
                }
            })?;

        tracing::debug!(width, height, fps, "ffmpeg decoder started");

        Ok(Self {
            width,
            height,
            fps,
            input_tx: Some(input_tx),
            frame_rx,
            queued: VecDeque::with_capacity(MAX_QUEUED_FRAMES),
            child: Some(child),
            _writer_handle: writer_handle,
            _reader_handle: reader_handle,
        })
    }

    fn to_mat(&self, raw: &[u8]) -> opencv::Result<Mat> {
        let flat = Mat::from_slice(raw)?;
        let shaped = flat.reshape(3, self.height as i32)?;
        shaped.try_clone()
    }

    /// Moves finished frames off the channel so the reader thread never
    /// blocks while there is room here.
    fn collect_ready(&mut self) {
        while self.queued.len() < MAX_QUEUED_FRAMES {
            match self.frame_rx.try_recv() {
                Ok(raw) => self.queued.push_back(raw),
                Err(_) => break,
            }
        }
    }

    fn frame_step(&self, raw: &[u8], consumed: usize) -> DecodeStep {
        match self.to_mat(raw) {
            Ok(image) => DecodeStep::Frame { image, consumed },
            Err(e) => DecodeStep::Corrupt {
                consumed,
                reason: e.to_string(),
            },
        }
    }
}

impl ChunkDecoder for FfmpegPipeDecoder {
    fn decode(&mut self, data: &[u8]) -> DecodeStep {
        self.collect_ready();

        let mut consumed = 0;
        let mut refused = false;
        if !data.is_empty() && self.queued.len() < MAX_QUEUED_FRAMES {
            if let Some(tx) = &self.input_tx {
                match tx.try_send(data.to_vec()) {
                    Ok(()) => consumed = data.len(),
                    Err(TrySendError::Full(_)) => refused = true,
                    Err(TrySendError::Disconnected(_)) => {
                        return DecodeStep::Corrupt {
                            consumed: data.len(),
                            reason: "ffmpeg stopped accepting input".to_string(),
                        };
                    }
                }
            }
        }

        if let Some(raw) = self.queued.pop_front() {
            return self.frame_step(&raw, consumed);
        }

        let wait = match (&self.input_tx, refused) {
            (None, _) => FLUSH_WAIT,
            (Some(_), true) => STALL_WAIT,
            (Some(_), false) => return DecodeStep::NeedMore { consumed },
        };
        match self.frame_rx.recv_timeout(wait) {
            Ok(raw) => self.frame_step(&raw, consumed),
            Err(RecvTimeoutError::Timeout) => DecodeStep::Stalled { consumed },
            // Reader gone: ffmpeg wrote its last frame.
            Err(RecvTimeoutError::Disconnected) if self.input_tx.is_none() => {
                DecodeStep::NeedMore { consumed }
            }
            Err(RecvTimeoutError::Disconnected) => DecodeStep::Corrupt {
                consumed: data.len(),
                reason: "ffmpeg exited".to_string(),
            },
        }
    }

    fn finish(&mut self) {
        self.input_tx.take();
    }

    fn reset(&mut self) -> Result<(), SourceError> {
        *self = Self::new(self.width, self.height, self.fps)?;
        Ok(())
    }
}

impl Drop for FfmpegPipeDecoder {
    fn drop(&mut self) {
        self.input_tx.take();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const WIDTH: u32 = 64;
    const HEIGHT: u32 = 48;

    fn ffmpeg_available() -> bool {
        Command::new("ffmpeg")
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    /// An MPEG-TS clip of `frames` test-pattern frames at 25 fps.
    fn encoded_clip(frames: u32) -> Vec<u8> {
        let size = format!("testsrc=size={WIDTH}x{HEIGHT}:rate=25");
        let output = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-f", "lavfi", "-i", &size])
            .args(["-frames:v", &frames.to_string()])
            .args(["-c:v", "mpeg1video", "-f", "mpegts", "pipe:1"])
            .output()
            .unwrap();
        assert!(output.status.success());
        output.stdout
    }

    /// Feeds `clip` in 4 KiB windows and takes at most one frame per call, the
    /// way a slow playback tick would. Every call must return promptly.
    fn drain(decoder: &mut FfmpegPipeDecoder, clip: &[u8]) -> Vec<Mat> {
        let mut frames = Vec::new();
        let mut offset = 0;
        let mut finished = false;
        let deadline = Instant::now() + Duration::from_secs(30);

        while Instant::now() < deadline {
            let end = (offset + 4096).min(clip.len());
            let started = Instant::now();
            let step = decoder.decode(&clip[offset..end]);
            assert!(started.elapsed() < Duration::from_secs(1), "decode blocked");

            match step {
                DecodeStep::Frame { image, consumed } => {
                    offset += consumed;
                    frames.push(image);
                }
                DecodeStep::Stalled { consumed } => offset += consumed,
                DecodeStep::NeedMore { consumed } => {
                    offset += consumed;
                    if offset == clip.len() {
                        if finished {
                            return frames;
                        }
                        decoder.finish();
                        finished = true;
                    }
                }
                DecodeStep::Corrupt { reason, .. } => panic!("unexpected corrupt frame: {reason}"),
            }
        }
        panic!("decoder did not drain in time");
    }

    #[test]
    fn test_many_frames_per_call_all_come_out() {
        if !ffmpeg_available() {
            eprintln!("ffmpeg not on PATH, skipping");
            return;
        }
        let clip = encoded_clip(120);
        let mut decoder = FfmpegPipeDecoder::new(WIDTH, HEIGHT, 25.0).unwrap();

        let frames = drain(&mut decoder, &clip);
        assert_eq!(frames.len(), 120);
        for frame in &frames {
            assert_eq!(frame.rows(), HEIGHT as i32);
            assert_eq!(frame.cols(), WIDTH as i32);
            assert_eq!(frame.channels(), 3);
        }
    }

    #[test]
    fn test_reset_starts_a_fresh_stream() {
        if !ffmpeg_available() {
            eprintln!("ffmpeg not on PATH, skipping");
            return;
        }
        let clip = encoded_clip(10);
        let mut decoder = FfmpegPipeDecoder::new(WIDTH, HEIGHT, 25.0).unwrap();
        decoder.decode(&clip[..clip.len() / 2]);

        decoder.reset().unwrap();
        assert_eq!(drain(&mut decoder, &clip).len(), 10);
    }

    #[test]
    fn test_refused_input_stays_with_caller() {
        if !ffmpeg_available() {
            eprintln!("ffmpeg not on PATH, skipping");
            return;
        }
        let clip = encoded_clip(200);
        let mut decoder = FfmpegPipeDecoder::new(WIDTH, HEIGHT, 25.0).unwrap();

        // Offer tiny slices without ever finishing: once ffmpeg and the local
        // queue are full, input is refused instead of blocking.
        let mut offset = 0;
        let mut refused = false;
        let started = Instant::now();
        while offset < clip.len() && started.elapsed() < Duration::from_secs(10) {
            let end = (offset + 512).min(clip.len());
            let call = Instant::now();
            let step = decoder.decode(&clip[offset..end]);
            assert!(call.elapsed() < Duration::from_secs(1), "decode blocked");
            match step {
                DecodeStep::Frame { consumed: 0, .. } | DecodeStep::Stalled { consumed: 0 } => {
                    refused = true;
                    break;
                }
                DecodeStep::Frame { consumed, .. }
                | DecodeStep::Stalled { consumed }
                | DecodeStep::NeedMore { consumed } => offset += consumed,
                DecodeStep::Corrupt { reason, .. } => panic!("unexpected corrupt frame: {reason}"),
            }
        }
        assert!(refused || offset == clip.len());
        assert!(decoder.queued.len() <= MAX_QUEUED_FRAMES);
    }

    #[test]
    fn test_filter_graph_letterboxes_to_output_size() {
        assert_eq!(
            filter_graph(1280, 720, 25.0),
            "fps=25,scale=1280:720:force_original_aspect_ratio=decrease,\
             pad=1280:720:(ow-iw)/2:(oh-ih)/2"
        );
    }
}
