use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use opencv::core::Size;
use serde::Deserialize;
use thiserror::Error;

use crate::config::{Config, DecodeBackend};
use crate::media::{
    ChunkDecoder, FfmpegPipeDecoder, FrameSource, Headers, JpegStreamDecoder, LocalSource,
    MediaSource, RemoteSource, SourceError,
};
use crate::resolve::{valid_page_url, ResolveError, StreamResolver, YtDlpResolver};

use super::audio::{AudioError, AudioStream, WallClock};
use super::render::{DisplaySink, PlaybackSnapshot};
use super::sync::{SyncController, TickOutcome};

/// Viewer input. Serialized as `{"type": "seek", "position_ms": 5000}` and so on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerCommand {
    TogglePause,
    Seek { position_ms: u64 },
    Rotate,
    SelectRoi { x0: i32, y0: i32, x1: i32, y1: i32 },
    ResetRoi,
    SetVolume { volume: u8 },
    Resize { width: i32, height: i32 },
    Stop,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("audio error: {0}")]
    Audio(#[from] AudioError),
    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("teardown incomplete: {0}")]
    Teardown(String),
}

/// What the viewer asked to play.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub location: String,
    pub headers: Headers,
    pub audio: Option<AudioStream>,
    /// Treat `location` as a web page and extract the stream from it.
    pub resolve: bool,
}

/// Opens the frame source for a request, resolving the page first if asked.
pub fn open_source(
    request: &SessionRequest,
    config: &Config,
) -> Result<(Box<dyn FrameSource>, Option<AudioStream>), SessionError> {
    let (media, audio) = if request.resolve {
        let resolver = YtDlpResolver::new(&config.resolver, &config.player);
        let resolved = resolver.resolve(&request.location)?;
        (resolved.video, request.audio.clone().or(resolved.audio))
    } else if valid_page_url(&request.location) {
        let media = MediaSource::remote(
            request.location.clone(),
            request.headers.clone(),
            config.player.default_fps,
            config.player.remote_duration_ms,
        );
        (media, request.audio.clone())
    } else {
        let source = LocalSource::open(&request.location, config.player.default_fps)?;
        return Ok((Box::new(source), request.audio.clone()));
    };

    let decoder: Box<dyn ChunkDecoder> = match config.decode.backend {
        DecodeBackend::Ffmpeg => Box::new(FfmpegPipeDecoder::new(
            config.decode.width,
            config.decode.height,
            media.fps(),
        )?),
        DecodeBackend::Mjpeg => Box::new(JpegStreamDecoder::new()),
    };
    tracing::info!(
        url = %media.location(),
        backend = ?config.decode.backend,
        fps = media.fps(),
        "opening remote source"
    );
    let source = RemoteSource::open(media, decoder, &config.download)?;
    Ok((Box::new(source), audio))
}

/// Drives the controller until `Stop`, a closed command channel, or a fatal
/// error. Ticks arrive at the source's frame interval; commands are handled
/// between ticks.
pub fn run(
    controller: &mut SyncController,
    commands: &Receiver<PlayerCommand>,
) -> Result<(), SessionError> {
    let interval = Duration::from_secs_f64(controller.frame_interval_ms() / 1000.0);
    let mut next_tick = Instant::now();
    controller.publish();

    loop {
        let wait = next_tick.saturating_duration_since(Instant::now());
        match commands.recv_timeout(wait) {
            Ok(PlayerCommand::Stop) => {
                tracing::info!("stop requested");
                return Ok(());
            }
            Ok(command) => {
                tracing::debug!(?command, "command");
                controller.apply(command)?;
                controller.publish();
                continue;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                tracing::info!("command channel closed");
                return Ok(());
            }
        }

        let now = Instant::now();
        next_tick += interval;
        if next_tick < now {
            // Fell behind; do not try to catch up with a burst of ticks.
            next_tick = now + interval;
        }

        let position_ms = controller.clock_position_ms();
        match controller.on_tick(position_ms)? {
            TickOutcome::Ended => tracing::info!(position_ms, "playback reached end of stream"),
            TickOutcome::Looped => tracing::debug!("looped"),
            _ => {}
        }
        controller.publish();
    }
}

/// Runs one playback session on its own thread: open, play, then tear down
/// whatever happened in between.
pub fn spawn_session(
    config: Config,
    request: SessionRequest,
    mut sink: Box<dyn DisplaySink>,
    commands: Receiver<PlayerCommand>,
) -> std::io::Result<JoinHandle<Result<(), SessionError>>> {
    thread::Builder::new()
        .name("playback".to_string())
        .spawn(move || {
            let (source, audio_stream) = match open_source(&request, &config) {
                Ok(opened) => opened,
                Err(e) => {
                    tracing::error!(source = %request.location, error = %e, "failed to open source");
                    sink.update(&PlaybackSnapshot {
                        location: request.location.clone(),
                        ended: true,
                        message: Some(e.to_string()),
                        ..PlaybackSnapshot::default()
                    });
                    return Err(e);
                }
            };

            let display = Size::new(config.display.width, config.display.height);
            let mut controller = SyncController::new(
                source,
                Box::new(WallClock::new(config.player.initial_volume)),
                sink,
                display,
                config.player.drift_threshold_ms,
            );
            play(&mut controller, audio_stream.as_ref(), &commands)
        })
}

/// Loads the clock, plays until stopped, then tears down. Any failure along
/// the way reaches the sink before teardown runs.
fn play(
    controller: &mut SyncController,
    audio: Option<&AudioStream>,
    commands: &Receiver<PlayerCommand>,
) -> Result<(), SessionError> {
    let result = controller
        .load_audio(audio)
        .and_then(|()| controller.start())
        .and_then(|()| run(controller, commands));
    if let Err(e) = &result {
        tracing::error!(error = %e, "playback failed");
        controller.fail(e);
    }

    let teardown = controller.shutdown();
    result.and(teardown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticDecoder;
    use crate::playback::audio::AudioTransport;
    use crate::playback::render::{RenderError, RenderedFrame};
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct CountingSink {
        frames: Arc<Mutex<usize>>,
        last: Arc<Mutex<Option<PlaybackSnapshot>>>,
    }

    impl DisplaySink for CountingSink {
        fn present(&mut self, _frame: &RenderedFrame) -> Result<(), RenderError> {
            *self.frames.lock().unwrap() += 1;
            Ok(())
        }

        fn update(&mut self, snapshot: &PlaybackSnapshot) {
            *self.last.lock().unwrap() = Some(snapshot.clone());
        }
    }

    fn synthetic_controller(sink: &CountingSink) -> SyncController {
        let source = LocalSource::with_decoder("clip.mp4", SyntheticDecoder::new(50.0, 500), 25.0);
        let mut clock = WallClock::new(80);
        clock.load(None).unwrap();
        SyncController::new(
            Box::new(source),
            Box::new(clock),
            Box::new(sink.clone()),
            Size::new(320, 240),
            80,
        )
    }

    #[test]
    fn test_command_json_shapes() {
        let seek: PlayerCommand =
            serde_json::from_str(r#"{"type":"seek","position_ms":5000}"#).unwrap();
        assert_eq!(seek, PlayerCommand::Seek { position_ms: 5000 });

        let roi: PlayerCommand =
            serde_json::from_str(r#"{"type":"select_roi","x0":1,"y0":2,"x1":30,"y1":40}"#)
                .unwrap();
        assert_eq!(
            roi,
            PlayerCommand::SelectRoi {
                x0: 1,
                y0: 2,
                x1: 30,
                y1: 40
            }
        );

        let toggle: PlayerCommand = serde_json::from_str(r#"{"type":"toggle_pause"}"#).unwrap();
        assert_eq!(toggle, PlayerCommand::TogglePause);
        assert!(serde_json::from_str::<PlayerCommand>(r#"{"type":"eject"}"#).is_err());
    }

    #[test]
    fn test_queued_commands_apply_before_stop() {
        let sink = CountingSink::default();
        let mut controller = synthetic_controller(&sink);
        let (tx, rx) = mpsc::channel();
        tx.send(PlayerCommand::Rotate).unwrap();
        tx.send(PlayerCommand::SetVolume { volume: 30 }).unwrap();
        tx.send(PlayerCommand::Stop).unwrap();

        run(&mut controller, &rx).unwrap();
        let last = sink.last.lock().unwrap().clone().unwrap();
        assert_eq!(last.rotation_degrees, 90);
        assert_eq!(last.volume, 30);
    }

    #[test]
    fn test_ticks_render_until_stopped() {
        let sink = CountingSink::default();
        let mut controller = synthetic_controller(&sink);
        controller.start().unwrap();
        let (tx, rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let result = run(&mut controller, &rx);
            (result, controller.shutdown())
        });
        thread::sleep(Duration::from_millis(200));
        tx.send(PlayerCommand::Stop).unwrap();

        let (result, teardown) = handle.join().unwrap();
        assert!(result.is_ok());
        assert!(teardown.is_ok());
        assert!(*sink.frames.lock().unwrap() > 0);
    }

    #[test]
    fn test_dropped_channel_ends_session() {
        let sink = CountingSink::default();
        let mut controller = synthetic_controller(&sink);
        let (tx, rx) = mpsc::channel::<PlayerCommand>();
        drop(tx);
        assert!(run(&mut controller, &rx).is_ok());
    }

    #[test]
    fn test_audio_load_failure_is_reported_and_torn_down() {
        let sink = CountingSink::default();
        let source = LocalSource::with_decoder("clip.mp4", SyntheticDecoder::new(25.0, 50), 25.0);
        let mut controller = SyncController::new(
            Box::new(source),
            Box::new(WallClock::new(100)),
            Box::new(sink.clone()),
            Size::new(320, 240),
            80,
        );
        let (_tx, rx) = mpsc::channel();
        let audio = AudioStream {
            url: String::new(),
            headers: Headers::new(),
        };

        let result = play(&mut controller, Some(&audio), &rx);
        assert!(matches!(result, Err(SessionError::Audio(_))));
        let last = sink.last.lock().unwrap().clone().unwrap();
        assert!(last.message.unwrap().contains("empty audio url"));
        assert_eq!(*sink.frames.lock().unwrap(), 0);
    }

    #[test]
    fn test_open_failure_is_reported_to_sink() {
        let sink = CountingSink::default();
        let (_tx, rx) = mpsc::channel();
        let request = SessionRequest {
            location: "/definitely/not/here.mp4".into(),
            headers: Headers::new(),
            audio: None,
            resolve: false,
        };
        let handle =
            spawn_session(Config::default(), request, Box::new(sink.clone()), rx).unwrap();

        assert!(handle.join().unwrap().is_err());
        let last = sink.last.lock().unwrap().clone().unwrap();
        assert!(last.ended);
        assert!(last.message.is_some());
    }
}
