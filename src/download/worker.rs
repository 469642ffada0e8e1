use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;

use crate::buffer::StreamBuffer;
use crate::config::DownloadConfig;
use crate::media::{Headers, MediaSource};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {0}")]
    Status(reqwest::StatusCode),
    #[error("invalid header: {0}")]
    Header(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("download worker did not exit within {0:?}")]
    JoinTimeout(Duration),
    #[error("download worker panicked")]
    Panicked,
}

/// Result of waiting on the readiness channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A chunk of this many bytes was appended.
    Data(usize),
    Timeout,
    /// The worker has exited; no more data will arrive.
    Finished,
}

/// Owns the background thread that streams one remote resource into a
/// [`StreamBuffer`].
pub struct ChunkDownloader {
    label: String,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    ready_rx: Receiver<usize>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl ChunkDownloader {
    /// Connects synchronously; the worker only starts once the server answered
    /// with a success status.
    pub fn open(
        media: &MediaSource,
        buffer: Arc<StreamBuffer>,
        config: &DownloadConfig,
    ) -> Result<Self, DownloadError> {
        let headers = header_map(media.headers())?;
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(None::<Duration>)
            .build()?;

        let response = client.get(media.location()).headers(headers).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status));
        }

        tracing::info!(
            url = %media.location(),
            status = %status,
            content_length = ?response.content_length(),
            "connected to remote source"
        );

        Self::spawn(media.location().to_string(), response, buffer, config)
    }

    pub fn spawn<R: Read + Send + 'static>(
        label: String,
        reader: R,
        buffer: Arc<StreamBuffer>,
        config: &DownloadConfig,
    ) -> Result<Self, DownloadError> {
        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::sync_channel(config.notify_capacity);
        let (done_tx, done_rx) = mpsc::channel();

        let worker = Worker {
            label: label.clone(),
            buffer,
            ready_tx,
            stop: Arc::clone(&stop),
            running: Arc::clone(&running),
            chunk_size: config.chunk_size,
        };

        let handle = thread::Builder::new()
            .name("chunk-download".to_string())
            .spawn(move || {
                worker.run(reader);
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            label,
            stop,
            running,
            ready_rx,
            done_rx,
            handle: Some(handle),
            join_timeout: config.join_timeout(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bounded wait for the next readiness notification.
    pub fn wait_ready(&self, timeout: Duration) -> Readiness {
        match self.ready_rx.recv_timeout(timeout) {
            Ok(n) => Readiness::Data(n),
            Err(RecvTimeoutError::Timeout) => Readiness::Timeout,
            Err(RecvTimeoutError::Disconnected) => Readiness::Finished,
        }
    }

    /// Signals the worker and joins it. A worker stuck in a network read past
    /// the join timeout is detached; it exits on its next wakeup.
    pub fn stop(&mut self) -> Result<(), DownloadError> {
        self.stop.store(true, Ordering::Relaxed);
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        match self.done_rx.recv_timeout(self.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                handle.join().map_err(|_| DownloadError::Panicked)?;
                tracing::debug!(source = %self.label, "download worker joined");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    source = %self.label,
                    timeout_ms = self.join_timeout.as_millis() as u64,
                    "download worker still blocked, detaching"
                );
                Err(DownloadError::JoinTimeout(self.join_timeout))
            }
        }
    }
}

impl Drop for ChunkDownloader {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop();
        }
    }
}

struct Worker {
    label: String,
    buffer: Arc<StreamBuffer>,
    ready_tx: SyncSender<usize>,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    chunk_size: usize,
}

impl Worker {
    fn run<R: Read>(self, mut reader: R) {
        let mut chunk = vec![0u8; self.chunk_size];
        let mut total: u64 = 0;

        tracing::debug!(source = %self.label, chunk_size = self.chunk_size, "download worker started");

        while !self.stop.load(Ordering::Relaxed) {
            match reader.read(&mut chunk) {
                Ok(0) => {
                    tracing::info!(source = %self.label, bytes = total, "remote stream ended");
                    break;
                }
                Ok(n) => {
                    self.buffer.append(&chunk[..n]);
                    total += n as u64;
                    // A full channel only means the reader is behind; the bytes
                    // are already in the buffer.
                    match self.ready_tx.try_send(n) {
                        Ok(()) | Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(
                        source = %self.label,
                        bytes = total,
                        error = %e,
                        "download failed"
                    );
                    break;
                }
            }
        }

        tracing::trace!(source = %self.label, bytes = total, "download worker exiting");
        // Dropping `self` afterwards closes the readiness channel.
        self.running.store(false, Ordering::Release);
    }
}

fn header_map(headers: &Headers) -> Result<HeaderMap, DownloadError> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| DownloadError::Header(key.clone()))?;
        let value = HeaderValue::from_str(value).map_err(|_| DownloadError::Header(key.clone()))?;
        map.insert(name, value);
    }
    Ok(map)
}
