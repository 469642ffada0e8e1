mod worker;

pub use worker::{ChunkDownloader, DownloadError, Readiness};
