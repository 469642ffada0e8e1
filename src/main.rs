use std::path::PathBuf;
use std::sync::mpsc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod api;
mod buffer;
mod config;
mod download;
mod media;
mod playback;
mod resolve;
mod transform;

use api::AppState;
use config::Config;
use media::Headers;
use playback::{AudioStream, PlayerCommand, SessionRequest};

#[derive(Parser)]
#[command(name = "roiplay")]
#[command(about = "Audio-clocked video player with rotation and region-of-interest cropping")]
#[command(version)]
struct Cli {
    /// Local file, direct stream URL, or a web page with --resolve
    source: String,

    /// Separate audio stream URL, passed through for an external player; playback
    /// itself runs on an internal clock and produces no sound
    #[arg(long)]
    audio: Option<String>,

    /// Extra request header for remote streams, as KEY:VALUE
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Extract the playable stream from a web page with yt-dlp
    #[arg(long)]
    resolve: bool,

    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Overrides http.port from the config file
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected KEY:VALUE, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty header name in {raw:?}"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let directive = if cli.verbose {
        "roiplay=trace"
    } else {
        "roiplay=debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    let mut config = Config::load_or_default(&cli.config)?;
    if let Some(port) = cli.port {
        config.http.port = port;
    }

    let headers: Headers = cli.headers.into_iter().collect();
    let request = SessionRequest {
        location: cli.source,
        audio: cli.audio.map(|url| AudioStream {
            url,
            headers: headers.clone(),
        }),
        headers,
        resolve: cli.resolve,
    };
    tracing::info!(source = %request.location, resolve = request.resolve, "starting playback");

    let (command_tx, command_rx) = mpsc::channel();
    let state = AppState::new(command_tx.clone());
    let display = state.display(config.display.jpeg_quality);
    let port = config.http.port;

    let server = tokio::spawn(async move {
        if let Err(e) = api::start_server(state, port).await {
            tracing::error!("http server failed: {}", e);
        }
    });

    let session = playback::spawn_session(config, request, Box::new(display), command_rx)?;
    let mut session = tokio::task::spawn_blocking(move || session.join());

    let outcome = tokio::select! {
        joined = &mut session => joined,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            let _ = command_tx.send(PlayerCommand::Stop);
            session.await
        }
    };

    server.abort();

    match outcome {
        Ok(Ok(Ok(()))) => {
            tracing::info!("shutdown complete");
            Ok(())
        }
        Ok(Ok(Err(e))) => {
            tracing::error!(error = %e, "playback ended with an error");
            Err(e.into())
        }
        Ok(Err(_)) => Err("playback thread panicked".into()),
        Err(e) => Err(e.into()),
    }
}
