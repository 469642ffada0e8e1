use std::sync::mpsc::Sender;
use std::sync::{Arc, RwLock};

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use opencv::core::Vector;
use opencv::imgcodecs;
use rust_embed::Embed;
use tower_http::trace::TraceLayer;

use crate::playback::{DisplaySink, PlaybackSnapshot, PlayerCommand, RenderError, RenderedFrame};

#[derive(Embed)]
#[folder = "src/assets/"]
struct Assets;

type LatestFrame = Arc<RwLock<Option<Vec<u8>>>>;
type LatestStatus = Arc<RwLock<PlaybackSnapshot>>;

#[derive(Clone)]
pub struct AppState {
    frame: LatestFrame,
    status: LatestStatus,
    commands: Sender<PlayerCommand>,
}

impl AppState {
    pub fn new(commands: Sender<PlayerCommand>) -> Self {
        Self {
            frame: Arc::new(RwLock::new(None)),
            status: Arc::new(RwLock::new(PlaybackSnapshot::default())),
            commands,
        }
    }

    /// A display sink publishing into this state.
    pub fn display(&self, jpeg_quality: i32) -> HttpDisplay {
        HttpDisplay {
            frame: Arc::clone(&self.frame),
            status: Arc::clone(&self.status),
            jpeg_quality,
        }
    }
}

/// Keeps the latest rendered frame as JPEG and the latest status for pollers.
pub struct HttpDisplay {
    frame: LatestFrame,
    status: LatestStatus,
    jpeg_quality: i32,
}

impl DisplaySink for HttpDisplay {
    fn present(&mut self, frame: &RenderedFrame) -> Result<(), RenderError> {
        let mut encoded = Vector::<u8>::new();
        let params = Vector::<i32>::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, self.jpeg_quality]);
        imgcodecs::imencode(".jpg", &frame.image, &mut encoded, &params)?;

        let mut latest = self.frame.write().map_err(|_| RenderError::SinkClosed)?;
        *latest = Some(encoded.to_vec());
        Ok(())
    }

    fn update(&mut self, snapshot: &PlaybackSnapshot) {
        if let Ok(mut status) = self.status.write() {
            *status = snapshot.clone();
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/assets/{*path}", get(static_handler))
        .route("/api/status", get(status_handler))
        .route("/api/frame", get(frame_handler))
        .route("/api/command", post(command_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(state: AppState, port: u16) -> Result<(), std::io::Error> {
    let app = router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("starting HTTP server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn index_handler() -> impl IntoResponse {
    match Assets::get("index.html") {
        Some(content) => Html(content.data.to_vec()).into_response(),
        None => (StatusCode::NOT_FOUND, "index.html not found").into_response(),
    }
}

async fn static_handler(Path(path): Path<String>) -> impl IntoResponse {
    match Assets::get(&path) {
        Some(content) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            (
                [(header::CONTENT_TYPE, mime.as_ref())],
                content.data.to_vec(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.status.read() {
        Ok(status) => Json(status.clone()).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "status lock error").into_response(),
    }
}

async fn frame_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.frame.read() {
        Ok(frame) => match frame.as_ref() {
            Some(jpeg) => (
                [
                    (header::CONTENT_TYPE, "image/jpeg"),
                    (header::CACHE_CONTROL, "no-store"),
                ],
                jpeg.clone(),
            )
                .into_response(),
            None => StatusCode::NO_CONTENT.into_response(),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "frame lock error").into_response(),
    }
}

async fn command_handler(
    State(state): State<AppState>,
    Json(command): Json<PlayerCommand>,
) -> impl IntoResponse {
    tracing::debug!(?command, "command received");
    match state.commands.send(command) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "playback has stopped").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Mat, Scalar, Size, CV_8UC3};
    use std::sync::mpsc;

    #[tokio::test]
    async fn test_frame_endpoint_serves_latest_jpeg() {
        let (tx, _rx) = mpsc::channel();
        let state = AppState::new(tx);

        let empty = frame_handler(State(state.clone())).await.into_response();
        assert_eq!(empty.status(), StatusCode::NO_CONTENT);

        let mut display = state.display(80);
        let rendered = RenderedFrame {
            image: Mat::new_rows_cols_with_default(24, 32, CV_8UC3, Scalar::all(128.0)).unwrap(),
            pts_ms: 40,
            crop: None,
            frame_size: Size::new(32, 24),
        };
        display.present(&rendered).unwrap();

        let response = frame_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/jpeg"
        );
        let jpeg = state.frame.read().unwrap().clone().unwrap();
        assert_eq!(&jpeg[..2], &[0xFFu8, 0xD8]);
    }

    #[tokio::test]
    async fn test_command_forwarded_to_session() {
        let (tx, rx) = mpsc::channel();
        let state = AppState::new(tx);

        let response = command_handler(State(state), Json(PlayerCommand::Rotate))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(rx.try_recv().unwrap(), PlayerCommand::Rotate);

        drop(rx);
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let response = command_handler(State(AppState::new(tx)), Json(PlayerCommand::Stop))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_status_reflects_last_update() {
        let (tx, _rx) = mpsc::channel();
        let state = AppState::new(tx);
        let mut display = state.display(80);
        display.update(&PlaybackSnapshot {
            position_ms: 1234,
            paused: true,
            ..PlaybackSnapshot::default()
        });

        let response = status_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let status = state.status.read().unwrap();
        assert_eq!(status.position_ms, 1234);
        assert!(status.paused);
    }
}
