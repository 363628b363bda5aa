//! Read-only HTTP view of the controller
//!
//! `GET /status` returns the counters, `GET /captures` the newest artifact
//! paths.

use std::sync::Arc;

use axum::{extract::State, response::Json, routing::get, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::controller::{ControllerState, StatusSnapshot};

#[derive(Serialize)]
struct CapturesResponse {
    captures: Vec<String>,
}

async fn get_status(State(state): State<Arc<ControllerState>>) -> Json<StatusSnapshot> {
    Json(state.snapshot())
}

async fn get_captures(State(state): State<Arc<ControllerState>>) -> Json<CapturesResponse> {
    let captures = state
        .recent()
        .iter()
        .map(|path| path.display().to_string())
        .collect();
    Json(CapturesResponse { captures })
}

pub fn router(state: Arc<ControllerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(get_status))
        .route("/captures", get(get_captures))
        .layer(cors)
        .with_state(state)
}

/// Serve the status endpoint until the listener fails
pub async fn serve(addr: &str, state: Arc<ControllerState>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "status server listening");
    axum::serve(listener, router(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{CapturedMessage, MessageKind};
    use crate::controller::Controller;
    use crate::sink::DumpDirSink;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_status_and_captures() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = Controller::new(DumpDirSink::create(dir.path()).unwrap(), 8);
        controller.handle(&CapturedMessage::new(MessageKind::Response, 0, vec![0xc0]));
        controller.handle(&CapturedMessage::new(MessageKind::Request, 0, vec![0xc1]));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(controller.state());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let status = get(addr, "/status").await;
        assert!(status.starts_with("HTTP/1.1 200"));
        assert!(status.contains("\"received\":2"));
        assert!(status.contains("\"persisted\":1"));
        assert!(status.contains("\"discarded\":1"));

        let captures = get(addr, "/captures").await;
        assert!(captures.contains("_response.json"));
    }
}
