//! HTTP surface
//!
//! - `POST /ssh/connect` `{host, user}`: connect and provision, returns the
//!   connection id as text and sets the `remoteId` cookie
//! - `GET /ssh/alive/{id}`: `{"alive": bool}`
//! - `GET /ssh/primary`: primary listener of the connection named by the
//!   `remoteId` cookie
//! - `GET /remote/{connectionId}/{sessionId}/...`: tunnel for that session

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::RemoteError;
use crate::remote::error::TunnelError;
use crate::remote::path::{parse_remote_path, remote_id_cookie, remote_id_from_cookies};
use crate::remote::RemoteService;

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub host: String,
    pub user: String,
}

#[derive(Debug, Serialize)]
struct AliveResponse {
    alive: bool,
}

#[derive(Debug, Serialize)]
pub struct PrimaryResponse {
    pub connection_id: String,
    pub address: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub connection_id: String,
    pub session_id: String,
    pub port: u16,
    pub address: String,
    pub subpath: String,
}

pub fn router(service: Arc<RemoteService>) -> Router {
    Router::new()
        .route("/ssh/connect", post(connect))
        .route("/ssh/alive/{id}", get(alive))
        .route("/ssh/primary", get(primary))
        .route("/remote/{*rest}", get(remote_session))
        .with_state(service)
}

/// Serve until Ctrl-C, then dispose every connection
pub async fn serve(service: Arc<RemoteService>, listen_addr: &str) -> Result<(), RemoteError> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|e| RemoteError::Server(format!("Failed to bind {}: {}", listen_addr, e)))?;
    info!("[server] Listening on http://{}", listen_addr);

    axum::serve(listener, router(service.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| RemoteError::Server(e.to_string()))?;

    service.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("[server] Ctrl-C handler unavailable: {}", e);
        std::future::pending::<()>().await;
    }
    info!("[server] Shutdown requested");
}

async fn connect(
    State(service): State<Arc<RemoteService>>,
    Json(request): Json<ConnectRequest>,
) -> Response {
    let report = |line: &str| info!("[remote] {}", line);
    match service.connect(&request.host, &request.user, &report).await {
        Ok(id) => (
            StatusCode::OK,
            [(header::SET_COOKIE, remote_id_cookie(&id))],
            id,
        )
            .into_response(),
        Err(e) => {
            warn!("[server] Connect to {} failed: {}", request.host, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn alive(
    State(service): State<Arc<RemoteService>>,
    Path(id): Path<String>,
) -> Json<AliveResponse> {
    Json(AliveResponse {
        alive: service.is_connection_alive(&id),
    })
}

async fn primary(State(service): State<Arc<RemoteService>>, headers: HeaderMap) -> Response {
    let id = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(remote_id_from_cookies);
    let Some(id) = id else {
        return (StatusCode::NOT_FOUND, "No remote connection selected").into_response();
    };
    match service.primary_address(&id) {
        Some(address) => Json(PrimaryResponse {
            connection_id: id,
            address: address.to_string(),
        })
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            format!("No remote connection found for id {}", id),
        )
            .into_response(),
    }
}

async fn remote_session(State(service): State<Arc<RemoteService>>, uri: Uri) -> Response {
    let Some(path) = parse_remote_path(uri.path()) else {
        return (StatusCode::NOT_FOUND, "Invalid remote path").into_response();
    };
    match service
        .open_session(&path.connection_id, &path.session_id)
        .await
    {
        Ok(session) => Json(SessionResponse {
            connection_id: path.connection_id,
            session_id: path.session_id,
            port: session.port(),
            address: session.local_addr().to_string(),
            subpath: path.subpath,
        })
        .into_response(),
        Err(RemoteError::Tunnel(e @ TunnelError::ConnectionNotFound(_))) => {
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
