//! HTTP façade
//!
//! Serves torrents over HTTP: `GET /?magnet=…` resolves a magnet link and
//! returns the torrent as base64 JSON, or as a direct attachment with
//! `&direct`. Optionally guarded by a simple API key.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::cache::TorrentCache;
use crate::dht::DhtNode;
use crate::resolver::Magnet2Torrent;
use crate::torrent::magnet::MagnetParser;
use crate::tracker::http::urlencode_bytes;

/// Shared state for the HTTP façade
pub struct ServerState {
    /// Long-lived DHT node, if one is running
    pub dht: Option<Arc<DhtNode>>,
    /// Metadata cache shared across requests
    pub cache: Option<TorrentCache>,
    /// When set, requests must carry `apikey=<key>`
    pub api_key: Option<String>,
    /// Announce to the built-in public tracker list too
    pub use_additional_trackers: bool,
    /// Concurrent peer-wire workers per request
    pub max_peer_workers: usize,
}

#[derive(Debug, Deserialize)]
struct TorrentQuery {
    magnet: Option<String>,
    apikey: Option<String>,
    direct: Option<String>,
}

/// Build the router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new().route("/", get(get_torrent)).with_state(state)
}

/// Bind and serve until the task is cancelled
pub async fn serve(state: Arc<ServerState>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Serving torrents on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn get_torrent(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<TorrentQuery>,
) -> Response {
    if let Some(expected) = &state.api_key {
        if query.apikey.as_deref() != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let Some(magnet_uri) = query.magnet else {
        return error_response(StatusCode::BAD_REQUEST, "magnet argument missing from url");
    };
    let magnet = match MagnetParser::parse(&magnet_uri) {
        Ok(magnet) => magnet,
        Err(e) => {
            warn!("Rejecting unparseable magnet: {}", e);
            return error_response(StatusCode::BAD_REQUEST, "invalid magnet link");
        }
    };

    let mut resolver = Magnet2Torrent::new(magnet)
        .with_additional_trackers(state.use_additional_trackers)
        .with_max_peer_workers(state.max_peer_workers);
    if let Some(dht) = &state.dht {
        resolver = resolver.with_dht(Arc::clone(dht));
    }
    if let Some(cache) = &state.cache {
        resolver = resolver.with_cache(cache.clone());
    }

    match resolver.retrieve_torrent().await {
        Ok((file_name, torrent_data)) => {
            if query.direct.is_some() {
                let disposition = format!(
                    "attachment; filename*=UTF-8''{}",
                    urlencode_bytes(file_name.as_bytes())
                );
                ([(header::CONTENT_DISPOSITION, disposition)], torrent_data).into_response()
            } else {
                Json(json!({
                    "status": "success",
                    "filename": file_name,
                    "torrent_data": BASE64.encode(&torrent_data),
                }))
                .into_response()
            }
        }
        Err(e) => {
            warn!("Fetch failed: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to retrieve magnet link",
            )
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "status": "error", "message": message }))).into_response()
}
