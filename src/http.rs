//! The HTTP control plane: `/startserv`, `/list`, `/stopserv`.
//!
//! Grounded on the teacher's `admin.rs` (axum `Router`, shared `Arc<State>`, `TraceLayer` +
//! `CorsLayer`) and the Go original's `ProxyServer.ServeHTTP`/`startPort`. `/list` and
//! `/stopserv` are accepted but intentionally unimplemented, matching the original's empty
//! case arms — neither ever did anything beyond returning `200` with an empty body.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::tunnel::Registry;

#[derive(Clone)]
pub struct HttpState {
    pub registry: Arc<Registry>,
}

#[derive(Serialize)]
struct StartServResponse {
    errcode: i32,
    mport: i32,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/startserv", get(start_serv))
        .route("/list", get(empty_ok))
        .route("/stopserv", get(empty_ok))
        .fallback(not_found)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// `service` names are resolved to a fixed port the way the original did: `vnc -> 5900`, anything
/// else falls back to port `0`.
fn resolve_service_port(service: &str) -> u16 {
    match service {
        "vnc" => 5900,
        _ => 0,
    }
}

async fn start_serv(State(state): State<HttpState>, Query(params): Query<HashMap<String, String>>) -> Response {
    let sn = params.get("sn").cloned().unwrap_or_default();
    let ip = params.get("ip").cloned().unwrap_or_default();
    let service = params.get("service").cloned().unwrap_or_default();
    let port = resolve_service_port(&service);
    let key = format!("<{sn}:{ip}:{port}>");

    let body = match state.registry.get(&key).await {
        None => StartServResponse { errcode: -1, mport: 0 },
        Some(tunnel) => match tunnel.start_mapping().await {
            Ok(mport) => StartServResponse {
                errcode: 0,
                mport: mport as i32,
            },
            Err(err) => {
                tracing::warn!(key = %key, err = %err, "http: startserv mapping failed");
                StartServResponse { errcode: -1, mport: 0 }
            }
        },
    };

    json_response(&body, params.get("jsonp"))
}

async fn empty_ok() -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], String::new()).into_response()
}

async fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

fn json_response<T: Serialize>(body: &T, jsonp: Option<&String>) -> Response {
    let json = serde_json::to_string(body).unwrap_or_default();
    let payload = match jsonp {
        Some(cb) if !cb.is_empty() => format!("jsonpHandler({json})"),
        _ => json,
    };
    (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], payload).into_response()
}
