//! Reverse proxy to the local gateway.
//!
//! Everything the control API does not claim is piped through to the
//! supervised gateway on loopback, bodies streamed in both directions.
//! Protocol upgrades (the gateway's WebSocket endpoints) are joined at
//! the transport level after replaying the handshake, so frames pass
//! through untouched. When the gateway cannot answer, callers get an
//! immediate synthetic reply instead of a hang.

use crate::api::SharedState;
use crate::config::Config;
use crate::supervisor::GatewayStatus;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::copy_bidirectional;
use tracing::{debug, warn};

/// Connection-scoped headers, never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forward anything that is not a control route to the local gateway.
pub async fn proxy_fallback(State(state): State<SharedState>, mut request: Request) -> Response {
    if !state.supervisor.is_running() {
        let status = state.supervisor.status();
        debug!("proxy short-circuit while gateway {}", status.label());
        return unavailable(&status);
    }
    // hyper arms the extension only on connections that can upgrade.
    let client_upgrade = request.extensions_mut().remove::<OnUpgrade>();
    if let Some(client_upgrade) = client_upgrade.filter(|_| wants_upgrade(request.headers())) {
        return proxy_upgrade(state, request, client_upgrade).await;
    }
    match forward(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!("gateway proxy error: {e}");
            unavailable(&state.supervisor.status())
        }
    }
}

/// Synthetic reply when the gateway cannot answer. `starting` tells the
/// caller whether a retry is worthwhile.
pub fn unavailable(status: &GatewayStatus) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        axum::Json(serde_json::json!({
            "error": "Gateway unavailable",
            "starting": status.starting(),
        })),
    )
        .into_response()
}

async fn forward(state: &SharedState, request: Request) -> Result<Response, reqwest::Error> {
    let (parts, body) = request.into_parts();
    let url = target_url(&state.config, &parts.uri);
    let upstream = state
        .http
        .request(parts.method, url)
        .headers(proxied_headers(&parts.headers))
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await?;
    Ok(stream_response(upstream))
}

/// Pipe a protocol upgrade through at the transport level. The handshake
/// is replayed against the gateway; once both sides have switched
/// protocols the two connections are joined byte for byte.
async fn proxy_upgrade(
    state: SharedState,
    request: Request,
    client_upgrade: OnUpgrade,
) -> Response {
    let url = target_url(&state.config, request.uri());
    let mut headers = proxied_headers(request.headers());
    // The handshake headers are hop-by-hop but define the upgrade itself.
    for name in [header::CONNECTION, header::UPGRADE] {
        if let Some(value) = request.headers().get(&name) {
            headers.insert(name, value.clone());
        }
    }

    let handshake = state
        .http
        .request(request.method().clone(), url)
        .headers(headers)
        .send()
        .await;
    let upstream_response = match handshake {
        Ok(response) if response.status() == StatusCode::SWITCHING_PROTOCOLS => response,
        Ok(response) => {
            debug!("gateway declined upgrade with {}", response.status());
            return stream_response(response);
        }
        Err(e) => {
            warn!("gateway upgrade handshake failed: {e}");
            return unavailable(&state.supervisor.status());
        }
    };

    let mut reply = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    if let Some(reply_headers) = reply.headers_mut() {
        for (name, value) in upstream_response.headers() {
            reply_headers.append(name.clone(), value.clone());
        }
    }

    tokio::spawn(async move {
        let mut upstream = match upstream_response.upgrade().await {
            Ok(io) => io,
            Err(e) => {
                warn!("gateway connection did not upgrade: {e}");
                return;
            }
        };
        let client = match client_upgrade.await {
            Ok(io) => io,
            Err(e) => {
                warn!("client connection did not upgrade: {e}");
                return;
            }
        };
        let mut client = TokioIo::new(client);
        match copy_bidirectional(&mut client, &mut upstream).await {
            Ok((up, down)) => debug!("upgrade closed ({up} bytes up, {down} bytes down)"),
            Err(e) => debug!("upgrade pipe ended: {e}"),
        }
    });

    reply
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::SWITCHING_PROTOCOLS.into_response())
}

fn stream_response(upstream: reqwest::Response) -> Response {
    let mut builder = Response::builder().status(upstream.status());
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn target_url(config: &Config, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}{}", config.gateway_origin(), path_and_query)
}

fn proxied_headers(source: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in source {
        if is_hop_by_hop(name.as_str()) || name == header::HOST {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_lowercase().contains("upgrade"))
        && headers.contains_key(header::UPGRADE)
}
