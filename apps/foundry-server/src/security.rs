use std::net::SocketAddr;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, MatchedPath, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::auth::AuthRequest;
use crate::error::FoundryError;

/// Origin identifier used for throttling and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClientId(pub String);

fn first_forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| {
            raw.split(',')
                .map(str::trim)
                .find(|part| !part.is_empty())
                .map(str::to_string)
        });
    if forwarded.is_some() {
        return forwarded;
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Peer address, or the first forwarded hop when the agent sits behind a trusted proxy.
pub(crate) fn client_identifier(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forward: bool,
) -> String {
    if trust_forward {
        if let Some(ip) = first_forwarded_ip(headers) {
            return ip;
        }
    }
    peer.map(|p| p.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub(crate) async fn client_id_mw(
    State(trust_forward): State<bool>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let id = client_identifier(req.headers(), peer, trust_forward);
    req.extensions_mut().insert(ClientId(id));
    next.run(req).await
}

fn client_of<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<ClientId>()
        .map(|c| c.0.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

pub(crate) async fn headers_mw(req: Request<Body>, next: Next) -> Response {
    let mut res = next.run(req).await;
    let h = res.headers_mut();
    for (name, value) in [
        ("x-content-type-options", "nosniff"),
        ("x-frame-options", "DENY"),
        ("referrer-policy", "no-referrer"),
        ("permissions-policy", "geolocation=(), microphone=(), camera=()"),
    ] {
        let name = HeaderName::from_static(name);
        if !h.contains_key(&name) {
            h.insert(name, HeaderValue::from_static(value));
        }
    }
    res
}

/// One line per request on the access target.
pub(crate) async fn access_log_mw(req: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let remote = client_of(&req);
    let res = next.run(req).await;
    info!(
        target: foundry_otel::ACCESS_TARGET,
        method = %method,
        path = %path,
        status = res.status().as_u16(),
        dur_ms = started.elapsed().as_millis() as u64,
        remote = %remote,
    );
    res
}

/// Throttle, buffer the body, verify the signature and run the capability
/// check; the verified [`crate::auth::AuthContext`] rides along as an extension.
pub(crate) async fn signed_mw(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match authorize(&state, req).await {
        Ok(req) => next.run(req).await,
        Err(err) => err.into_response(),
    }
}

async fn authorize(state: &AppState, req: Request<Body>) -> Result<Request<Body>, FoundryError> {
    let client = client_of(&req);
    if let Err(throttled) = state.limiter().check(&client).await {
        warn!(client = %client, retry_after = throttled.retry_after, "request throttled");
        return Err(FoundryError::RateLimited {
            retry_after: throttled.retry_after,
        });
    }

    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, state.config().max_upload_bytes)
        .await
        .map_err(|_| FoundryError::PayloadTooLarge)?;
    let path = parts.uri.path();
    let ctx = state
        .auth()
        .authenticate(&AuthRequest {
            method: parts.method.as_str(),
            path,
            query: parts.uri.query(),
            headers: &parts.headers,
            body: &bytes,
        })
        .await
        .inspect_err(|err| {
            warn!(client = %client, code = err.code(), path = %path, "authentication failed");
        })?;
    if !state.gate().allows(&ctx, path) {
        warn!(
            client = %client,
            actor = ctx.actor.as_deref().unwrap_or("-"),
            path = %path,
            "capability check denied request"
        );
        return Err(FoundryError::Forbidden);
    }

    let mut req = Request::from_parts(parts, Body::from(bytes));
    req.extensions_mut().insert(ctx);
    Ok(req)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, v.parse().unwrap());
        }
        h
    }

    #[test]
    fn forwarded_headers_ignored_unless_trusted() {
        let peer: SocketAddr = "10.0.0.5:4242".parse().unwrap();
        let h = headers(&[("x-forwarded-for", "203.0.113.9, 10.0.0.1")]);
        assert_eq!(client_identifier(&h, Some(peer), false), "10.0.0.5");
        assert_eq!(client_identifier(&h, Some(peer), true), "203.0.113.9");
    }

    #[test]
    fn real_ip_is_second_choice() {
        let h = headers(&[("x-real-ip", " 198.51.100.7 ")]);
        assert_eq!(client_identifier(&h, None, true), "198.51.100.7");
        assert_eq!(client_identifier(&HeaderMap::new(), None, true), "unknown");
    }
}
