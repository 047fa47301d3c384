use std::mem;

use axum::extract::DefaultBodyLimit;
use axum::handler::Handler;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::{api, security};

pub(crate) mod paths {
    pub const HEALTHZ: &str = "/healthz";
    pub const RUN: &str = "/foundry/v1/run";
    pub const DOWNLOAD: &str = "/foundry/v1/download";
    pub const UPLOAD: &str = "/foundry/v1/upload";
    pub const UPLOAD_DELETE: &str = "/foundry/v1/upload/delete";
    pub const SECRET_ROTATE: &str = "/foundry/v1/secret/rotate";
}

/// Collects routes and remembers `METHOD path` for the startup log.
pub(crate) struct RouterBuilder {
    router: Router<AppState>,
    endpoints: Vec<String>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn route_get<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.endpoints.push(format!("GET {path}"));
        let router = mem::take(&mut self.router);
        self.router = router.route(path, get(handler));
        self
    }

    pub fn route_post<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.endpoints.push(format!("POST {path}"));
        let router = mem::take(&mut self.router);
        self.router = router.route(path, post(handler));
        self
    }

    pub fn build(self) -> (Router<AppState>, Vec<String>) {
        (self.router, self.endpoints)
    }
}

/// Full application: signed routes behind the guard, `/healthz` open, and the
/// shared HTTP layers on top.
pub(crate) fn build_router(state: AppState) -> (Router, Vec<String>) {
    let mut signed = RouterBuilder::new();
    signed
        .route_post(paths::RUN, api::run)
        .route_get(paths::DOWNLOAD, api::download)
        .route_post(paths::UPLOAD, api::upload)
        .route_post(paths::UPLOAD_DELETE, api::upload_delete)
        .route_post(paths::SECRET_ROTATE, api::rotate_secret);
    let (signed, mut endpoints) = signed.build();

    let mut open = RouterBuilder::new();
    open.route_get(paths::HEALTHZ, api::healthz);
    let (open, open_endpoints) = open.build();
    endpoints.extend(open_endpoints);

    let config = state.config();
    let body_limit = config.max_upload_bytes;
    let concurrency = config.http_max_conc.max(1);
    let trust_forward = config.trust_forward;

    let router = signed
        .route_layer(from_fn_with_state(state.clone(), security::signed_mw))
        .merge(open)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(concurrency))
        .layer(from_fn(security::access_log_mw))
        .layer(from_fn(security::headers_mw))
        .layer(from_fn_with_state(trust_forward, security::client_id_mw));
    (router, endpoints)
}
