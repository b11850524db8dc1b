//! HTTP surface of the gate.
//!
//! The public listener answers forward-auth subrequests from a reverse proxy
//! (`/v1/gate`). The admin listener carries the policy API the graph editor
//! talks to. [`gate`] is the same decision as an axum middleware for hosts
//! that embed the evaluator in-process.
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use miette::IntoDiagnostic;
use serde::Serialize;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;

use crate::audit::AuditEmitter;
use crate::credential::Hs256Verifier;
use crate::discovery;
use crate::errors::GateError;
use crate::evaluator::{Decision, GateRequest, PolicyEvaluator};
use crate::policy::{codec, compiler, Edge, PolicyHandle};
use crate::settings::Settings;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub evaluator: Arc<PolicyEvaluator>,
    /// Held across persist and publish so the artifact on disk and the live
    /// table always come from the same request.
    publish_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(settings: Settings, evaluator: PolicyEvaluator) -> Self {
        Self {
            settings: Arc::new(settings),
            evaluator: Arc::new(evaluator),
            publish_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Wire verifier, startup policy and audit sink from settings. Any
    /// misconfiguration is returned rather than papered over.
    pub fn from_settings(settings: Settings) -> Result<Self, GateError> {
        let verifier = Hs256Verifier::from_keys(&settings.keys)?;
        let policy = PolicyHandle::from_settings(&settings.policy)?;
        let audit = AuditEmitter::from_settings(&settings.audit)?;
        let evaluator = PolicyEvaluator::new(&settings.routes, policy, Arc::new(verifier), audit);
        Ok(Self::new(settings, evaluator))
    }

    async fn decide(&self, uri: &Uri, headers: &HeaderMap) -> Decision {
        let request = GateRequest::from_parts(uri, headers, &self.settings.keys.cookie_name);
        self.evaluator.evaluate(&request).await
    }
}

pub async fn serve(state: AppState) -> miette::Result<()> {
    let server = &state.settings.server;

    let admin_addr: SocketAddr = format!("{}:{}", server.admin_host, state.settings.admin_port())
        .parse()
        .into_diagnostic()?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .into_diagnostic()?;
    let admin = admin_router(state.clone());
    tracing::info!(%admin_addr, "Admin policy API listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(admin_listener, admin).await {
            tracing::error!(error = %e, "Admin policy API stopped");
        }
    });

    let public_addr: SocketAddr = format!("{}:{}", server.host, server.port)
        .parse()
        .into_diagnostic()?;
    let listener = tokio::net::TcpListener::bind(public_addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%public_addr, "Forward-auth gate listening");
    axum::serve(listener, gate_router(state))
        .await
        .into_diagnostic()?;
    Ok(())
}

pub fn gate_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/gate", get(forward_auth).post(forward_auth))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/api/rbac/policy", get(get_policy).post(set_policy))
        .route("/api/rbac/pages", get(list_pages))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Middleware form of the gate: `Router::layer(middleware::from_fn_with_state(state, gate))`.
pub async fn gate(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    match state.decide(request.uri(), request.headers()).await {
        Decision::Continue(_) => next.run(request).await,
        Decision::Redirect { location, .. } => redirect(&location),
    }
}

async fn forward_auth(State(state): State<AppState>, headers: HeaderMap, uri: Uri) -> Response {
    // Reverse proxies pass the original target in one of these headers.
    let original = ["x-forwarded-uri", "x-original-uri"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .find_map(|v| v.parse::<Uri>().ok())
        .unwrap_or(uri);

    match state.decide(&original, &headers).await {
        Decision::Continue(_) => (StatusCode::OK, "ok").into_response(),
        Decision::Redirect { location, .. } => redirect(&location),
    }
}

fn redirect(location: &str) -> Response {
    (
        StatusCode::TEMPORARY_REDIRECT,
        [(header::LOCATION, location.to_string())],
    )
        .into_response()
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn get_policy(State(state): State<AppState>) -> Json<Vec<Edge>> {
    Json(state.evaluator.policy().snapshot().edges())
}

#[derive(Debug, Serialize)]
struct PublishResponse {
    roles: usize,
    grants: usize,
    skipped: usize,
    duplicates: usize,
    persisted: bool,
}

async fn set_policy(
    State(state): State<AppState>,
    Json(edges): Json<Vec<Edge>>,
) -> Result<Json<PublishResponse>, GateError> {
    let report = compiler::compile(&edges);
    let mut response = PublishResponse {
        roles: report.table.role_count(),
        grants: report.table.grant_count(),
        skipped: report.skipped,
        duplicates: report.duplicates,
        persisted: false,
    };

    let _guard = state.publish_lock.lock().await;
    let table = match state.settings.policy.artifact.clone() {
        Some(path) => {
            let table = report.table;
            let table = tokio::task::spawn_blocking(move || {
                codec::save(&path, &table).map(|()| table)
            })
            .await??;
            response.persisted = true;
            table
        }
        None => report.table,
    };
    state.evaluator.policy().publish(table);
    Ok(Json(response))
}

async fn list_pages(State(state): State<AppState>) -> Result<Json<Vec<String>>, GateError> {
    Ok(Json(discovery::discover_pages(&state.settings.discovery)?))
}
