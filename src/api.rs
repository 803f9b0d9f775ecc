//! Control-plane HTTP surface: operator endpoints and the webhook ingress.
//!
//! Signature checks happen here, against the per-service secrets; the
//! result of every coordinator call is mapped to a transport status at
//! this boundary and nowhere else. Deployments triggered by webhooks are
//! answered with 202 and handed to a worker task through an explicit
//! queue, so their failures end up in the log instead of vanishing.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use tokio::sync::mpsc::{Receiver, Sender};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::github::service_from_webhook;
use crate::models::Service;
use crate::orchestrator::Orchestrator;
use crate::server;

const SIGNATURE_HEADER: &str = "x-hub-signature";

/// Work accepted from the webhook surface, drained by [`deploy_worker`].
#[derive(Debug)]
pub enum DeployTask {
    Deploy(Service),
    RunAndExit(Service),
}

struct AppState {
    orchestrator: Arc<Orchestrator>,
    deploy_tx: Sender<DeployTask>,
    operator_secret: String,
}

pub async fn serve(orchestrator: Arc<Orchestrator>) -> Result<()> {
    let operator_secret = std::fs::read_to_string(orchestrator.config.key_file())
        .map(|key| key.trim().to_string())
        .unwrap_or_default();
    if operator_secret.is_empty() {
        log::warn!("No operator secret found; /reload will reject every request");
    }

    let (deploy_tx, deploy_rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(deploy_worker(Arc::clone(&orchestrator), deploy_rx));

    let port = orchestrator.config.port;
    let state = Arc::new(AppState {
        orchestrator,
        deploy_tx,
        operator_secret,
    });

    let app = Router::new()
        .route("/", get(liveness))
        .route("/services", get(list_services))
        .route("/deploy", post(deploy))
        .route("/run", post(run))
        .route("/destroy", post(destroy))
        .route("/create", post(create))
        .route("/reload", post(reload))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    log::info!("Control plane listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Runs queued deployments one at a time. Failures are logged with the
/// service they belong to; the worker itself never dies.
async fn deploy_worker(orchestrator: Arc<Orchestrator>, mut rx: Receiver<DeployTask>) {
    while let Some(task) = rx.recv().await {
        match task {
            DeployTask::Deploy(service) => {
                log::info!("Deploying {}#{}", service.repository, service.branch);
                let result = async {
                    orchestrator.build(&service, None).await?;
                    orchestrator.run_in_background(&service, None).await
                }
                .await;
                if let Err(err) = result {
                    log::error!(
                        "Failed to deploy {}#{}: {err}",
                        service.repository,
                        service.branch
                    );
                }
            }
            DeployTask::RunAndExit(service) => {
                if let Err(err) = orchestrator.run_and_exit(&service, None).await {
                    log::error!(
                        "Failed to run {}#{}: {err}",
                        service.repository,
                        service.branch
                    );
                }
            }
        }
    }
}

async fn liveness() -> &'static str {
    "OK"
}

async fn list_services(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.get_status().await {
        Ok(services) => {
            let list: Vec<_> = services
                .into_iter()
                .map(|s| {
                    serde_json::json!({
                        "type": s.service_type,
                        "repository": s.repository,
                        "branch": s.branch,
                        "online": s.online,
                    })
                })
                .collect();
            Json(list).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn deploy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let webhook = match serde_json::from_slice(&body) {
        Ok(webhook) => webhook,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let service = match service_from_webhook(&webhook) {
        Ok(service) => service,
        Err(err) => return error_response(err),
    };
    if let Err(err) = authorize_service(&state, &service, &headers, &body) {
        return error_response(err);
    }

    enqueue(&state, DeployTask::Deploy(service))
}

#[derive(Debug, Deserialize)]
struct ServiceRequest {
    repository: String,
    #[serde(default)]
    branch: Option<String>,
}

impl ServiceRequest {
    fn into_service(self) -> Service {
        Service::new(self.repository, self.branch)
    }
}

async fn run(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let request: ServiceRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let service = request.into_service();
    if let Err(err) = authorize_service(&state, &service, &headers, &body) {
        return error_response(err);
    }

    enqueue(&state, DeployTask::RunAndExit(service))
}

async fn destroy(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let request: ServiceRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let service = request.into_service();
    if let Err(err) = authorize_service(&state, &service, &headers, &body) {
        return error_response(err);
    }

    match state.orchestrator.destroy(&service).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err),
    }
}

/// Registers a webhook key for a self-declared repository. The body is
/// the bare repository name.
async fn create(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let repository = String::from_utf8_lossy(&body).trim().to_string();
    if repository.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let service = Service::new(repository, None);
    match state.orchestrator.keys.create_key(&service) {
        Ok(secret) => (StatusCode::CREATED, secret).into_response(),
        Err(err) => error_response(err),
    }
}

/// Pull, rebuild and restart the orchestrator itself. Gated on the
/// operator secret; the update runs after the response goes out.
async fn reload(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    if state.operator_secret.is_empty() {
        return error_response(Error::Unauthorized);
    }
    let Some(signature) = signature_header(&headers) else {
        return error_response(Error::Unauthorized);
    };
    if !verify_signature(&state.operator_secret, &body, signature) {
        return error_response(Error::Unauthorized);
    }

    tokio::spawn(server::self_update());
    StatusCode::OK.into_response()
}

fn enqueue(state: &AppState, task: DeployTask) -> Response {
    match state.deploy_tx.try_send(task) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => {
            log::error!("Deploy queue is full, rejecting request");
            StatusCode::TOO_MANY_REQUESTS.into_response()
        }
    }
}

fn signature_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok())
}

/// A request is authorized when its declared signature matches an HMAC of
/// the raw body under the service's stored secret. Missing secrets and
/// malformed headers fail the same way as bad signatures.
fn authorize_service(
    state: &AppState,
    service: &Service,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<()> {
    let secret = state
        .orchestrator
        .keys
        .get_key(service)
        .ok_or(Error::Unauthorized)?;
    let signature = signature_header(headers).ok_or(Error::Unauthorized)?;
    if !verify_signature(&secret, body, signature) {
        log::warn!("Invalid signature for {}", service.repository);
        return Err(Error::Unauthorized);
    }
    Ok(())
}

pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_signature(secret: &str, body: &[u8], declared: &str) -> bool {
    let Some(declared_hex) = declared.strip_prefix("sha1=") else {
        return false;
    };
    let Ok(declared_bytes) = hex::decode(declared_hex) else {
        return false;
    };
    let mut mac =
        Hmac::<Sha1>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    // verify_slice compares in constant time.
    mac.verify_slice(&declared_bytes).is_ok()
}

fn error_response(err: Error) -> Response {
    match err {
        Error::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
        Error::Forbidden => StatusCode::FORBIDDEN.into_response(),
        Error::NotFound(_) => StatusCode::NOT_FOUND.into_response(),
        Error::AlreadyExists(detail) => (StatusCode::BAD_REQUEST, detail).into_response(),
        err => {
            let trace_id = Uuid::new_v4();
            log::error!("[{trace_id}] {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "traceId": trace_id.to_string() })),
            )
                .into_response()
        }
    }
}
