//! Admin API: the action layer in front of [`ControlPlane`]
//!
//! `GET /health` and `GET /version` are public. Every other route needs
//! `Authorization: Bearer <token>`. Mutating routes answer with the
//! [`ApplyReport`](crate::pipeline::ApplyReport) of the resync they caused.

use crate::error::{json_error_response, AdminErrorCode};
use crate::model::{AccessListInput, HostInput, RedirectionInput, StreamInput};
use crate::pipeline::{ApplyError, ApplyReport, ControlPlane};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, AUTHORIZATION};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the control plane
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest request body accepted
const MAX_BODY_BYTES: usize = 1024 * 1024;

type AdminResponse = Response<Full<Bytes>>;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> AdminResponse {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> AdminResponse {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

#[derive(Debug, Deserialize)]
struct GroupRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct EnabledRequest {
    enabled: bool,
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    control: Arc<ControlPlane>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        control: Arc<ControlPlane>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            control,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let control = Arc::clone(&self.control);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, control, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    control: Arc<ControlPlane>,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let control = Arc::clone(&control);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, control, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(headers: &HeaderMap, expected_token: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    control: Arc<ControlPlane>,
    auth_token: Arc<String>,
) -> Result<AdminResponse, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Admin API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version_info.to_string()));
        }
        _ => {}
    }

    if !check_auth(req.headers(), &auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(json_error_response(AdminErrorCode::Unauthorized, "unauthorized"));
    }

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Ok(json_error_response(
                AdminErrorCode::InvalidBody,
                format!("Failed to read body: {}", e),
            ));
        }
    };

    Ok(route(&control, &method, &path, &body)
        .await
        .unwrap_or_else(|rejection| rejection))
}

/// Dispatch an authorized request. `Err` carries the error response.
async fn route(
    control: &ControlPlane,
    method: &Method,
    path: &str,
    body: &Bytes,
) -> Result<AdminResponse, AdminResponse> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        // Hosts
        (&Method::GET, ["hosts"]) => listing(control.database().list_hosts()),
        (&Method::POST, ["hosts"]) => {
            let input: HostInput = parse_body(body)?;
            applied(control.create_host(input).await, StatusCode::CREATED)
        }
        (&Method::PUT, ["hosts", id]) => {
            let id = parse_id(id)?;
            let input: HostInput = parse_body(body)?;
            applied(control.update_host(id, input).await, StatusCode::OK)
        }
        (&Method::DELETE, ["hosts", id]) => {
            let id = parse_id(id)?;
            applied(control.delete_host(id).await, StatusCode::OK)
        }
        (&Method::POST, ["hosts", id, "toggle"]) => {
            let id = parse_id(id)?;
            applied(control.toggle_host(id).await, StatusCode::OK)
        }
        (&Method::PUT, ["hosts", id, "enabled"]) => {
            let id = parse_id(id)?;
            let request: EnabledRequest = parse_body(body)?;
            applied(control.set_host_enabled(id, request.enabled).await, StatusCode::OK)
        }

        // Groups
        (&Method::GET, ["groups"]) => listing(control.database().list_groups()),
        (&Method::POST, ["groups"]) => {
            let request: GroupRequest = parse_body(body)?;
            applied(control.create_group(&request.name).await, StatusCode::CREATED)
        }
        (&Method::PUT, ["groups", id]) => {
            let id = parse_id(id)?;
            let request: GroupRequest = parse_body(body)?;
            applied(control.rename_group(id, &request.name).await, StatusCode::OK)
        }
        (&Method::DELETE, ["groups", id]) => {
            let id = parse_id(id)?;
            applied(control.delete_group(id).await, StatusCode::OK)
        }

        // Access lists
        (&Method::GET, ["access-lists"]) => listing(control.database().list_access_lists()),
        (&Method::POST, ["access-lists"]) => {
            let input: AccessListInput = parse_body(body)?;
            applied(control.create_access_list(input).await, StatusCode::CREATED)
        }
        (&Method::PUT, ["access-lists", id]) => {
            let id = parse_id(id)?;
            let input: AccessListInput = parse_body(body)?;
            applied(control.update_access_list(id, input).await, StatusCode::OK)
        }
        (&Method::DELETE, ["access-lists", id]) => {
            let id = parse_id(id)?;
            applied(control.delete_access_list(id).await, StatusCode::OK)
        }

        // Redirections
        (&Method::POST, ["redirections"]) => {
            let input: RedirectionInput = parse_body(body)?;
            applied(control.create_redirection(input).await, StatusCode::CREATED)
        }
        (&Method::PUT, ["redirections", id]) => {
            let id = parse_id(id)?;
            let input: RedirectionInput = parse_body(body)?;
            applied(control.update_redirection(id, input).await, StatusCode::OK)
        }
        (&Method::DELETE, ["redirections", id]) => {
            let id = parse_id(id)?;
            applied(control.delete_redirection(id).await, StatusCode::OK)
        }

        // Streams
        (&Method::POST, ["streams"]) => {
            let input: StreamInput = parse_body(body)?;
            applied(control.create_stream(input).await, StatusCode::CREATED)
        }
        (&Method::PUT, ["streams", id]) => {
            let id = parse_id(id)?;
            let input: StreamInput = parse_body(body)?;
            applied(control.update_stream(id, input).await, StatusCode::OK)
        }
        (&Method::DELETE, ["streams", id]) => {
            let id = parse_id(id)?;
            applied(control.delete_stream(id).await, StatusCode::OK)
        }

        // Settings
        (&Method::GET, ["settings"]) => listing(control.database().get_settings()),
        (&Method::PUT, ["settings"]) => {
            let values: HashMap<String, String> = parse_body(body)?;
            applied(control.update_settings(values).await, StatusCode::OK)
        }

        (&Method::POST, ["resync"]) => applied(control.resync().await, StatusCode::OK),

        _ => Err(json_error_response(AdminErrorCode::NotFound, "not found")),
    }
}

fn parse_id(segment: &str) -> Result<i64, AdminResponse> {
    segment.parse().map_err(|_| {
        json_error_response(
            AdminErrorCode::NotFound,
            format!("'{}' is not a valid id", segment),
        )
    })
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, AdminResponse> {
    serde_json::from_slice(body).map_err(|e| {
        json_error_response(AdminErrorCode::InvalidBody, format!("Invalid JSON: {}", e))
    })
}

fn listing<T: Serialize>(result: anyhow::Result<T>) -> Result<AdminResponse, AdminResponse> {
    let items = result.map_err(|e| {
        error!(error = %format!("{:#}", e), "Store read failed");
        json_error_response(AdminErrorCode::StoreError, format!("{:#}", e))
    })?;
    to_json(StatusCode::OK, &items)
}

fn applied(
    result: Result<ApplyReport, ApplyError>,
    status: StatusCode,
) -> Result<AdminResponse, AdminResponse> {
    match result {
        Ok(report) => to_json(status, &report),
        Err(e) => {
            let code = AdminErrorCode::from(&e);
            if code.status_code().is_server_error() {
                error!(error = %e, "Admin action failed");
            } else {
                debug!(error = %e, "Admin action rejected");
            }
            Err(json_error_response(code, e.to_string()))
        }
    }
}

fn to_json<T: Serialize>(status: StatusCode, value: &T) -> Result<AdminResponse, AdminResponse> {
    serde_json::to_string(value)
        .map(|body| json_response(status, body))
        .map_err(|e| json_error_response(AdminErrorCode::InternalError, e.to_string()))
}
