//! Control panel HTTP API
//!
//! A thin dispatch table over [`LifecycleController`]. Successful responses
//! are `{"data": ...}`, failures are `{"error": ..., "code": ...}` with the
//! code repeated in the `X-Mockgate-Error` header.

use crate::controller::{LifecycleController, StartRequest};
use crate::error::{json_error_response, ControlError, ErrorCode};
use base64::Engine as _;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE, HOST};
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const CONFIGS_PREFIX: &str = "/mock/api/configs/";
const DOWNLOAD_SUFFIX: &str = "/download";

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Wrap `data` as `{"data": ...}`
fn data_response<T: Serialize>(status: StatusCode, data: &T) -> Response<Full<Bytes>> {
    #[derive(Serialize)]
    struct Envelope<'a, T: Serialize> {
        data: &'a T,
    }

    match serde_json::to_vec(&Envelope { data }) {
        Ok(body) => json_response(status, body),
        Err(e) => json_error_response(
            ErrorCode::InternalError,
            format!("failed to encode response: {}", e),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    port: i64,
}

/// Basic auth credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    user: String,
    password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Check an `Authorization: Basic ...` header value
    pub fn matches(&self, header: &str) -> bool {
        parse_basic_auth(header)
            .map(|(user, password)| user == self.user && password == self.password)
            .unwrap_or(false)
    }
}

/// Decode `Basic base64(user:password)` into its two halves
pub fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?.trim();
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn check_auth(headers: &HeaderMap, credentials: &Credentials) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| credentials.matches(auth))
        .unwrap_or(false)
}

/// A path under `/mock/api/configs/`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigRoute<'a> {
    Document(&'a str),
    Download(&'a str),
}

pub fn parse_config_path(path: &str) -> Option<ConfigRoute<'_>> {
    let rest = path.strip_prefix(CONFIGS_PREFIX)?;
    let route = match rest.strip_suffix(DOWNLOAD_SUFFIX) {
        Some(name) => ConfigRoute::Download(name),
        None => ConfigRoute::Document(rest),
    };

    match route {
        ConfigRoute::Document(name) | ConfigRoute::Download(name) if name.is_empty() => None,
        route => Some(route),
    }
}

/// Percent-decode a filename path segment
pub fn decode_filename(segment: &str) -> Result<String, ControlError> {
    urlencoding::decode(segment)
        .map(|name| name.into_owned())
        .map_err(|_| {
            ControlError::InvalidInput(format!("filename is not valid UTF-8: {}", segment))
        })
}

/// HTTP front end of the control panel
pub struct ApiServer {
    bind_addr: SocketAddr,
    controller: Arc<LifecycleController>,
    shutdown_rx: watch::Receiver<bool>,
    credentials: Arc<Credentials>,
}

impl ApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        controller: Arc<LifecycleController>,
        shutdown_rx: watch::Receiver<bool>,
        credentials: Credentials,
    ) -> Self {
        Self {
            bind_addr,
            controller,
            shutdown_rx,
            credentials: Arc::new(credentials),
        }
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Control panel API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control panel API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "API request");

        match (&method, path.as_str()) {
            (&Method::GET, "/mock") => {
                return Ok(data_response(StatusCode::OK, &"Server is running!"));
            }
            (&Method::GET, "/mock/api/health") => {
                let health = serde_json::json!({
                    "status": "ok",
                    "time": chrono::Utc::now(),
                    "os": std::env::consts::OS,
                    "arch": std::env::consts::ARCH,
                    "version": VERSION,
                });
                return Ok(data_response(StatusCode::OK, &health));
            }
            _ => {}
        }

        if !check_auth(req.headers(), &self.credentials) {
            warn!(%path, "Unauthorized API request");
            return Ok(json_error_response(ErrorCode::Unauthorized, "unauthorized"));
        }

        let result = self.route(method, &path, req).await;
        Ok(result.unwrap_or_else(|e| {
            if e.code().status_code().is_server_error() {
                warn!(%path, error = %e, "API request failed");
            } else {
                debug!(%path, error = %e, "API request rejected");
            }
            (&e).into()
        }))
    }

    async fn route(
        &self,
        method: Method,
        path: &str,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, ControlError> {
        match (method, path) {
            (Method::POST, "/mock/api/start") => {
                let request: StartRequest = read_json(req).await?;
                let started = self.controller.start(request).await?;
                Ok(data_response(StatusCode::OK, &started))
            }
            (Method::POST, "/mock/api/stop") => {
                let request: StopRequest = read_json(req).await?;
                let port = u16::try_from(request.port).map_err(|_| {
                    ControlError::InvalidInput(format!("invalid port {}", request.port))
                })?;
                let stopped = self.controller.stop(port).await?;
                Ok(data_response(StatusCode::OK, &stopped))
            }
            (Method::GET, "/mock/api/status") => {
                let report = self.controller.status()?;
                Ok(data_response(StatusCode::OK, &report))
            }
            (Method::GET, "/mock/api/configs") => {
                let host = req
                    .headers()
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let configs = self.controller.list_configs(host.as_deref())?;
                Ok(data_response(StatusCode::OK, &configs))
            }
            (method, path) => match (method, parse_config_path(path)) {
                (Method::PUT, Some(ConfigRoute::Document(segment))) => {
                    let filename = decode_filename(segment)?;
                    let body = read_body(req).await?;
                    let saved = self.controller.upload_config(&filename, &body)?;
                    Ok(data_response(
                        StatusCode::CREATED,
                        &serde_json::json!({ "configFile": saved }),
                    ))
                }
                (Method::DELETE, Some(ConfigRoute::Document(segment))) => {
                    let filename = decode_filename(segment)?;
                    self.controller.delete_config(&filename)?;
                    Ok(data_response(
                        StatusCode::OK,
                        &serde_json::json!({ "configFile": filename, "deleted": true }),
                    ))
                }
                (Method::GET, Some(ConfigRoute::Download(segment))) => {
                    let filename = decode_filename(segment)?;
                    let bytes = self.controller.download_config(&filename)?;
                    Ok(download_response(&filename, bytes))
                }
                _ => Ok(json_error_response(ErrorCode::NotFound, "not found")),
            },
        }
    }
}

fn download_response(filename: &str, bytes: Vec<u8>) -> Response<Full<Bytes>> {
    let disposition = format!(
        "attachment; filename=\"{}\"",
        crate::store::sanitize_filename(filename).replace('"', "")
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .header(CONTENT_DISPOSITION, disposition)
        .body(Full::new(Bytes::from(bytes)))
        .unwrap_or_else(|e| json_error_response(ErrorCode::InternalError, e.to_string()))
}

async fn read_body(req: Request<hyper::body::Incoming>) -> Result<Bytes, ControlError> {
    req.collect()
        .await
        .map(|body| body.to_bytes())
        .map_err(|e| ControlError::InvalidInput(format!("failed to read request body: {}", e)))
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<hyper::body::Incoming>,
) -> Result<T, ControlError> {
    let body = read_body(req).await?;
    serde_json::from_slice(&body)
        .map_err(|e| ControlError::InvalidInput(format!("invalid request body: {}", e)))
}
