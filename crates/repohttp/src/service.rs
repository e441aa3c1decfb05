//! Upload service and builder.
//!
//! [`UploadService`] is a hyper service handling three routes:
//!
//! - `POST /upload/<token>?X-Progress-ID=<id>`: add a new file
//! - `POST /update/<token>?X-Progress-ID=<id>`: replace an existing file
//! - `GET /upload_progress?X-Progress-ID=<id>&callback=<name>`: JSONP
//!   progress polling
//!
//! The upload routes validate the request at header time (token lookup,
//! multipart boundary, Content-Length, progress id), then consume the body
//! frame by frame through the receive state machine and finally invoke the
//! upload or update handler. The state machine is owned by the request's
//! future; whichever way the request ends (success, parse error, or the
//! client going away), dropping it releases the temp file and the progress
//! registry entry.

use std::borrow::Cow;
use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, StatusCode, Uri};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::UploadConfig;
use crate::error::{RecvError, StdError};
use crate::fsm::RecvFsm;
use crate::handlers;
use crate::http::multipart::extract_boundary;
use crate::progress::{self, Progress};
use crate::repo::Repository;
use crate::temp_sink;

pub(crate) type RespBody = Full<Bytes>;

/// Responses produced by the service.
pub type HttpResponse = Response<RespBody>;

/// Builder for [`UploadService`].
pub struct UploadServiceBuilder {
    repo: Arc<dyn Repository>,
    config: UploadConfig,
}

impl UploadServiceBuilder {
    /// Creates a builder over the given repository back-end with default
    /// configuration.
    #[must_use]
    pub fn new(repo: impl Repository) -> Self {
        Self {
            repo: Arc::new(repo),
            config: UploadConfig::default(),
        }
    }

    /// Replaces the configuration.
    pub fn set_config(&mut self, config: UploadConfig) {
        self.config = config;
    }

    /// Builds the service, initializing the progress registry and creating
    /// the temp directory if it does not exist yet.
    pub fn build(self) -> io::Result<UploadService> {
        progress::init();
        temp_sink::init_temp_dir(&self.config.temp_dir)?;
        Ok(UploadService {
            inner: Arc::new(Inner {
                repo: self.repo,
                config: self.config,
            }),
        })
    }
}

/// The upload front-end service. Cheap to clone.
#[derive(Clone)]
pub struct UploadService {
    inner: Arc<Inner>,
}

struct Inner {
    repo: Arc<dyn Repository>,
    config: UploadConfig,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RouteKind {
    Upload,
    Update,
}

impl UploadService {
    /// Processes one HTTP request and returns the response. All failures
    /// are rendered as responses; this method does not error.
    pub async fn call<B>(&self, req: Request<B>) -> HttpResponse
    where
        B: http_body::Body<Data = Bytes>,
        B::Error: Into<StdError>,
    {
        let path = req.uri().path();
        if req.method() == Method::POST && path.starts_with("/upload/") {
            return self.recv_upload(req, RouteKind::Upload).await;
        }
        if req.method() == Method::POST && path.starts_with("/update/") {
            return self.recv_upload(req, RouteKind::Update).await;
        }
        if req.method() == Method::GET && path.starts_with("/upload_progress") {
            return self.progress_query(req.uri());
        }
        plain_response(StatusCode::NOT_FOUND, "Not found\n")
    }

    async fn recv_upload<B>(&self, req: Request<B>, kind: RouteKind) -> HttpResponse
    where
        B: http_body::Body<Data = Bytes>,
        B::Error: Into<StdError>,
    {
        let (parts, body) = req.into_parts();

        let mut fsm = match self.start_recv(&parts).await {
            Ok(fsm) => fsm,
            Err(resp) => return resp,
        };

        let mut body = Box::pin(body);
        while let Some(frame) = body.frame().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    let err: StdError = err.into();
                    warn!("failed to read request body: {err}");
                    return close_response(StatusCode::BAD_REQUEST, "");
                }
            };
            if let Ok(data) = frame.into_data() {
                if let Err(err) = fsm.feed(&data) {
                    return recv_error_response(&err);
                }
            }
        }

        match kind {
            RouteKind::Upload => {
                handlers::upload(self.inner.repo.as_ref(), &self.inner.config, &fsm).await
            }
            RouteKind::Update => {
                handlers::update(self.inner.repo.as_ref(), &self.inner.config, &fsm).await
            }
        }
        // `fsm` drops here on every path, unlinking the temp file and
        // removing the progress entry.
    }

    /// Header-time validation. Builds the receive machine and registers the
    /// progress entry, or produces the 400 reply to send instead.
    async fn start_recv(&self, parts: &Parts) -> Result<RecvFsm, HttpResponse> {
        // URL format: /[upload|update]/<token>?X-Progress-ID=<uuid>
        let token = parts
            .uri
            .path()
            .rsplit('/')
            .next()
            .filter(|t| !t.is_empty());
        let Some(token) = token else {
            warn!("no token in url");
            return Err(close_response(StatusCode::BAD_REQUEST, "Invalid URL\n"));
        };

        let access = match self.inner.repo.check_access_token(token).await {
            Ok(access) => access,
            Err(err) => {
                warn!("invalid access token: {err}");
                return Err(close_response(StatusCode::BAD_REQUEST, "Access denied\n"));
            }
        };

        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let Some(boundary) = content_type.and_then(extract_boundary) else {
            warn!("missing or invalid Content-Type boundary");
            return Err(close_response(StatusCode::BAD_REQUEST, ""));
        };

        let content_len = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| atoi::atoi::<i64>(v.as_bytes()));
        let Some(content_len) = content_len else {
            warn!("Content-Length not found");
            return Err(close_response(StatusCode::BAD_REQUEST, ""));
        };

        let query = parts.uri.query().unwrap_or("");
        let Some(progress_id) = query_param(query, "X-Progress-ID") else {
            warn!("progress id not found");
            return Err(close_response(StatusCode::BAD_REQUEST, ""));
        };

        let progress = Arc::new(Progress::new(content_len));
        progress::registry().insert(&progress_id, Arc::clone(&progress));

        Ok(RecvFsm::new(
            boundary,
            access,
            self.inner.config.temp_dir.clone(),
            progress_id,
            progress,
        ))
    }

    /// `GET /upload_progress`: answers with a JSONP payload.
    fn progress_query(&self, uri: &Uri) -> HttpResponse {
        let query = uri.query().unwrap_or("");

        let Some(progress_id) = query_param(query, "X-Progress-ID") else {
            warn!("progress id not found in url");
            return plain_response(StatusCode::BAD_REQUEST, "");
        };
        let Some(callback) = query_param(query, "callback") else {
            warn!("callback not found in url");
            return plain_response(StatusCode::BAD_REQUEST, "");
        };

        let Some(progress) = progress::registry().lookup(&progress_id) else {
            warn!("no progress found for {progress_id}");
            return plain_response(StatusCode::BAD_REQUEST, "");
        };

        #[derive(Serialize)]
        struct ProgressPayload {
            uploaded: i64,
            length: i64,
        }

        let payload = serde_json::to_string(&ProgressPayload {
            uploaded: progress.uploaded(),
            length: progress.size(),
        })
        .unwrap_or_else(|_| "{}".to_owned());

        let body = format!("{callback}({payload});");
        debug!("JSONP: {body}");
        plain_response(StatusCode::OK, &body)
    }
}

impl hyper::service::Service<Request<Incoming>> for UploadService {
    type Response = HttpResponse;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<HttpResponse, Infallible>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.call(req).await) })
    }
}

/// Decoded value of the query parameter `name`, if present.
fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| match percent_decode_str(value).decode_utf8_lossy() {
            Cow::Borrowed(s) => s.to_owned(),
            Cow::Owned(s) => s,
        })
    })
}

pub(crate) fn plain_response(status: StatusCode, body: &str) -> HttpResponse {
    let mut resp = Response::new(RespBody::from(Bytes::copy_from_slice(body.as_bytes())));
    *resp.status_mut() = status;
    resp
}

/// A reply that also tells the client the connection will not be reused.
pub(crate) fn close_response(status: StatusCode, body: &str) -> HttpResponse {
    let mut resp = plain_response(status, body);
    resp.headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    resp
}

fn recv_error_response(err: &RecvError) -> HttpResponse {
    match err {
        RecvError::BadRequest(_) => close_response(StatusCode::BAD_REQUEST, ""),
        RecvError::Server(_) => {
            close_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error\n")
        }
    }
}
