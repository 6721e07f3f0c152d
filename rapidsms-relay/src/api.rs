//! HTTP resources exposed by the relay: the authenticated send endpoint at
//! `web_path` and an open `/health` check.

use crate::auth::{AuthError, AuthGateway, Credentials, challenge};
use crate::config::normalize_path;
use crate::dispatcher::{InboundDispatcher, OutboundRequest};
use crate::errors::RelayError;
use crate::metrics_defs::HTTP_REQUEST_DURATION;
use http::header::{CONTENT_TYPE, WWW_AUTHENTICATE};
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use shared::http::{full_body, make_boxed_error_response, make_error_response};
use shared::histogram;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

pub(crate) const HEALTH_PATH: &str = "health";

pub type ApiResponse = Response<BoxBody<Bytes, RelayError>>;

#[derive(Clone)]
pub struct RelayHttpService {
    inner: Arc<Resources>,
}

struct Resources {
    web_path: String,
    gateway: AuthGateway,
    dispatcher: InboundDispatcher,
}

impl RelayHttpService {
    pub fn new(web_path: &str, gateway: AuthGateway, dispatcher: InboundDispatcher) -> Self {
        Self {
            inner: Arc::new(Resources {
                web_path: normalize_path(web_path).to_string(),
                gateway,
                dispatcher,
            }),
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> ApiResponse
    where
        B: hyper::body::Body + Send,
        B::Error: std::fmt::Display,
    {
        let path = normalize_path(req.uri().path());

        if path == HEALTH_PATH {
            return health(req.method());
        }

        if path != self.inner.web_path {
            return make_boxed_error_response(StatusCode::NOT_FOUND);
        }

        match *req.method() {
            Method::GET | Method::POST | Method::PUT => {
                let start = Instant::now();
                let response = self.send(req).await;
                histogram!(HTTP_REQUEST_DURATION, "status" => response.status().as_str().to_string())
                    .record(start.elapsed().as_secs_f64());
                response
            }
            _ => make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    async fn send<B>(&self, req: Request<B>) -> ApiResponse
    where
        B: hyper::body::Body + Send,
        B::Error: std::fmt::Display,
    {
        let identity = match Credentials::from_headers(req.headers()) {
            Ok(credentials) => self.inner.gateway.authenticate(&credentials).await,
            Err(e) => Err(e),
        };
        match identity {
            Ok(identity) => {
                tracing::debug!(
                    method = %req.method(),
                    user = identity.as_deref().unwrap_or("anonymous"),
                    "Send request"
                );
            }
            Err(AuthError::Config(e)) => {
                tracing::error!(error = %e, "cannot authenticate send request");
                return make_error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
            Err(_) => return unauthorized(),
        }

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return make_error_response(StatusCode::BAD_REQUEST, e.to_string());
            }
        };

        let request = match OutboundRequest::decode(&body) {
            Ok(request) => request,
            Err(e) => {
                tracing::info!(error = %e, "rejected send request");
                return make_error_response(StatusCode::BAD_REQUEST, e.to_string());
            }
        };

        let sent = match self.inner.dispatcher.dispatch(request).await {
            Ok(sent) => sent,
            Err(e) => return make_error_response(StatusCode::BAD_REQUEST, e.to_string()),
        };

        match serde_json::to_vec(&sent) {
            Ok(body) => {
                let mut response = Response::new(full_body(body));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    http::HeaderValue::from_static("application/json"),
                );
                response
            }
            Err(e) => make_error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl Service<Request<Incoming>> for RelayHttpService {
    type Response = ApiResponse;
    type Error = RelayError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(req).await) })
    }
}

/// Always 200 `OK` for GET, whatever state the relay is in. Not logged.
fn health(method: &Method) -> ApiResponse {
    match *method {
        Method::GET => Response::new(full_body("OK")),
        _ => make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED),
    }
}

fn unauthorized() -> ApiResponse {
    let mut response = make_boxed_error_response(StatusCode::UNAUTHORIZED);
    response.headers_mut().insert(WWW_AUTHENTICATE, challenge());
    response
}
