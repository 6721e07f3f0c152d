use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Accepts connections on `listener` and serves them with `service` until
/// `shutdown` resolves.
///
/// Once `shutdown` resolves the listener is dropped and every accepted
/// connection is told to shut down: requests in progress complete, idle
/// keep-alive connections are closed. Returns only after all of them are gone.
pub async fn run_http_service<S, E, F>(
    listener: TcpListener,
    service: S,
    shutdown: F,
) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, E>>, Error = E>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
    F: Future<Output = ()>,
{
    let service_arc = Arc::new(service);
    let builder = Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    tokio::pin!(shutdown);

    loop {
        let (stream, _peer_addr) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => accepted?,
        };
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service_arc.clone();

        // Hand the connection to hyper; auto-detect h1/h2 on this socket
        let conn = graceful.watch(builder.serve_connection(io, svc).into_owned());
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "connection closed with error");
            }
        });
    }

    drop(listener);
    graceful.shutdown().await;
    Ok(())
}

pub fn full_body<E: 'static>(body: impl Into<Bytes>) -> BoxBody<Bytes, E> {
    Full::new(body.into()).map_err(|e| match e {}).boxed()
}

/// A plain-text response carrying the canonical reason for `status_code`.
pub fn make_boxed_error_response<E: 'static>(status_code: StatusCode) -> Response<BoxBody<Bytes, E>> {
    let message = status_code
        .canonical_reason()
        .unwrap_or("an error occurred");

    let mut response = Response::new(full_body(message));
    *response.status_mut() = status_code;
    response
}

/// Same as [`make_boxed_error_response`] but with a caller supplied message.
pub fn make_error_response<E: 'static>(
    status_code: StatusCode,
    message: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, E>> {
    let mut response = Response::new(full_body(message));
    *response.status_mut() = status_code;
    response
}
