use bytes::Bytes;
use futures::future;
use hyper::{http, Request, Response};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// Serves readiness, liveness and metrics.
#[derive(Clone, Debug)]
pub struct Admin {
    ready: watch::Receiver<bool>,
    registry: Arc<Registry>,
}

type Body = http_body_util::Full<Bytes>;

const METRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

impl<B> tower::Service<Request<B>> for Admin {
    type Response = Response<Body>;
    type Error = std::convert::Infallible;
    type Future = future::Ready<Result<Response<Body>, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        future::ok(self.handle(&req))
    }
}

impl Admin {
    pub fn new(ready: watch::Receiver<bool>, registry: Arc<Registry>) -> Self {
        Self { ready, registry }
    }

    fn handle<B>(&self, req: &Request<B>) -> Response<Body> {
        if !matches!(*req.method(), http::Method::GET | http::Method::HEAD) {
            return Response::builder()
                .status(http::StatusCode::METHOD_NOT_ALLOWED)
                .body(Body::default())
                .expect("method not allowed response must be valid");
        }

        match req.uri().path() {
            "/live" => text(http::StatusCode::OK, "live\n"),
            "/ready" if *self.ready.borrow() => text(http::StatusCode::OK, "ready\n"),
            "/ready" => text(http::StatusCode::INTERNAL_SERVER_ERROR, "not ready\n"),
            "/metrics" => self.metrics(),
            _ => Response::builder()
                .status(http::StatusCode::NOT_FOUND)
                .body(Body::default())
                .expect("not found response must be valid"),
        }
    }

    fn metrics(&self) -> Response<Body> {
        let mut buf = String::new();
        if let Err(error) = prometheus_client::encoding::text::encode(&mut buf, &self.registry) {
            warn!(%error, "Failed to encode metrics");
            return text(http::StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics\n");
        }
        Response::builder()
            .status(http::StatusCode::OK)
            .header(http::header::CONTENT_TYPE, METRICS_CONTENT_TYPE)
            .body(Body::from(buf))
            .expect("metrics response must be valid")
    }
}

fn text(status: http::StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Body::from(body))
        .expect("text response must be valid")
}
