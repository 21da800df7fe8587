use crate::{
    manager::{AuthzError, EgressRequest, IngressRequest, Manager},
    peer::{PeerAuthorizeRequest, PeerAuthorizeResponse, AUTHORIZE_PATH, HEARTBEAT_PATH},
    tls::PeerIdentity,
};
use bytes::Bytes;
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use mesh_control_plane_core::{Decider, ResourceId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{net::IpAddr, sync::Arc};
use thiserror::Error;
use tracing::{debug, trace, warn};

pub const EGRESS_PATH: &str = "/authz/egress";
pub const INGRESS_PATH: &str = "/authz/ingress";

/// Names the requesting peer on peer API requests served without TLS. Only
/// honored by an [`Api`] built with [`Api::with_client_id_header`].
pub const CLIENT_ID_HEADER: &str = "mesh-client-id";

/// Serves the local dataplane's authorization requests and the peer API.
///
/// Peer API requests are attributed to the [`PeerIdentity`] of the connection
/// they arrive on.
pub struct Api<D> {
    manager: Arc<Manager<D>>,
    client_id_header: bool,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[source] BoxError),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Body = http_body_util::Full<Bytes>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EgressBody {
    import_name: String,
    import_namespace: String,
    client_ip: IpAddr,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EgressReply {
    allowed: bool,
    service_exists: bool,
    target_cluster: Option<String>,
    bearer_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngressReply {
    target_cluster: String,
}

// === impl Api ===

impl<D> Clone for Api<D> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            client_id_header: self.client_id_header,
        }
    }
}

impl<D, B> tower::Service<Request<B>> for Api<D>
where
    D: Decider,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        trace!(method = %req.method(), path = req.uri().path());
        let api = self.clone();
        Box::pin(async move { api.handle(req).await })
    }
}

impl<D: Decider> Api<D> {
    pub fn new(manager: Arc<Manager<D>>) -> Self {
        Self {
            manager,
            client_id_header: false,
        }
    }

    /// Trusts [`CLIENT_ID_HEADER`] to name the requesting peer when the
    /// connection carries no verified identity. Any client can set the header.
    pub fn with_client_id_header(self) -> Self {
        Self {
            client_id_header: true,
            ..self
        }
    }

    async fn handle<B>(self, req: Request<B>) -> Result<Response<Body>, Error>
    where
        B: hyper::body::Body,
        B::Error: Into<BoxError>,
    {
        match (req.method(), req.uri().path()) {
            (&http::Method::POST, EGRESS_PATH) => self.egress(req).await,
            (&http::Method::POST, INGRESS_PATH) => self.ingress(req.headers()),
            (&http::Method::POST, AUTHORIZE_PATH) => self.peer_authorize(req).await,
            (&http::Method::GET, HEARTBEAT_PATH) => Ok(text(http::StatusCode::OK, "ok")),
            _ => Ok(text(http::StatusCode::NOT_FOUND, "not found")),
        }
    }

    async fn egress<B>(&self, req: Request<B>) -> Result<Response<Body>, Error>
    where
        B: hyper::body::Body,
        B::Error: Into<BoxError>,
    {
        let body = match read_json::<EgressBody, _>(req).await? {
            Ok(body) => body,
            Err(rsp) => return Ok(rsp),
        };
        debug!(?body);

        let req = EgressRequest {
            import: ResourceId::new(body.import_namespace, body.import_name),
            client_ip: body.client_ip,
        };
        match self.manager.authorize_egress(req).await {
            Ok(rsp) if !rsp.service_exists => {
                Ok(text(http::StatusCode::NOT_FOUND, "import not found"))
            }
            Ok(rsp) if !rsp.allowed => {
                Ok(text(http::StatusCode::UNAUTHORIZED, "connection denied"))
            }
            Ok(rsp) => json_response(&EgressReply {
                allowed: true,
                service_exists: true,
                target_cluster: rsp.target_cluster,
                bearer_token: rsp.access_token,
            }),
            Err(error) => Ok(error_response(&error)),
        }
    }

    fn ingress(&self, headers: &http::HeaderMap) -> Result<Response<Body>, Error> {
        let Some(token) = bearer_token(headers) else {
            return Ok(text(http::StatusCode::BAD_REQUEST, "missing bearer token"));
        };

        match self.manager.verify_token(token) {
            Ok(target_cluster) => json_response(&IngressReply { target_cluster }),
            Err(error) => Ok(error_response(&error)),
        }
    }

    async fn peer_authorize<B>(&self, req: Request<B>) -> Result<Response<Body>, Error>
    where
        B: hyper::body::Body,
        B::Error: Into<BoxError>,
    {
        let Some(peer) = self.client_identity(&req) else {
            return Ok(text(
                http::StatusCode::UNAUTHORIZED,
                "missing client identity",
            ));
        };
        let body = match read_json::<PeerAuthorizeRequest, _>(req).await? {
            Ok(body) => body,
            Err(rsp) => return Ok(rsp),
        };

        let req = IngressRequest {
            service: ResourceId::new(body.service_namespace, body.service_name),
            peer,
        };
        match self.manager.authorize_ingress(req) {
            Ok(rsp) => json_response(&PeerAuthorizeResponse {
                service_exists: rsp.service_exists,
                allowed: rsp.allowed,
                access_token: rsp.access_token,
            }),
            Err(error) => Ok(error_response(&error)),
        }
    }

    fn client_identity<B>(&self, req: &Request<B>) -> Option<String> {
        if let Some(PeerIdentity(peer)) = req.extensions().get::<PeerIdentity>() {
            return Some(peer.clone());
        }
        if !self.client_id_header {
            return None;
        }
        req.headers()
            .get(CLIENT_ID_HEADER)?
            .to_str()
            .ok()
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

/// Reads a JSON request body. Malformed bodies yield a ready 400 response.
async fn read_json<T, B>(req: Request<B>) -> Result<Result<T, Response<Body>>, Error>
where
    T: DeserializeOwned,
    B: hyper::body::Body,
    B::Error: Into<BoxError>,
{
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::Request(e.into()))?
        .to_bytes();
    Ok(serde_json::from_slice(&bytes).map_err(|error| {
        warn!(%error, "Failed to parse request body");
        text(http::StatusCode::BAD_REQUEST, &error.to_string())
    }))
}

fn bearer_token(headers: &http::HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn error_response(error: &AuthzError) -> Response<Body> {
    let status = error.status();
    if status.is_server_error() {
        warn!(%error, "Failed to authorize request");
    } else {
        debug!(%error, "Rejected request");
    }
    text(status, &error.to_string())
}

fn json_response<T: Serialize>(rsp: &T) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("json response must be valid"))
}

fn text(status: http::StatusCode, msg: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Body::from(format!("{msg}\n")))
        .expect("text response must be valid")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::manager::tests::{allow_all, granted, mk_import, mk_manager, mk_policy};
    use mesh_control_plane_core::{Export, Selector, PEER_NAME_LABEL};
    use mesh_control_plane_index::ControlIndex;

    pub(crate) fn api() -> Api<ControlIndex> {
        let (manager, _) = mk_manager(&[("east", Ok(granted("tok-0")))]);
        manager.add_import(mk_import(&["east"])).unwrap();
        manager.add_export(Export {
            id: ResourceId::new("ns-0", "web"),
            host: "web.ns-0".to_string(),
            port: 8080,
        });
        manager
            .add_policy(mk_policy(
                ResourceId::new("ns-0", "from-east"),
                Selector::from_iter(Some((PEER_NAME_LABEL, "east"))),
                Selector::default(),
            ))
            .unwrap();
        Api::new(Arc::new(manager))
    }

    fn post(path: &str) -> http::request::Builder {
        Request::builder().method(http::Method::POST).uri(path)
    }

    fn peer_authorize(peer: &str) -> http::request::Builder {
        post(AUTHORIZE_PATH).extension(PeerIdentity(peer.to_string()))
    }

    fn bearer(token: &str) -> http::request::Builder {
        post(INGRESS_PATH).header(http::header::AUTHORIZATION, format!("Bearer {token}"))
    }

    const WEB: &str = r#"{"serviceName":"web","serviceNamespace":"ns-0"}"#;

    async fn send(
        api: &Api<ControlIndex>,
        req: http::request::Builder,
        body: &str,
    ) -> (http::StatusCode, serde_json::Value) {
        let req = req.body(Body::from(body.to_string())).unwrap();
        let rsp = api.clone().handle(req).await.unwrap();
        let status = rsp.status();
        let bytes = rsp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    const EGRESS: &str = r#"{"importName":"svc","importNamespace":"ns-0","clientIp":"10.0.0.1"}"#;

    #[tokio::test]
    async fn egress_allowed() {
        let api = api();
        allow_all(&api.manager, "ns-0");

        let (status, json) = send(&api, post(EGRESS_PATH), EGRESS).await;
        assert_eq!(status, http::StatusCode::OK);
        assert_eq!(
            json,
            serde_json::json!({
                "allowed": true,
                "serviceExists": true,
                "targetCluster": "remote-peer/east",
                "bearerToken": "tok-0",
            })
        );
    }

    #[tokio::test]
    async fn egress_denied() {
        let api = api();
        let (status, _) = send(&api, post(EGRESS_PATH), EGRESS).await;
        assert_eq!(status, http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn egress_unknown_import() {
        let api = api();
        let body = r#"{"importName":"nope","importNamespace":"ns-0","clientIp":"10.0.0.1"}"#;
        let (status, _) = send(&api, post(EGRESS_PATH), body).await;
        assert_eq!(status, http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn egress_malformed_body() {
        let api = api();
        let body = r#"{"importName":"svc"}"#;
        let (status, _) = send(&api, post(EGRESS_PATH), body).await;
        assert_eq!(status, http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn peer_authorization_then_ingress() {
        let api = api();
        let (status, json) = send(&api, peer_authorize("east"), WEB).await;
        assert_eq!(status, http::StatusCode::OK);
        assert_eq!(json["serviceExists"], true);
        assert_eq!(json["allowed"], true);
        let token = json["accessToken"].as_str().unwrap().to_string();

        let (status, json) = send(&api, bearer(&token), "").await;
        assert_eq!(status, http::StatusCode::OK);
        assert_eq!(json, serde_json::json!({ "targetCluster": "export/ns-0/web" }));
    }

    #[tokio::test]
    async fn peer_authorization_denied() {
        let api = api();
        let (status, json) = send(&api, peer_authorize("west"), WEB).await;
        assert_eq!(status, http::StatusCode::OK);
        assert_eq!(
            json,
            serde_json::json!({ "serviceExists": true, "allowed": false })
        );
    }

    #[tokio::test]
    async fn peer_authorization_requires_identity() {
        let api = api();
        let (status, _) = send(&api, post(AUTHORIZE_PATH), WEB).await;
        assert_eq!(status, http::StatusCode::UNAUTHORIZED);

        let req = post(AUTHORIZE_PATH).header(CLIENT_ID_HEADER, "east");
        let (status, _) = send(&api, req, WEB).await;
        assert_eq!(
            status,
            http::StatusCode::UNAUTHORIZED,
            "the client id header is not trusted by default"
        );
    }

    #[tokio::test]
    async fn client_id_header() {
        let api = api().with_client_id_header();
        let req = post(AUTHORIZE_PATH).header(CLIENT_ID_HEADER, "east");
        let (status, json) = send(&api, req, WEB).await;
        assert_eq!(status, http::StatusCode::OK);
        assert_eq!(json["allowed"], true);

        // A verified identity takes precedence.
        let req = peer_authorize("west").header(CLIENT_ID_HEADER, "east");
        let (_, json) = send(&api, req, WEB).await;
        assert_eq!(json["allowed"], false);
    }

    #[tokio::test]
    async fn ingress_rejects_expired_tokens() {
        let api = api();
        let token = crate::token::tests::expired(&ResourceId::new("ns-0", "web"));
        let (status, _) = send(&api, bearer(&token), "").await;
        assert_eq!(status, http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ingress_rejects_bad_tokens() {
        let api = api();
        let (status, _) = send(&api, post(INGRESS_PATH), "").await;
        assert_eq!(status, http::StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &api,
            post(INGRESS_PATH).header(http::header::AUTHORIZATION, "Basic Zm9vOmJhcg=="),
            "",
        )
        .await;
        assert_eq!(status, http::StatusCode::BAD_REQUEST);

        let (status, _) = send(&api, bearer("not-a-jwt"), "").await;
        assert_eq!(status, http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn heartbeat_and_unknown_paths() {
        let api = api();
        let req = Request::builder().uri(HEARTBEAT_PATH);
        let (status, _) = send(&api, req, "").await;
        assert_eq!(status, http::StatusCode::OK);

        let req = Request::builder().uri("/nope");
        let (status, _) = send(&api, req, "").await;
        assert_eq!(status, http::StatusCode::NOT_FOUND);

        let req = Request::builder().uri(EGRESS_PATH);
        let (status, _) = send(&api, req, "").await;
        assert_eq!(status, http::StatusCode::NOT_FOUND, "egress requires POST");
    }
}
