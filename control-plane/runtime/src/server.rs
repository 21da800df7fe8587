use crate::tls::{peer_identity, PeerIdentity};
use hyper::{body::Incoming, server::conn::http1, Request, Response};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, info, warn, Instrument};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Accepts HTTP/1 connections on `listener`, serving each with a clone of `svc`.
///
/// With `tls`, each connection is terminated with it and requests on
/// connections that presented a verified client certificate carry the
/// client's [`PeerIdentity`] as an extension.
pub(crate) async fn serve<S, B>(listener: TcpListener, tls: Option<TlsAcceptor>, svc: S)
where
    S: tower::Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, tls = tls.is_some(), "HTTP server listening");
    }

    loop {
        let (io, client) = match listener.accept().await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(%error, "Failed to accept connection");
                continue;
            }
        };

        let svc = svc.clone();
        let acceptor = tls.clone();
        tokio::spawn(
            async move {
                let Some(acceptor) = acceptor else {
                    return serve_connection(io, None, svc).await;
                };
                let io = match acceptor.accept(io).await {
                    Ok(io) => io,
                    Err(error) => {
                        debug!(%error, "TLS handshake failed");
                        return;
                    }
                };
                let (_, conn) = io.get_ref();
                let identity = conn.peer_certificates().and_then(peer_identity);
                debug!(?identity, "TLS handshake complete");
                serve_connection(io, identity, svc).await
            }
            .instrument(tracing::debug_span!("conn", %client)),
        );
    }
}

async fn serve_connection<I, S, B>(io: I, identity: Option<PeerIdentity>, svc: S)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: tower::Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let svc = svc.map_request(move |mut req: Request<Incoming>| {
        if let Some(identity) = &identity {
            req.extensions_mut().insert(identity.clone());
        }
        req
    });
    if let Err(error) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), TowerToHyperService::new(svc))
        .await
    {
        debug!(%error, "Connection closed with error");
    }
}
