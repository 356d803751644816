use anyhow::{Context as _, Result};
use bytes::Bytes;
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use rustls::{server::WebPkiClientVerifier, RootCertStore, ServerConfig};
use std::{net::SocketAddr, path::Path, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, info, info_span, Instrument};
use vcluster_gateway_certs::CertStore;
use vcluster_gateway_proxy::{BoxError, PeerCertificate, Response};

/// Builds a TLS configuration that serves the store's current certificate.
///
/// With a client CA, client certificates are verified when presented; they
/// are never required since most clients authenticate with tokens.
pub(crate) fn tls_config(store: &CertStore, client_ca: Option<&Path>) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)?;

    let builder = match client_ca {
        Some(path) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("failed to read client CA {}", path.display()))?;
            let mut roots = RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                roots.add(cert?)?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .allow_unauthenticated()
                .build()?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder.with_cert_resolver(store.resolver());
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Serves `svc` over TLS until the drain is signaled, then waits for open
/// connections to finish.
pub(crate) async fn serve<S>(
    name: &'static str,
    addr: SocketAddr,
    tls: Arc<ServerConfig>,
    svc: S,
    drain: drain::Watch,
) -> Result<()>
where
    S: tower::Service<http::Request<Incoming>, Response = Response>
        + Clone
        + Send
        + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {name} listener on {addr}"))?;
    let acceptor = TlsAcceptor::from(tls);
    info!(%addr, "{name} server listening");

    loop {
        let (tcp, client) = tokio::select! {
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    debug!(%error, "Failed to accept connection");
                    continue;
                }
            },
            release = drain.clone().signaled() => {
                drop(release);
                info!(%addr, "{name} server shutting down");
                return Ok(());
            }
        };

        tokio::spawn(
            serve_conn(tcp, acceptor.clone(), svc.clone(), drain.clone())
                .instrument(info_span!("conn", %client)),
        );
    }
}

async fn serve_conn<S>(tcp: TcpStream, acceptor: TlsAcceptor, svc: S, drain: drain::Watch)
where
    S: tower::Service<http::Request<Incoming>, Response = Response>
        + Clone
        + Send
        + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    let tls = match acceptor.accept(tcp).await {
        Ok(tls) => tls,
        Err(error) => {
            debug!(%error, "TLS handshake failed");
            return;
        }
    };
    let peer = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|chain| chain.first())
        .map(|leaf| PeerCertificate(Bytes::copy_from_slice(leaf.as_ref())));

    let svc = hyper::service::service_fn(move |mut req: http::Request<Incoming>| {
        if let Some(peer) = peer.clone() {
            req.extensions_mut().insert(peer);
        }
        svc.clone().oneshot(req)
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(tls), svc);
    tokio::pin!(conn);
    let res = tokio::select! {
        res = conn.as_mut() => res,
        release = drain.signaled() => {
            conn.as_mut().graceful_shutdown();
            let res = conn.await;
            drop(release);
            res
        }
    };
    if let Err(error) = res {
        debug!(%error, "Connection closed with an error");
    }
}
