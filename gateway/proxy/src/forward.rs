use crate::{impersonate, BoxError, Error, ProxyRequest, Response};
use futures::future;
use http::{header, HeaderMap, HeaderName};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, trace, Instrument};

/// How the caller's credentials are carried to an upstream API server.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    /// The caller's own `Authorization` and `Impersonate-*` headers are kept.
    /// The client must not carry credentials of its own.
    Passthrough,

    /// The client's credentials replace the caller's.
    Client,

    /// The client's credentials replace the caller's and the request is made
    /// on behalf of the caller's effective identity.
    Impersonate,
}

/// An API server requests are forwarded to.
#[derive(Clone)]
pub struct Upstream {
    client: kube::Client,
    credentials: Credentials,
}

const HOP_BY_HOP: [HeaderName; 6] = [
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::PROXY_AUTHORIZATION,
];

// === impl Upstream ===

impl Upstream {
    pub fn new(client: kube::Client, credentials: Credentials) -> Self {
        Self {
            client,
            credentials,
        }
    }

    pub fn client(&self) -> &kube::Client {
        &self.client
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials
    }

    /// Sends the request upstream as-is, splicing the connection when the
    /// upstream agrees to an upgrade.
    pub async fn forward(&self, req: ProxyRequest) -> Result<Response, Error> {
        let ProxyRequest {
            mut parts,
            body,
            cx,
            upgrade,
        } = req;

        let upgrading = upgrade.is_some();
        strip_hop_by_hop(&mut parts.headers, upgrading);
        match self.credentials {
            Credentials::Passthrough => {}
            Credentials::Client => {
                parts.headers.remove(header::AUTHORIZATION);
                impersonate::strip(&mut parts.headers);
            }
            Credentials::Impersonate => {
                parts.headers.remove(header::AUTHORIZATION);
                impersonate::set(&mut parts.headers, &cx.user.user)?;
            }
        }

        // The client's base URI supplies the scheme and authority.
        if let Some(pq) = parts.uri.path_and_query().cloned() {
            parts.uri = http::Uri::from(pq);
        }
        trace!(method = %parts.method, uri = %parts.uri, credentials = ?self.credentials, "Forwarding");

        let req = http::Request::from_parts(parts, kube::client::Body::from(body));
        let mut rsp = self.client.send(req).await?;

        if rsp.status() == http::StatusCode::SWITCHING_PROTOCOLS {
            match upgrade {
                Some(server) => {
                    let client = hyper::upgrade::on(&mut rsp);
                    tokio::spawn(
                        splice(server, client).instrument(tracing::debug_span!("upgrade")),
                    );
                }
                None => debug!("Upstream switched protocols without a requested upgrade"),
            }
        }

        Ok(rsp.map(|body| body.map_err(Into::<BoxError>::into).boxed_unsync()))
    }

    /// Sends the request and buffers the response. The response is always
    /// requested uncompressed so that it can be decoded.
    pub async fn fetch(&self, mut req: ProxyRequest) -> Result<http::Response<bytes::Bytes>, Error> {
        req.parts.headers.remove(header::ACCEPT_ENCODING);
        let rsp = self.forward(req).await?;
        let (parts, body) = rsp.into_parts();
        let body = body.collect().await.map_err(Error::UpstreamBody)?.to_bytes();
        Ok(http::Response::from_parts(parts, body))
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("credentials", &self.credentials)
            .finish()
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap, upgrading: bool) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    if !upgrading {
        headers.remove(header::CONNECTION);
        headers.remove(header::UPGRADE);
    }
}

/// Copies bytes in both directions once both sides have upgraded.
async fn splice(server: OnUpgrade, client: OnUpgrade) {
    let (server, client) = match future::try_join(server, client).await {
        Ok(both) => both,
        Err(error) => {
            debug!(%error, "HTTP upgrade failed");
            return;
        }
    };
    trace!("HTTP upgrade successful");

    let mut server = TokioIo::new(server);
    let mut client = TokioIo::new(client);
    match tokio::io::copy_bidirectional(&mut server, &mut client).await {
        Ok((tx, rx)) => trace!(tx, rx, "Upgraded connection closed"),
        Err(error) => debug!(%error, "Upgraded connection failed"),
    }
}
