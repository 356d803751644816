use bytes::Bytes;
use http::{request::Parts, uri::PathAndQuery, HeaderMap, Uri};
use hyper::upgrade::OnUpgrade;
use vcluster_gateway_core::{Authenticated, RequestInfo};

/// Everything the gateway resolved about a request before routing it.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub info: RequestInfo,
    /// The identity the request acts as, after impersonation.
    pub user: Authenticated,
    /// Set when the request carried impersonation headers that were honored.
    pub impersonated: bool,
    pub node: Option<String>,
    /// The request was admitted only by the authorization chain's fallback,
    /// so requests the gateway answers itself must pass virtual RBAC.
    pub needs_rbac: bool,
}

/// The client's TLS leaf certificate, inserted by the listener.
#[derive(Clone, Debug)]
pub struct PeerCertificate(pub Bytes);

/// A buffered request moving through the pipeline.
#[derive(Debug)]
pub struct ProxyRequest {
    pub parts: Parts,
    pub body: Bytes,
    pub cx: RequestContext,
    pub upgrade: Option<OnUpgrade>,
}

// === impl ProxyRequest ===

impl ProxyRequest {
    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn query(&self) -> Option<&str> {
        self.parts.uri.query()
    }

    pub fn header_str(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Replaces the path while keeping the query.
    pub fn set_path(&mut self, path: &str) -> Result<(), http::Error> {
        let query = self.parts.uri.query().map(str::to_string);
        self.set_path_and_query(path, query.as_deref())
    }

    pub fn set_path_and_query(&mut self, path: &str, query: Option<&str>) -> Result<(), http::Error> {
        let pq = match query {
            Some(q) if !q.is_empty() => format!("{path}?{q}"),
            _ => path.to_string(),
        };
        let pq = PathAndQuery::try_from(pq)?;
        self.parts.uri = Uri::from(pq);
        Ok(())
    }
}
