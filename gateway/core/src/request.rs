//! Classifies inbound API requests the way the Kubernetes API server does.
//!
//! A request path is either a resource request (`/api/v1/...` or
//! `/apis/<group>/<version>/...`) or a non-resource request (discovery,
//! health and anything else). Resource requests are broken down into their
//! verb, group, version, namespace, resource, subresource and name.

use http::Method;
use std::borrow::Cow;


#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestInfo {
    pub is_resource_request: bool,
    pub path: String,
    pub verb: String,

    pub api_prefix: String,
    pub api_group: String,
    pub api_version: String,
    pub namespace: String,
    pub resource: String,
    pub subresource: String,
    pub name: String,
    pub parts: Vec<String>,
}

const API_PREFIXES: [&str; 2] = ["api", "apis"];
const GROUPLESS_PREFIX: &str = "api";

/// Subresources of `namespaces` that must not be treated as a namespace scope.
const NAMESPACE_SUBRESOURCES: [&str; 2] = ["status", "finalize"];

// === impl RequestInfo ===

impl RequestInfo {
    pub fn parse(method: &Method, path: &str, query: Option<&str>) -> Self {
        let mut info = Self {
            path: path.to_string(),
            verb: method.as_str().to_ascii_lowercase(),
            ..Self::default()
        };

        let mut parts = split_path(path);
        if parts.len() < 3 || !API_PREFIXES.contains(&parts[0].as_str()) {
            return info;
        }

        info.api_prefix = parts.remove(0);
        if info.api_prefix != GROUPLESS_PREFIX {
            // `/apis/<group>/<version>` is discovery.
            if parts.len() < 3 {
                return info;
            }
            info.api_group = parts.remove(0);
        }
        info.api_version = parts.remove(0);
        info.is_resource_request = true;

        // `/api/v1/watch/...` and `/api/v1/proxy/...` carry their verb in the path.
        if parts[0] == "watch" || parts[0] == "proxy" {
            if parts.len() < 2 {
                info.is_resource_request = false;
                return info;
            }
            info.verb = parts.remove(0);
        } else {
            info.verb = match *method {
                Method::POST => "create",
                Method::GET | Method::HEAD => "get",
                Method::PUT => "update",
                Method::PATCH => "patch",
                Method::DELETE => "delete",
                _ => "",
            }
            .to_string();
        }

        if parts[0] == "namespaces" {
            if parts.len() > 1 {
                info.namespace = parts[1].clone();
                if parts.len() > 2 && !NAMESPACE_SUBRESOURCES.contains(&parts[2].as_str()) {
                    parts.drain(..2);
                }
            }
        }

        if parts.len() >= 3 && info.verb != "proxy" {
            info.subresource = parts[2].clone();
        }
        if parts.len() >= 2 {
            info.name = parts[1].clone();
        }
        info.resource = parts[0].clone();
        info.parts = parts;

        if info.parts.len() == 1 && info.verb == "get" {
            info.verb = "list".to_string();
        }

        let watch = query_param(query, "watch")
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false);
        if (info.verb == "list" || info.verb == "get") && watch && info.name.is_empty() {
            info.verb = "watch".to_string();
        }

        if info.verb == "delete" && info.name.is_empty() {
            info.verb = "deletecollection".to_string();
        }

        // A list narrowed to a single object by field selector is scoped to that name.
        if info.verb == "list" || info.verb == "watch" {
            if let Some(selector) = query_param(query, "fieldSelector") {
                if let Some(name) = selector.strip_prefix("metadata.name=") {
                    if !name.contains(',') {
                        info.name = name.to_string();
                    }
                }
            }
        }

        info
    }

    /// Renders the resource path for this request with the given namespace and
    /// name substituted. Non-resource requests keep their original path.
    pub fn path_for(&self, namespace: &str, name: &str) -> String {
        if !self.is_resource_request {
            return self.path.clone();
        }

        let mut path = String::from("/");
        path.push_str(&self.api_prefix);
        if !self.api_group.is_empty() {
            path.push('/');
            path.push_str(&self.api_group);
        }
        path.push('/');
        path.push_str(&self.api_version);
        if (self.verb == "watch" || self.verb == "proxy")
            && self.path.contains(&format!("/{}/", self.verb))
        {
            path.push('/');
            path.push_str(&self.verb);
        }
        if !namespace.is_empty() && self.resource != "namespaces" {
            path.push_str("/namespaces/");
            path.push_str(namespace);
        }
        path.push('/');
        path.push_str(&self.resource);
        if !name.is_empty() {
            path.push('/');
            path.push_str(name);
        }
        if !self.subresource.is_empty() {
            path.push('/');
            path.push_str(&self.subresource);
        }
        // Anything past the subresource (e.g. a proxied path) is carried verbatim.
        let rest = if self.subresource.is_empty() { 2 } else { 3 };
        for part in self.parts.iter().skip(rest) {
            path.push('/');
            path.push_str(part);
        }
        if self.path.ends_with('/') && (self.parts.len() >= 3 || self.verb == "proxy") {
            path.push('/');
        }
        path
    }

    /// Whether the path addresses a collection. A list narrowed by a
    /// `metadata.name` field selector carries a `name` but is still a
    /// collection request.
    pub fn is_collection(&self) -> bool {
        self.is_resource_request && self.parts.len() == 1
    }

    pub fn is_resource(&self, resource: &str) -> bool {
        self.is_resource_request && self.resource == resource
    }
}

fn split_path(path: &str) -> Vec<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.split('/').map(ToString::to_string).collect()
}

/// Iterates over decoded `key=value` pairs of a query string.
pub fn query_pairs(query: Option<&str>) -> impl Iterator<Item = (Cow<'_, str>, Cow<'_, str>)> {
    query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(k), decode(v))
        })
}

pub fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query_pairs(query)
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Whether the request asks for a dry run; such requests never reach a
/// cross-cluster write.
pub fn is_dry_run(query: Option<&str>) -> bool {
    query_pairs(query).any(|(k, v)| k == "dryRun" && !v.is_empty())
}

fn decode(s: &str) -> Cow<'_, str> {
    if s.contains('+') {
        let s = s.replace('+', " ");
        return Cow::Owned(percent_encoding::percent_decode_str(&s).decode_utf8_lossy().into_owned());
    }
    percent_encoding::percent_decode_str(s).decode_utf8_lossy()
}

/// Percent-encodes a query value.
pub fn encode(s: &str) -> String {
    const QUERY: &percent_encoding::AsciiSet = &percent_encoding::NON_ALPHANUMERIC
        .remove(b'-')
        .remove(b'.')
        .remove(b'_')
        .remove(b'~');
    percent_encoding::utf8_percent_encode(s, QUERY).to_string()
}
