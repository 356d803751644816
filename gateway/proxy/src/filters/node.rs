use crate::{json_response, Error, Filter, Outcome, ProxyRequest, RequestContext};
use bytes::Bytes;
use http::{header, StatusCode};
use kube::{
    api::{Patch, PatchParams},
    Api,
};
use serde_json::{Map, Value};
use tokio::time;
use tracing::{debug, info};
use vcluster_gateway_core::request::is_dry_run;
use vcluster_gateway_k8s_api::{Node, Reason, StatusError};

const POLL_INTERVAL: time::Duration = time::Duration::from_millis(200);
const POLL_TIMEOUT: time::Duration = time::Duration::from_secs(4);

/// Applies node label, taint and capacity changes to the host node and
/// waits for the virtual node to reflect them.
pub struct NodeWrite {
    host: kube::Client,
    virt: kube::Client,
    interval: time::Duration,
    timeout: time::Duration,
}

/// What the incoming request asked for.
#[derive(Debug)]
enum Change {
    Desired(Node),
    /// Server-side apply is left to the virtual API server.
    Apply,
}

// === impl NodeWrite ===

impl NodeWrite {
    pub fn new(host: kube::Client, virt: kube::Client) -> Self {
        Self {
            host,
            virt,
            interval: POLL_INTERVAL,
            timeout: POLL_TIMEOUT,
        }
    }

    pub fn with_poll(mut self, interval: time::Duration, timeout: time::Duration) -> Self {
        self.interval = interval;
        self.timeout = timeout;
        self
    }

    async fn converge(&self, name: &str, previous: &str) -> Result<Node, Error> {
        let nodes = Api::<Node>::all(self.virt.clone());
        let poll = async {
            loop {
                let node = nodes.get(name).await?;
                if node.metadata.resource_version.as_deref() != Some(previous) {
                    return Ok::<_, Error>(node);
                }
                time::sleep(self.interval).await;
            }
        };
        match time::timeout(self.timeout, poll).await {
            Ok(res) => res,
            Err(_) => Err(StatusError::timeout(format!(
                "timed out waiting for node {name} to be updated"
            ))
            .into()),
        }
    }
}

#[async_trait::async_trait]
impl Filter for NodeWrite {
    fn name(&self) -> &'static str {
        "node"
    }

    fn matches(&self, cx: &RequestContext) -> bool {
        let info = &cx.info;
        info.is_resource("nodes")
            && info.api_group.is_empty()
            && !info.name.is_empty()
            && (info.subresource.is_empty() || info.subresource == "status")
            && (info.verb == "update" || info.verb == "patch")
    }

    async fn handle(&self, req: ProxyRequest) -> Result<Outcome, Error> {
        if is_dry_run(req.query()) {
            return Ok(Outcome::Continue(req));
        }

        let info = &req.cx.info;
        let name = info.name.clone();
        let status = info.subresource == "status";
        let current = Api::<Node>::all(self.virt.clone()).get(&name).await?;

        let desired = if info.verb == "update" {
            decode(&req.body)?
        } else {
            match patched(&current, req.header_str(header::CONTENT_TYPE), &req.body)? {
                Change::Desired(node) => node,
                Change::Apply => return Ok(Outcome::Continue(req)),
            }
        };

        let previous = current.metadata.resource_version.clone().unwrap_or_default();
        if let Some(rv) = desired.metadata.resource_version.as_deref() {
            if rv != previous {
                return Err(StatusError::new(
                    Reason::Conflict,
                    format!(
                        "Operation cannot be fulfilled on nodes {name:?}: the object has been modified; please apply your changes to the latest version and try again"
                    ),
                )
                .into());
            }
        }

        let hosts = Api::<Node>::all(self.host.clone());
        let host = hosts.get(&name).await?;
        let mut target = host.clone();
        if status {
            copy_capacity(&desired, &mut target);
        } else {
            copy_labels_and_taints(&desired, &mut target);
        }

        let patch = merge_diff(&to_value(&host)?, &to_value(&target)?);
        if is_empty(&patch) {
            debug!(%name, "Node change does not affect the host");
            return json_response(StatusCode::OK, &current).map(Outcome::Respond);
        }

        info!(%name, status, "Patching host node");
        let params = PatchParams::default();
        if status {
            hosts.patch_status(&name, &params, &Patch::Merge(&patch)).await?;
        } else {
            hosts.patch(&name, &params, &Patch::Merge(&patch)).await?;
        }

        let updated = self.converge(&name, &previous).await?;
        json_response(StatusCode::OK, &updated).map(Outcome::Respond)
    }
}

fn decode(body: &Bytes) -> Result<Node, Error> {
    serde_json::from_slice(body)
        .map_err(|e| StatusError::bad_request(format!("failed to decode node: {e}")).into())
}

fn to_value(node: &Node) -> Result<Value, Error> {
    serde_json::to_value(node).map_err(Error::Encode)
}

fn patched(current: &Node, content_type: Option<&str>, body: &Bytes) -> Result<Change, Error> {
    let content_type = content_type
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .unwrap_or_default();
    let mut doc = to_value(current)?;
    match content_type {
        "application/json-patch+json" => {
            let patch = serde_json::from_slice::<json_patch::Patch>(body)
                .map_err(|e| StatusError::bad_request(format!("invalid JSON patch: {e}")))?;
            json_patch::patch(&mut doc, &patch)
                .map_err(|e| StatusError::new(Reason::Invalid, e.to_string()))?;
        }
        // Labels, taints and capacity carry no strategic merge directives.
        "application/merge-patch+json" | "application/strategic-merge-patch+json" => {
            let patch = serde_json::from_slice::<Value>(body)
                .map_err(|e| StatusError::bad_request(format!("invalid merge patch: {e}")))?;
            json_patch::merge(&mut doc, &patch);
        }
        "application/apply-patch+yaml" => return Ok(Change::Apply),
        other => {
            return Err(StatusError::new(
                Reason::UnsupportedMediaType,
                format!("the body of the request was in an unknown format - accepted media types include: application/json-patch+json, application/merge-patch+json, application/apply-patch+yaml; got {other:?}"),
            )
            .into())
        }
    }
    serde_json::from_value(doc)
        .map(Change::Desired)
        .map_err(|e| StatusError::new(Reason::Invalid, format!("patched node is invalid: {e}")).into())
}

// Absent and empty collections are equivalent; only real changes are copied
// so that an unchanged node yields an empty patch.

fn copy_labels_and_taints(from: &Node, to: &mut Node) {
    let labels = from.metadata.labels.clone().unwrap_or_default();
    if to.metadata.labels.clone().unwrap_or_default() != labels {
        to.metadata.labels = Some(labels);
    }

    let taints = from
        .spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default();
    let current = to.spec.as_ref().and_then(|s| s.taints.as_ref());
    if current.map(Vec::as_slice).unwrap_or_default() != taints.as_slice() {
        to.spec.get_or_insert_with(Default::default).taints = Some(taints);
    }
}

fn copy_capacity(from: &Node, to: &mut Node) {
    let capacity = from
        .status
        .as_ref()
        .and_then(|s| s.capacity.clone())
        .unwrap_or_default();
    let current = to.status.as_ref().and_then(|s| s.capacity.clone());
    if current.unwrap_or_default() != capacity {
        to.status.get_or_insert_with(Default::default).capacity = Some(capacity);
    }
}

/// A JSON merge patch that turns `from` into `to`.
pub(crate) fn merge_diff(from: &Value, to: &Value) -> Value {
    match (from, to) {
        (Value::Object(from), Value::Object(to)) => {
            let mut patch = Map::new();
            for (key, old) in from {
                match to.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new) if new != old => {
                        patch.insert(key.clone(), merge_diff(old, new));
                    }
                    Some(_) => {}
                }
            }
            for (key, new) in to {
                if !from.contains_key(key) {
                    patch.insert(key.clone(), new.clone());
                }
            }
            Value::Object(patch)
        }
        (_, to) => to.clone(),
    }
}

fn is_empty(patch: &Value) -> bool {
    patch.as_object().is_some_and(Map::is_empty)
}
