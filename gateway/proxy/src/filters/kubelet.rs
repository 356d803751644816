//! Serves kubelet requests addressed to a virtual node by proxying them to
//! the real kubelet through the host API server's node proxy.
//!
//! The host kubelet reports every pod on its node. Pod listings, stats and
//! metrics are cut down to the virtual cluster's pods and renamed.

use crate::{full, Error, Filter, Outcome, ProxyRequest, RequestContext, Response, Upstream};
use bytes::Bytes;
use kube::{api::ListParams, Api};
use regex::{Captures, Regex};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
};
use tracing::debug;
use vcluster_gateway_core::{NamespacedName, Translator};
use vcluster_gateway_k8s_api::{Pod, StatusError};

/// A `namespace` or `pod` label at the start of a label set or after a comma.
static METRIC_LABELS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?P<sep>[{,]\s*)(?P<label>namespace|pod)="(?P<value>(?:[^"\\]|\\.)*)""#)
        .expect("metric label pattern must compile")
});

pub struct FakeKubelet {
    host: Upstream,
    virt: kube::Client,
    translator: Arc<dyn Translator>,
}

/// Maps host pod identities to virtual ones.
type PodIndex = HashMap<NamespacedName, NamespacedName>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Rewrite {
    Pods,
    Summary,
    Metrics,
}

// === impl FakeKubelet ===

impl FakeKubelet {
    pub fn new(host: Upstream, virt: kube::Client, translator: Arc<dyn Translator>) -> Self {
        Self {
            host,
            virt,
            translator,
        }
    }

    /// Indexes the virtual pods scheduled to `node` by their host identity.
    async fn pods(&self, node: &str) -> Result<PodIndex, Error> {
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let pods = Api::<Pod>::all(self.virt.clone()).list(&params).await?;
        Ok(pods
            .items
            .iter()
            .filter_map(|pod| {
                let namespace = pod.metadata.namespace.as_deref()?;
                let name = pod.metadata.name.as_deref()?;
                Some((
                    self.translator.to_host(namespace, name),
                    NamespacedName::new(namespace, name),
                ))
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl Filter for FakeKubelet {
    fn name(&self) -> &'static str {
        "kubelet"
    }

    fn matches(&self, cx: &RequestContext) -> bool {
        cx.node.is_some() && !cx.info.is_resource_request
    }

    async fn handle(&self, mut req: ProxyRequest) -> Result<Outcome, Error> {
        let Some(node) = req.cx.node.clone() else {
            return Ok(Outcome::Continue(req));
        };

        let kubelet_path = translate_path(&req.cx.info.path, &*self.translator);
        let rewrite = rewrite_for(&kubelet_path);
        let path = format!("/api/v1/nodes/{node}/proxy{kubelet_path}");
        debug!(%node, %path, "Proxying to kubelet");
        req.set_path(&path)
            .map_err(|e| StatusError::bad_request(e.to_string()))?;

        let Some(rewrite) = rewrite else {
            return self.host.forward(req).await.map(Outcome::Respond);
        };

        let pods = self.pods(&node).await?;
        let rsp = self.host.fetch(req).await?;
        if !rsp.status().is_success() {
            return Ok(Outcome::Respond(rsp.map(full)));
        }
        let (mut parts, body) = rsp.into_parts();
        let body = match rewrite {
            Rewrite::Pods => rewrite_json(&body, |v| filter_pods(v, &pods))?,
            Rewrite::Summary => rewrite_json(&body, |v| filter_summary(v, &pods))?,
            Rewrite::Metrics => Bytes::from(filter_metrics(&String::from_utf8_lossy(&body), &pods)),
        };
        parts.headers.remove(http::header::CONTENT_LENGTH);
        Ok(Outcome::Respond(Response::from_parts(parts, full(body))))
    }
}

fn rewrite_for(path: &str) -> Option<Rewrite> {
    match path.trim_end_matches('/') {
        "/pods" => Some(Rewrite::Pods),
        "/stats/summary" => Some(Rewrite::Summary),
        "/metrics/resource" | "/metrics/cadvisor" => Some(Rewrite::Metrics),
        _ => None,
    }
}

/// Rewrites the pod coordinates in kubelet paths that address a pod.
fn translate_path(path: &str, translator: &dyn Translator) -> String {
    let segments = path.trim_start_matches('/').split('/').collect::<Vec<_>>();
    match segments.as_slice() {
        [op @ ("containerLogs" | "exec" | "attach" | "run" | "portForward"), ns, pod, rest @ ..]
            if !ns.is_empty() && !pod.is_empty() =>
        {
            let host = translator.to_host(ns, pod);
            let mut out = format!("/{op}/{}/{}", host.namespace, host.name);
            for segment in rest {
                out.push('/');
                out.push_str(segment);
            }
            out
        }
        _ => path.to_string(),
    }
}

fn rewrite_json(body: &Bytes, f: impl FnOnce(&mut Value)) -> Result<Bytes, Error> {
    let mut value = serde_json::from_slice::<Value>(body)
        .map_err(|e| StatusError::internal(format!("failed to decode kubelet response: {e}")))?;
    f(&mut value);
    serde_json::to_vec(&value).map(Bytes::from).map_err(Error::Encode)
}

fn lookup<'p>(pods: &'p PodIndex, namespace: Option<&str>, name: Option<&str>) -> Option<&'p NamespacedName> {
    pods.get(&NamespacedName::new(namespace?, name?))
}

/// Filters a `PodList`.
fn filter_pods(list: &mut Value, pods: &PodIndex) {
    let Some(items) = list.get_mut("items").and_then(Value::as_array_mut) else {
        return;
    };
    items.retain_mut(|pod| {
        let Some(meta) = pod.get_mut("metadata").and_then(Value::as_object_mut) else {
            return false;
        };
        let host = (
            meta.get("namespace").and_then(Value::as_str),
            meta.get("name").and_then(Value::as_str),
        );
        match lookup(pods, host.0, host.1) {
            Some(virt) => {
                meta.insert("namespace".to_string(), virt.namespace.clone().into());
                meta.insert("name".to_string(), virt.name.clone().into());
                true
            }
            None => false,
        }
    });
}

/// Filters the `pods` of a stats summary.
fn filter_summary(summary: &mut Value, pods: &PodIndex) {
    let Some(stats) = summary.get_mut("pods").and_then(Value::as_array_mut) else {
        return;
    };
    stats.retain_mut(|pod| {
        let Some(pod_ref) = pod.get_mut("podRef").and_then(Value::as_object_mut) else {
            return false;
        };
        let host = (
            pod_ref.get("namespace").and_then(Value::as_str),
            pod_ref.get("name").and_then(Value::as_str),
        );
        match lookup(pods, host.0, host.1) {
            Some(virt) => {
                pod_ref.insert("namespace".to_string(), virt.namespace.clone().into());
                pod_ref.insert("name".to_string(), virt.name.clone().into());
                true
            }
            None => false,
        }
    });
}

/// Filters Prometheus text samples. Samples without a pod label are kept.
fn filter_metrics(text: &str, pods: &PodIndex) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if line.starts_with('#') {
            out.push_str(line);
            out.push('\n');
            continue;
        }

        let mut namespace = None;
        let mut pod = None;
        for caps in METRIC_LABELS.captures_iter(line) {
            match &caps["label"] {
                "namespace" => namespace = caps.name("value").map(|m| m.as_str()),
                _ => pod = caps.name("value").map(|m| m.as_str()),
            }
        }
        let Some(pod) = pod.filter(|p| !p.is_empty()) else {
            out.push_str(line);
            out.push('\n');
            continue;
        };
        let Some(virt) = lookup(pods, namespace, Some(pod)) else {
            continue;
        };

        let renamed = METRIC_LABELS.replace_all(line, |caps: &Captures<'_>| {
            let value = if &caps["label"] == "namespace" {
                &virt.namespace
            } else {
                &virt.name
            };
            format!("{}{}=\"{value}\"", &caps["sep"], &caps["label"])
        });
        out.push_str(&renamed);
        out.push('\n');
    }
    out
}
