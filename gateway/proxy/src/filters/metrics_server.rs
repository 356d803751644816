//! Serves `metrics.k8s.io` from the host cluster's metrics server.
//!
//! Host metrics cover every workload on the host. Responses are joined with
//! the virtual cluster's own pods and nodes: entries without a virtual
//! counterpart are dropped and the rest are renamed to virtual coordinates.

use crate::{full, Error, Filter, Outcome, ProxyRequest, RequestContext, Response, Upstream};
use bytes::Bytes;
use http::{header, HeaderValue};
use kube::{api::ListParams, Api};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::debug;
use vcluster_gateway_core::{
    request::{encode, query_pairs, query_param},
    NamespacedName, RequestInfo, Translator,
};
use vcluster_gateway_k8s_api::{
    metrics::{NodeMetrics, NodeMetricsList, PodMetrics, PodMetricsList, GROUP},
    table::accepts_table,
    Node, ObjectMeta, Pod, StatusError, Table,
};

const TABLE_ACCEPT: &str = "application/json;as=Table;v=v1;g=meta.k8s.io,application/json";
const JSON_ACCEPT: &str = "application/json";

pub struct MetricsServerProxy {
    host: Upstream,
    virt: kube::Client,
    translator: Arc<dyn Translator>,
}

type Labels = Option<BTreeMap<String, String>>;

/// Virtual pods keyed by the host identity of their counterpart.
type PodIndex = HashMap<NamespacedName, (NamespacedName, Labels)>;

// === impl MetricsServerProxy ===

impl MetricsServerProxy {
    pub fn new(host: Upstream, virt: kube::Client, translator: Arc<dyn Translator>) -> Self {
        Self {
            host,
            virt,
            translator,
        }
    }

    async fn nodes(&self, mut req: ProxyRequest) -> Result<Response, Error> {
        if req.header_str(header::ACCEPT).is_some_and(accepts_table) {
            return Err(StatusError::forbidden(
                "node metrics cannot be rendered as a table through this cluster",
            )
            .into());
        }

        let info = req.cx.info.clone();
        let api = Api::<Node>::all(self.virt.clone());
        let nodes = if info.is_collection() {
            api.list(&list_params(req.query())).await?.items
        } else {
            vec![api.get(&info.name).await?]
        };
        let nodes = nodes
            .into_iter()
            .filter_map(|n| Some((n.metadata.name?, n.metadata.labels)))
            .collect::<HashMap<_, _>>();

        set_accept(&mut req, JSON_ACCEPT);
        let rsp = self.host.fetch(req).await?;
        if !rsp.status().is_success() {
            return Ok(rsp.map(full));
        }
        let (parts, body) = rsp.into_parts();

        let body = if info.is_collection() {
            let mut list = decode::<NodeMetricsList>(&body)?;
            list.items.retain_mut(|m| relabel_node(m, &nodes));
            encode_json(&list)?
        } else {
            let mut metrics = decode::<NodeMetrics>(&body)?;
            if !relabel_node(&mut metrics, &nodes) {
                return Err(StatusError::not_found(GROUP, "nodes", &info.name).into());
            }
            encode_json(&metrics)?
        };
        Ok(json(parts, body))
    }

    async fn pods(&self, mut req: ProxyRequest) -> Result<Response, Error> {
        let info = req.cx.info.clone();
        let table = req.header_str(header::ACCEPT).is_some_and(accepts_table);
        let pods = self.virtual_pods(&info, req.query()).await?;

        let path = self.host_path(&info);
        let query = host_query(req.query(), &info.namespace, &*self.translator);
        debug!(from = %info.path, to = %path, "Fetching host pod metrics");
        req.set_path_and_query(&path, query.as_deref())
            .map_err(|e| StatusError::bad_request(e.to_string()))?;
        set_accept(&mut req, if table { TABLE_ACCEPT } else { JSON_ACCEPT });

        let rsp = self.host.fetch(req).await?;
        if !rsp.status().is_success() {
            return Ok(rsp.map(full));
        }
        let (parts, body) = rsp.into_parts();

        let value = decode::<Value>(&body)?;
        let body = if value.get("kind").and_then(Value::as_str) == Some("Table") {
            let mut table = decode_value::<Table>(value)?;
            filter_table(&mut table, &pods)?;
            encode_json(&table)?
        } else if info.is_collection() {
            let mut list = decode_value::<PodMetricsList>(value)?;
            list.items.retain_mut(|m| rename_pod(&mut m.metadata, &pods));
            encode_json(&list)?
        } else {
            let mut metrics = decode_value::<PodMetrics>(value)?;
            if !rename_pod(&mut metrics.metadata, &pods) {
                return Err(StatusError::not_found(GROUP, "pods", &info.name).into());
            }
            encode_json(&metrics)?
        };
        Ok(json(parts, body))
    }

    async fn virtual_pods(&self, info: &RequestInfo, query: Option<&str>) -> Result<PodIndex, Error> {
        let api = if info.namespace.is_empty() {
            Api::<Pod>::all(self.virt.clone())
        } else {
            Api::<Pod>::namespaced(self.virt.clone(), &info.namespace)
        };
        let pods = if info.is_collection() {
            api.list(&list_params(query)).await?.items
        } else {
            vec![api.get(&info.name).await?]
        };
        Ok(pods
            .into_iter()
            .filter_map(|pod| {
                let namespace = pod.metadata.namespace?;
                let name = pod.metadata.name?;
                Some((
                    self.translator.to_host(&namespace, &name),
                    (NamespacedName::new(namespace, name), pod.metadata.labels),
                ))
            })
            .collect())
    }

    fn host_path(&self, info: &RequestInfo) -> String {
        if !info.is_collection() {
            let host = self.translator.to_host(&info.namespace, &info.name);
            return info.path_for(&host.namespace, &host.name);
        }
        if !info.namespace.is_empty() {
            return info.path_for(&self.translator.host_namespace(&info.namespace), "");
        }
        match self.translator.target_namespace() {
            Some(target) => info.path_for(target, ""),
            None => info.path.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Filter for MetricsServerProxy {
    fn name(&self) -> &'static str {
        "metrics-server"
    }

    fn matches(&self, cx: &RequestContext) -> bool {
        let info = &cx.info;
        info.is_resource_request
            && info.api_group == GROUP
            && info.subresource.is_empty()
            && (info.resource == "pods" || info.resource == "nodes")
            && (info.verb == "get" || info.verb == "list")
    }

    async fn handle(&self, req: ProxyRequest) -> Result<Outcome, Error> {
        let rsp = if req.cx.info.resource == "nodes" {
            self.nodes(req).await?
        } else {
            self.pods(req).await?
        };
        Ok(Outcome::Respond(rsp))
    }
}

/// Carries the caller's label and field selectors to the virtual API server.
fn list_params(query: Option<&str>) -> ListParams {
    let mut params = ListParams::default();
    if let Some(labels) = query_param(query, "labelSelector").filter(|s| !s.is_empty()) {
        params = params.labels(&labels);
    }
    if let Some(fields) = query_param(query, "fieldSelector").filter(|s| !s.is_empty()) {
        params = params.fields(&fields);
    }
    params
}

fn set_accept(req: &mut ProxyRequest, accept: &'static str) {
    req.parts
        .headers
        .insert(header::ACCEPT, HeaderValue::from_static(accept));
}

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|e| {
        StatusError::internal(format!("failed to decode metrics server response: {e}")).into()
    })
}

fn decode_value<T: DeserializeOwned>(value: Value) -> Result<T, Error> {
    serde_json::from_value(value).map_err(|e| {
        StatusError::internal(format!("failed to decode metrics server response: {e}")).into()
    })
}

fn encode_json<T: Serialize>(value: &T) -> Result<Bytes, Error> {
    serde_json::to_vec(value).map(Bytes::from).map_err(Error::Encode)
}

fn json(mut parts: http::response::Parts, body: Bytes) -> Response {
    parts.headers.remove(header::CONTENT_LENGTH);
    parts
        .headers
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_ACCEPT));
    Response::from_parts(parts, full(body))
}

fn relabel_node(metrics: &mut NodeMetrics, nodes: &HashMap<String, Labels>) -> bool {
    let Some(labels) = metrics.metadata.name.as_ref().and_then(|n| nodes.get(n)) else {
        return false;
    };
    metrics.metadata.labels = labels.clone();
    true
}

/// Renames host pod metadata to its virtual counterpart.
fn rename_pod(meta: &mut ObjectMeta, pods: &PodIndex) -> bool {
    let host = NamespacedName::new(
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    );
    let Some((virt, labels)) = pods.get(&host) else {
        return false;
    };
    meta.namespace = Some(virt.namespace.clone());
    meta.name = Some(virt.name.clone());
    meta.labels = labels.clone();
    true
}

fn filter_table(table: &mut Table, pods: &PodIndex) -> Result<(), Error> {
    let name_col = table.column("Name");
    let ns_col = table.column("Namespace");
    let cell = |row: &vcluster_gateway_k8s_api::table::TableRow, col: Option<usize>| {
        col.and_then(|c| row.cells.get(c))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let mut rows = Vec::with_capacity(table.rows.len());
    for mut row in std::mem::take(&mut table.rows) {
        let mut meta = row.object_meta().unwrap_or_else(|| ObjectMeta {
            name: cell(&row, name_col),
            namespace: cell(&row, ns_col),
            ..ObjectMeta::default()
        });
        if !rename_pod(&mut meta, pods) {
            continue;
        }
        if let Some(slot) = name_col.and_then(|c| row.cells.get_mut(c)) {
            *slot = meta.name.clone().into();
        }
        if let Some(slot) = ns_col.and_then(|c| row.cells.get_mut(c)) {
            *slot = meta.namespace.clone().into();
        }
        row.set_object_meta(&meta).map_err(Error::Encode)?;
        rows.push(row);
    }
    table.rows = rows;
    Ok(())
}

/// Translates label and field selectors; all other parameters are kept.
fn host_query(query: Option<&str>, namespace: &str, translator: &dyn Translator) -> Option<String> {
    let pairs = query_pairs(query)
        .filter_map(|(k, v)| {
            let v = match &*k {
                "labelSelector" => host_selector(&v, translator),
                "fieldSelector" => host_field_selector(&v, namespace, translator)?,
                _ => v.into_owned(),
            };
            Some(format!("{}={}", encode(&k), encode(&v)))
        })
        .collect::<Vec<_>>();
    (!pairs.is_empty()).then(|| pairs.join("&"))
}

/// Renames `metadata.name` and `metadata.namespace` requirements to host
/// coordinates. Names only translate within a namespace; without one the
/// selector is dropped and the virtual pod index narrows the response.
fn host_field_selector(
    selector: &str,
    namespace: &str,
    translator: &dyn Translator,
) -> Option<String> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|req| !req.is_empty())
        .map(|req| {
            let (field, op, value) = split_field(req)?;
            match field {
                "metadata.name" if namespace.is_empty() => None,
                "metadata.name" => {
                    let host = translator.to_host(namespace, value);
                    Some(format!("{field}{op}{}", host.name))
                }
                "metadata.namespace" => Some(format!(
                    "{field}{op}{}",
                    translator.host_namespace(value)
                )),
                _ => Some(req.to_string()),
            }
        })
        .collect::<Option<Vec<_>>>()
        .map(|reqs| reqs.join(","))
}

fn split_field(req: &str) -> Option<(&str, &'static str, &str)> {
    ["==", "!=", "="].into_iter().find_map(|op| {
        let (field, value) = req.split_once(op)?;
        Some((field.trim(), op, value.trim()))
    })
}

fn host_selector(selector: &str, translator: &dyn Translator) -> String {
    split_requirements(selector)
        .into_iter()
        .map(|req| {
            let req = req.trim();
            let (negated, rest) = match req.strip_prefix('!') {
                Some(rest) => (true, rest.trim_start()),
                None => (false, req),
            };
            let end = rest
                .find(|c: char| c == '=' || c == '!' || c.is_whitespace())
                .unwrap_or(rest.len());
            let (key, op) = rest.split_at(end);
            format!(
                "{}{}{op}",
                if negated { "!" } else { "" },
                translator.host_label(key)
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Splits on commas outside of set parentheses.
fn split_requirements(selector: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&selector[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&selector[start..]);
    parts.retain(|p| !p.trim().is_empty());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use vcluster_gateway_core::translate::SingleNamespace;

    fn translator() -> SingleNamespace {
        SingleNamespace::new("vc-ns", "vc").unwrap()
    }

    fn index() -> PodIndex {
        let t = translator();
        let labels = Some(btreemap! { "app".to_string() => "web".to_string() });
        maplit::hashmap! {
            t.to_host("default", "web") => (NamespacedName::new("default", "web"), labels),
        }
    }

    #[test]
    fn selectors() {
        let t = translator();
        let app = t.host_label("app");
        let tier = t.host_label("tier");
        let env = t.host_label("env");
        assert_eq!(host_selector("app=web", &t), format!("{app}=web"));
        assert_eq!(
            host_selector("app!=web, tier in (a,b),!env", &t),
            format!("{app}!=web,{tier} in (a,b),!{env}")
        );
        assert_eq!(host_selector("env", &t), env);
    }

    #[test]
    fn queries() {
        let t = translator();
        let query = host_query(Some("labelSelector=app%3Dweb&limit=10"), "default", &t).unwrap();
        let selector = query_param(Some(&query), "labelSelector").unwrap();
        assert_eq!(selector, format!("{}=web", t.host_label("app")));
        assert_eq!(query_param(Some(&query), "limit").as_deref(), Some("10"));
        assert_eq!(host_query(None, "default", &t), None);
    }

    #[test]
    fn field_selectors() {
        let t = translator();
        assert_eq!(
            host_field_selector("metadata.name=web", "default", &t).as_deref(),
            Some("metadata.name=web-x-default-x-vc")
        );
        assert_eq!(
            host_field_selector("metadata.namespace==default,metadata.name!=db", "default", &t)
                .as_deref(),
            Some("metadata.namespace==vc-ns,metadata.name!=db-x-default-x-vc")
        );
        assert_eq!(host_field_selector("metadata.name=web", "", &t), None);

        let query = host_query(Some("fieldSelector=metadata.name%3Dweb&limit=1"), "", &t);
        assert_eq!(query.as_deref(), Some("limit=1"));
    }

    #[test]
    fn pod_lists_only_contain_virtual_pods() {
        let mut list: PodMetricsList = serde_json::from_value(json!({
            "kind": "PodMetricsList",
            "apiVersion": "metrics.k8s.io/v1beta1",
            "metadata": {},
            "items": [
                {"metadata": {"name": "web-x-default-x-vc", "namespace": "vc-ns", "labels": {"host": "label"}}, "containers": []},
                {"metadata": {"name": "db-x-default-x-vc", "namespace": "vc-ns"}, "containers": []},
                {"metadata": {"name": "kube-proxy", "namespace": "kube-system"}, "containers": []},
            ]
        }))
        .unwrap();
        let pods = index();
        list.items.retain_mut(|m| rename_pod(&mut m.metadata, &pods));

        assert_eq!(list.items.len(), 1);
        let meta = &list.items[0].metadata;
        assert_eq!(meta.name.as_deref(), Some("web"));
        assert_eq!(meta.namespace.as_deref(), Some("default"));
        assert_eq!(meta.labels, Some(btreemap! { "app".to_string() => "web".to_string() }));
    }

    #[test]
    fn tables_only_contain_virtual_pods() {
        let mut table: Table = serde_json::from_value(json!({
            "kind": "Table",
            "apiVersion": "meta.k8s.io/v1",
            "metadata": {},
            "columnDefinitions": [
                {"name": "Name", "type": "string"},
                {"name": "Namespace", "type": "string"},
                {"name": "CPU", "type": "string"},
            ],
            "rows": [
                {
                    "cells": ["web-x-default-x-vc", "vc-ns", "1m"],
                    "object": {"kind": "PartialObjectMetadata", "metadata": {"name": "web-x-default-x-vc", "namespace": "vc-ns"}},
                },
                {
                    "cells": ["stranger", "vc-ns", "5m"],
                    "object": {"kind": "PartialObjectMetadata", "metadata": {"name": "stranger", "namespace": "vc-ns"}},
                },
                {"cells": ["etcd", "kube-system", "9m"]},
            ]
        }))
        .unwrap();
        filter_table(&mut table, &index()).unwrap();

        assert_eq!(table.rows.len(), 1);
        let row = &table.rows[0];
        assert_eq!(row.cells, vec![json!("web"), json!("default"), json!("1m")]);
        let object = row.object.as_ref().unwrap();
        assert_eq!(object["metadata"]["name"], "web");
        assert_eq!(object["metadata"]["labels"]["app"], "web");
    }

    #[test]
    fn nodes_are_relabelled() {
        let nodes = maplit::hashmap! {
            "node-1".to_string() => Some(btreemap! { "zone".to_string() => "a".to_string() }),
        };
        let mut metrics = NodeMetrics {
            metadata: ObjectMeta {
                name: Some("node-1".to_string()),
                labels: Some(btreemap! { "host-only".to_string() => "x".to_string() }),
                ..ObjectMeta::default()
            },
            ..NodeMetrics::default()
        };
        assert!(relabel_node(&mut metrics, &nodes));
        assert_eq!(metrics.metadata.labels, nodes["node-1"]);

        metrics.metadata.name = Some("node-2".to_string());
        assert!(!relabel_node(&mut metrics, &nodes));
    }
}
