use crate::{json_response, Error, Filter, Outcome, ProxyRequest, RequestContext};
use bytes::Bytes;
use http::{header, StatusCode};
use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
    Api,
};
use rand::Rng;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{error, info};
use vcluster_gateway_core::{
    request::is_dry_run,
    translate::{
        MANAGED_BY_LABEL, NAMESPACE_LABEL, OBJECT_NAMESPACE_ANNOTATION, OBJECT_NAME_ANNOTATION,
    },
    NamespacedName, Translator,
};
use vcluster_gateway_k8s_api::{ObjectMeta, Reason, Service, ServiceSpec, StatusError};

/// Marks host services created on behalf of the virtual cluster so that
/// the syncer does not garbage collect them before the virtual object exists.
pub const SKIP_DELETE_ANNOTATION: &str = "vcluster.loft.sh/skip-delete";

const EXTERNAL_NAME: &str = "ExternalName";
const HEADLESS: &str = "None";

const NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const NAME_SUFFIX_LEN: usize = 5;

/// Writes services to the host cluster first so that the virtual service
/// carries the cluster IP the host allocated.
pub struct ServiceWrite {
    host: kube::Client,
    virt: kube::Client,
    translator: Arc<dyn Translator>,
}

// === impl ServiceWrite ===

impl ServiceWrite {
    pub fn new(host: kube::Client, virt: kube::Client, translator: Arc<dyn Translator>) -> Self {
        Self {
            host,
            virt,
            translator,
        }
    }

    async fn create(&self, namespace: &str, body: &Bytes) -> Result<Service, Error> {
        let mut svc = decode(body)?;
        match svc.metadata.namespace.as_deref() {
            Some(ns) if !ns.is_empty() && ns != namespace => {
                return Err(StatusError::bad_request(
                    "the namespace of the provided object does not match the namespace sent on the request",
                )
                .into())
            }
            _ => svc.metadata.namespace = Some(namespace.to_string()),
        }
        let name = match (svc.metadata.name.as_deref(), svc.metadata.generate_name.as_deref()) {
            (Some(name), _) if !name.is_empty() => name.to_string(),
            (_, Some(prefix)) if !prefix.is_empty() => generate_name(prefix),
            _ => {
                return Err(StatusError::new(
                    Reason::Invalid,
                    "Service is invalid: metadata.name: Required value: name or generateName is required",
                )
                .into())
            }
        };
        svc.metadata.name = Some(name.clone());

        let target = self.translator.to_host(namespace, &name);
        let host = Api::<Service>::namespaced(self.host.clone(), &target.namespace)
            .create(&PostParams::default(), &self.host_service(&svc, &target))
            .await?;
        info!(service = %target, "Created host service");

        copy_allocated(&host, &mut svc);
        let created = Api::<Service>::namespaced(self.virt.clone(), namespace)
            .create(&PostParams::default(), &svc)
            .await;
        self.compensate(created, &target).await
    }

    async fn update(&self, req: &ProxyRequest) -> Result<Option<Service>, Error> {
        let info = &req.cx.info;
        let virt = Api::<Service>::namespaced(self.virt.clone(), &info.namespace);
        let current = virt.get(&info.name).await?;
        let mut svc = decode(&req.body)?;
        if service_type(&current) != EXTERNAL_NAME || service_type(&svc) == EXTERNAL_NAME {
            return Ok(None);
        }

        if let Some(rv) = svc.metadata.resource_version.as_deref() {
            if Some(rv) != current.metadata.resource_version.as_deref() {
                return Err(StatusError::new(
                    Reason::Conflict,
                    format!(
                        "Operation cannot be fulfilled on services {:?}: the object has been modified; please apply your changes to the latest version and try again",
                        info.name
                    ),
                )
                .into());
            }
        }

        let target = self.translator.to_host(&info.namespace, &info.name);
        let spec = svc.spec.clone().unwrap_or_default();
        let selector = spec
            .selector
            .as_ref()
            .map(|s| self.host_selector(&info.namespace, s));
        // `add` replaces whole members, so stale selector keys do not survive.
        let patch = serde_json::from_value::<json_patch::Patch>(serde_json::json!([
            {"op": "add", "path": "/spec/type", "value": spec.type_},
            {"op": "add", "path": "/spec/ports", "value": spec.ports},
            {"op": "add", "path": "/spec/selector", "value": selector},
            {"op": "add", "path": "/spec/clusterIP", "value": null},
            {"op": "add", "path": "/spec/clusterIPs", "value": null},
            {"op": "add", "path": "/spec/externalName", "value": null},
        ]))
        .map_err(Error::Encode)?;
        let host = Api::<Service>::namespaced(self.host.clone(), &target.namespace)
            .patch(&target.name, &PatchParams::default(), &Patch::<()>::Json(patch))
            .await?;
        info!(service = %target, "Patched host service out of ExternalName");

        copy_allocated(&host, &mut svc);
        let replaced = virt.replace(&info.name, &PostParams::default(), &svc).await;
        self.compensate(replaced, &target).await.map(Some)
    }

    /// Deletes the host service when the virtual write failed. The virtual
    /// write's error is returned either way.
    async fn compensate(
        &self,
        res: kube::Result<Service>,
        target: &NamespacedName,
    ) -> Result<Service, Error> {
        let error = match res {
            Ok(svc) => return Ok(svc),
            Err(error) => error,
        };
        let deleted = Api::<Service>::namespaced(self.host.clone(), &target.namespace)
            .delete(&target.name, &DeleteParams::default())
            .await;
        match deleted {
            Ok(_) => info!(service = %target, %error, "Deleted host service after failed virtual write"),
            Err(delete_error) => error!(
                service = %target,
                %error,
                error.delete = %delete_error,
                "Failed to delete host service after failed virtual write"
            ),
        }
        Err(error.into())
    }

    fn host_service(&self, svc: &Service, target: &NamespacedName) -> Service {
        let namespace = svc.metadata.namespace.clone().unwrap_or_default();
        let name = svc.metadata.name.clone().unwrap_or_default();

        let mut labels = self.host_labels(&namespace, svc.metadata.labels.as_ref());
        labels.insert(MANAGED_BY_LABEL.to_string(), self.translator.managed_by());

        let mut annotations = svc.metadata.annotations.clone().unwrap_or_default();
        annotations.insert(OBJECT_NAME_ANNOTATION.to_string(), name);
        annotations.insert(OBJECT_NAMESPACE_ANNOTATION.to_string(), namespace.clone());
        annotations.insert(SKIP_DELETE_ANNOTATION.to_string(), "true".to_string());

        let mut spec = svc.spec.clone().unwrap_or_default();
        spec.selector = spec
            .selector
            .as_ref()
            .map(|s| self.host_selector(&namespace, s));
        if spec.cluster_ip.as_deref() != Some(HEADLESS) {
            spec.cluster_ip = None;
            spec.cluster_ips = None;
        }

        Service {
            metadata: ObjectMeta {
                name: Some(target.name.clone()),
                namespace: Some(target.namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            },
            spec: Some(spec),
            status: None,
        }
    }

    fn host_labels(
        &self,
        namespace: &str,
        labels: Option<&BTreeMap<String, String>>,
    ) -> BTreeMap<String, String> {
        let mut host = labels
            .into_iter()
            .flatten()
            .map(|(k, v)| (self.translator.host_label(k), v.clone()))
            .collect::<BTreeMap<_, _>>();
        host.insert(NAMESPACE_LABEL.to_string(), namespace.to_string());
        host
    }

    /// Host pods carry translated labels, so selectors are translated the
    /// same way.
    fn host_selector(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut host = self.host_labels(namespace, Some(selector));
        host.insert(MANAGED_BY_LABEL.to_string(), self.translator.managed_by());
        host
    }
}

#[async_trait::async_trait]
impl Filter for ServiceWrite {
    fn name(&self) -> &'static str {
        "service"
    }

    fn matches(&self, cx: &RequestContext) -> bool {
        let info = &cx.info;
        info.is_resource("services")
            && info.api_group.is_empty()
            && info.subresource.is_empty()
            && !info.namespace.is_empty()
            && ((info.verb == "create" && info.name.is_empty())
                || (info.verb == "update" && !info.name.is_empty()))
    }

    async fn handle(&self, req: ProxyRequest) -> Result<Outcome, Error> {
        if is_dry_run(req.query()) {
            return Ok(Outcome::Continue(req));
        }
        if !is_json(req.header_str(header::CONTENT_TYPE)) {
            return Err(StatusError::new(
                Reason::UnsupportedMediaType,
                "services are only accepted as application/json through this cluster",
            )
            .into());
        }

        if req.cx.info.verb == "create" {
            let svc = self.create(&req.cx.info.namespace, &req.body).await?;
            return json_response(StatusCode::CREATED, &svc).map(Outcome::Respond);
        }

        match self.update(&req).await? {
            Some(svc) => json_response(StatusCode::OK, &svc).map(Outcome::Respond),
            None => Ok(Outcome::Continue(req)),
        }
    }
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type.map_or(true, |ct| {
        ct.split(';')
            .next()
            .is_some_and(|media| media.trim().eq_ignore_ascii_case("application/json"))
    })
}

fn decode(body: &Bytes) -> Result<Service, Error> {
    serde_json::from_slice(body)
        .map_err(|e| StatusError::bad_request(format!("failed to decode service: {e}")).into())
}

fn service_type(svc: &Service) -> &str {
    svc.spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .unwrap_or("ClusterIP")
}

/// Copies what the host allocated onto the virtual service.
fn copy_allocated(host: &Service, svc: &mut Service) {
    let allocated = host.spec.clone().unwrap_or_default();
    let spec = svc.spec.get_or_insert_with(ServiceSpec::default);
    spec.cluster_ip = allocated.cluster_ip;
    spec.cluster_ips = allocated.cluster_ips;
    spec.ports = allocated.ports;
    spec.health_check_node_port = allocated.health_check_node_port;
}

fn generate_name(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix = (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
        .collect::<String>();
    format!("{prefix}{suffix}")
}
