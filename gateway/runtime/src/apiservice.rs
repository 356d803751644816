//! Registers the gateway as an aggregated API in the virtual cluster.
//!
//! A Service of type `ExternalName` resolving to `localhost` points the
//! virtual API server's aggregator at the gateway's APIService listener, and
//! an `APIService` routes a group version to that Service.

use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use tokio::time;
use tracing::{debug, info, warn};
use vcluster_gateway_k8s_api::{
    status::is_reason, APIService, APIServiceSpec, ObjectMeta, Reason, Service,
    ServicePort, ServiceReference, ServiceSpec,
};

const SERVICE_NAMESPACE: &str = "kube-system";

/// An aggregated API served by the gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub group: String,
    pub version: String,
    pub service_name: String,
    pub port: u16,
}

/// Exponential retry delays: 1s growing by half each attempt, capped at a
/// minute. Attempts are unbounded.
#[derive(Clone, Debug)]
pub struct Backoff {
    next: time::Duration,
}

impl Backoff {
    pub const INITIAL: time::Duration = time::Duration::from_secs(1);
    pub const FACTOR: f64 = 1.5;
    pub const MAX: time::Duration = time::Duration::from_secs(60);

    pub fn next_delay(&mut self) -> time::Duration {
        let delay = self.next;
        self.next = self.next.mul_f64(Self::FACTOR).min(Self::MAX);
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            next: Self::INITIAL,
        }
    }
}

// === impl Registration ===

impl Registration {
    pub fn metrics(port: u16) -> Self {
        Self {
            group: vcluster_gateway_k8s_api::metrics::GROUP.to_string(),
            version: vcluster_gateway_k8s_api::metrics::VERSION.to_string(),
            service_name: "metrics-server".to_string(),
            port,
        }
    }

    pub fn name(&self) -> String {
        format!("{}.{}", self.version, self.group)
    }

    fn service(&self) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(self.service_name.clone()),
                namespace: Some(SERVICE_NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ExternalName".to_string()),
                external_name: Some("localhost".to_string()),
                ports: Some(vec![ServicePort {
                    name: Some("https".to_string()),
                    port: self.port.into(),
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    fn api_service(&self) -> APIService {
        APIService {
            metadata: ObjectMeta {
                name: Some(self.name()),
                ..ObjectMeta::default()
            },
            spec: Some(APIServiceSpec {
                group: Some(self.group.clone()),
                version: Some(self.version.clone()),
                group_priority_minimum: 100,
                version_priority: 100,
                insecure_skip_tls_verify: Some(true),
                service: Some(ServiceReference {
                    name: Some(self.service_name.clone()),
                    namespace: Some(SERVICE_NAMESPACE.to_string()),
                    port: Some(self.port.into()),
                }),
                ..APIServiceSpec::default()
            }),
            ..APIService::default()
        }
    }

    async fn apply(&self, client: &kube::Client) -> kube::Result<()> {
        let services = Api::<Service>::namespaced(client.clone(), SERVICE_NAMESPACE);
        create_or_patch(&services, &self.service_name, &self.service()).await?;
        let api_services = Api::<APIService>::all(client.clone());
        create_or_patch(&api_services, &self.name(), &self.api_service()).await
    }

    async fn remove(&self, client: &kube::Client) -> kube::Result<()> {
        let api_services = Api::<APIService>::all(client.clone());
        delete(&api_services, &self.name()).await?;
        let services = Api::<Service>::namespaced(client.clone(), SERVICE_NAMESPACE);
        delete(&services, &self.service_name).await
    }
}

/// Creates or deletes the registration, retrying with [`Backoff`] until it
/// succeeds or the drain is signaled.
pub async fn reconcile(
    client: kube::Client,
    registration: Registration,
    enabled: bool,
    drain: drain::Watch,
) {
    let shutdown = drain.signaled();
    tokio::pin!(shutdown);

    let mut backoff = Backoff::default();
    loop {
        let res = if enabled {
            registration.apply(&client).await
        } else {
            registration.remove(&client).await
        };
        let error = match res {
            Ok(()) => {
                info!(apiservice = %registration.name(), enabled, "Reconciled APIService");
                return;
            }
            Err(error) => error,
        };

        let delay = backoff.next_delay();
        warn!(%error, apiservice = %registration.name(), ?delay, "Failed to reconcile APIService");
        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = &mut shutdown => {
                debug!("Shutting down");
                return;
            }
        }
    }
}

async fn create_or_patch<K>(api: &Api<K>, name: &str, obj: &K) -> kube::Result<()>
where
    K: kube::Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(()),
        Err(error) if is_reason(&error, Reason::AlreadyExists) => {
            api.patch(name, &PatchParams::default(), &Patch::Merge(obj))
                .await
                .map(|_| ())
        }
        Err(error) => Err(error),
    }
}

async fn delete<K>(api: &Api<K>, name: &str) -> kube::Result<()>
where
    K: kube::Resource + Clone + Debug + DeserializeOwned,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(error) if is_reason(&error, Reason::NotFound) => Ok(()),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests;
