use crate::Error;
use kube::Api;
use vcluster_gateway_k8s_api::Service;

/// A source of names the gateway is reachable under.
#[async_trait::async_trait]
pub trait SanProvider: Send + Sync {
    async fn sans(&self) -> Result<Vec<String>, Error>;
}

/// A fixed list of names.
#[derive(Clone, Debug, Default)]
pub struct StaticSans(pub Vec<String>);

/// The addresses and DNS names of the host Service that fronts the gateway.
#[derive(Clone)]
pub struct HostServiceSans {
    client: kube::Client,
    namespace: String,
    name: String,
    cluster_domain: String,
}

#[async_trait::async_trait]
impl SanProvider for StaticSans {
    async fn sans(&self) -> Result<Vec<String>, Error> {
        Ok(self.0.clone())
    }
}

// === impl HostServiceSans ===

impl HostServiceSans {
    pub fn new(
        client: kube::Client,
        namespace: impl Into<String>,
        name: impl Into<String>,
        cluster_domain: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
            cluster_domain: cluster_domain.into(),
        }
    }
}

#[async_trait::async_trait]
impl SanProvider for HostServiceSans {
    async fn sans(&self) -> Result<Vec<String>, Error> {
        let svc = Api::<Service>::namespaced(self.client.clone(), &self.namespace)
            .get(&self.name)
            .await?;
        Ok(service_sans(&svc, &self.name, &self.namespace, &self.cluster_domain))
    }
}

impl std::fmt::Debug for HostServiceSans {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServiceSans")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish()
    }
}

fn service_sans(svc: &Service, name: &str, namespace: &str, cluster_domain: &str) -> Vec<String> {
    let mut sans = vec![
        name.to_string(),
        format!("{name}.{namespace}"),
        format!("{name}.{namespace}.svc"),
        format!("{name}.{namespace}.svc.{cluster_domain}"),
    ];

    if let Some(spec) = svc.spec.as_ref() {
        sans.extend(spec.cluster_ips.iter().flatten().filter(|ip| *ip != "None").cloned());
        if let Some(ip) = spec.cluster_ip.as_ref().filter(|ip| *ip != "None") {
            sans.push(ip.clone());
        }
    }

    let ingress = svc
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref());
    for ingress in ingress.into_iter().flatten() {
        sans.extend(ingress.ip.iter().cloned());
        sans.extend(ingress.hostname.iter().cloned());
    }
    sans
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus,
    };
    use pretty_assertions::assert_eq;

    #[test]
    fn service_names_and_addresses() {
        let svc = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.96.0.10".to_string()),
                cluster_ips: Some(vec!["10.96.0.10".to_string(), "fd00::10".to_string()]),
                ..ServiceSpec::default()
            }),
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some("203.0.113.7".to_string()),
                        hostname: Some("vc.example.com".to_string()),
                        ..LoadBalancerIngress::default()
                    }]),
                }),
                ..ServiceStatus::default()
            }),
            ..Service::default()
        };

        assert_eq!(
            service_sans(&svc, "vc", "vc-ns", "cluster.local"),
            vec![
                "vc",
                "vc.vc-ns",
                "vc.vc-ns.svc",
                "vc.vc-ns.svc.cluster.local",
                "10.96.0.10",
                "fd00::10",
                "10.96.0.10",
                "203.0.113.7",
                "vc.example.com",
            ]
        );
    }

    #[test]
    fn headless_services_have_no_addresses() {
        let svc = Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                cluster_ips: Some(vec!["None".to_string()]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        };
        assert_eq!(service_sans(&svc, "vc", "vc-ns", "cluster.local").len(), 4);
    }
}
