use crate::{
    apiservice::{self, Registration},
    auth::{
        authz::{
            DelegatingAuthorizer, HostCheck, ImpersonationAuthorizer, KubeletAuthorizer, Rule,
            Union, VirtualRbac,
        },
        Authenticators, ClientCertAuthenticator, DelegatingAuthenticator,
    },
    certs::{CaSigner, CertStore, HostServiceSans, StaticSans, Syncer, SyncerMetrics},
    core::{translate::SingleNamespace, Translator},
    k8s::Node,
    proxy::{
        apiservice::AllowList,
        filters::{
            FakeKubelet, K3sTunnel, MetricsServerProxy, NodeWrite, ServiceWrite,
            SubresourceRedirect,
        },
        metrics::GatewayMetrics,
        Credentials, Gateway, Pipeline, Upstream,
    },
    server,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{reflector, watcher, WatchStreamExt},
    Api,
};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "gateway", about = "An API gateway in front of a virtual cluster")]
pub struct Args {
    #[clap(
        long,
        default_value = "vcluster=info,warn",
        env = "VCLUSTER_GATEWAY_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    /// Host cluster client.
    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Kubeconfig with administrative access to the virtual cluster.
    #[clap(long)]
    virtual_kubeconfig: PathBuf,

    /// Overrides the virtual API server URL used for pass-through requests.
    #[clap(long)]
    virtual_server_url: Option<http::Uri>,

    /// PEM bundle that verifies the virtual API server.
    #[clap(long)]
    virtual_ca: Option<PathBuf>,

    #[clap(long, default_value = "0.0.0.0:8443")]
    listen_addr: SocketAddr,

    #[clap(long, default_value = "127.0.0.1:8444")]
    apiservice_listen_addr: SocketAddr,

    /// Host namespace that holds the virtual cluster's workloads.
    #[clap(long)]
    target_namespace: String,

    #[clap(long)]
    vcluster_name: String,

    #[clap(long)]
    ca_cert: PathBuf,

    #[clap(long)]
    ca_key: PathBuf,

    /// Additional names for the serving certificate.
    #[clap(long = "extra-san")]
    extra_sans: Vec<String>,

    /// Host Service whose addresses are added to the serving certificate.
    #[clap(long)]
    service_name: Option<String>,

    /// Defaults to the target namespace.
    #[clap(long)]
    service_namespace: Option<String>,

    #[clap(long, default_value = "cluster.local")]
    cluster_domain: String,

    /// Enables client certificate authentication against this CA bundle.
    #[clap(long)]
    client_ca: Option<PathBuf>,

    /// Registers the metrics APIService; otherwise it is removed.
    #[clap(long)]
    metrics_apiservice: bool,

    /// `group/version/resource[/subresource]:verb` requests delegated to the
    /// host cluster for authorization.
    #[clap(long = "delegate-resource")]
    delegate_resources: Vec<String>,

    /// `path:verb` non-resource requests delegated to the host cluster for
    /// authorization.
    #[clap(long = "delegate-path")]
    delegate_paths: Vec<String>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            virtual_kubeconfig,
            virtual_server_url,
            virtual_ca,
            listen_addr,
            apiservice_listen_addr,
            target_namespace,
            vcluster_name,
            ca_cert,
            ca_key,
            extra_sans,
            service_name,
            service_namespace,
            cluster_domain,
            client_ca,
            metrics_apiservice,
            delegate_resources,
            delegate_paths,
        } = self;

        let rules = delegate_resources
            .iter()
            .map(|r| Rule::parse_resource(r))
            .chain(delegate_paths.iter().map(|p| Rule::parse_path(p)))
            .collect::<Result<Vec<_>, _>>()?;
        let translator: Arc<dyn Translator> =
            Arc::new(SingleNamespace::new(target_namespace.clone(), vcluster_name)?);
        let signer = CaSigner::from_pem(
            std::fs::read_to_string(&ca_cert)
                .with_context(|| format!("failed to read {}", ca_cert.display()))?,
            std::fs::read_to_string(&ca_key)
                .with_context(|| format!("failed to read {}", ca_key.display()))?,
        )?;

        let mut prom = <Registry>::default();
        let gateway_reg = prom.sub_registry_with_prefix("gateway");
        let gateway_metrics = GatewayMetrics::register(gateway_reg);
        let syncer_metrics = SyncerMetrics::register(gateway_reg);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let host = runtime.client();
        let (virt, passthrough) =
            virtual_clients(&virtual_kubeconfig, virtual_server_url, virtual_ca.as_deref())
                .await?;

        // Index virtual nodes so kubelet requests can be matched by address.
        let (nodes, writer) = reflector::store::<Node>();
        let node_events = reflector(
            writer,
            watcher(Api::<Node>::all(virt.clone()), watcher::Config::default()),
        )
        .default_backoff()
        .touched_objects()
        .for_each(|res| {
            if let Err(error) = res {
                warn!(%error, "Node watch failed");
            }
            future::ready(())
        });
        tokio::spawn(node_events.instrument(info_span!("nodes")));

        // Serving certificates.
        let store = CertStore::default();
        let mut sans = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        sans.extend(extra_sans);
        let mut syncer = Syncer::new(store.clone(), Arc::new(signer), syncer_metrics)
            .with_provider(StaticSans(sans))
            .with_listener(|material| info!(sans = ?material.sans, "Reloaded serving certificate"));
        if let Some(name) = service_name {
            let namespace = service_namespace.unwrap_or_else(|| target_namespace.clone());
            syncer = syncer.with_provider(HostServiceSans::new(
                host.clone(),
                namespace,
                name,
                cluster_domain,
            ));
        }
        syncer.run_once().await?;
        tokio::spawn(
            syncer
                .run(runtime.shutdown_handle())
                .instrument(info_span!("certs")),
        );

        // Authentication and authorization.
        let mut authn = Authenticators::new(Arc::new(DelegatingAuthenticator::new(Arc::new(
            host.clone(),
        ))))
        .with_virtual(Arc::new(DelegatingAuthenticator::new(Arc::new(virt.clone()))));
        if client_ca.is_some() {
            authn = authn.with_client_certs(ClientCertAuthenticator::new());
        }
        let host_check = || HostCheck::new(Arc::new(host.clone()));
        let authz = Union::standard(
            KubeletAuthorizer::new(host_check()),
            DelegatingAuthorizer::new(rules, host_check()),
            ImpersonationAuthorizer::new(host_check()),
        );

        let host_upstream = Upstream::new(host.clone(), Credentials::Client);
        let passthrough = Upstream::new(passthrough, Credentials::Passthrough);
        let pipeline = Pipeline::new(
            passthrough.clone(),
            Upstream::new(virt.clone(), Credentials::Impersonate),
        )
        .with_filter(K3sTunnel::new(passthrough))
        .with_filter(FakeKubelet::new(
            host_upstream.clone(),
            virt.clone(),
            translator.clone(),
        ))
        .with_filter(SubresourceRedirect::new(
            host_upstream.clone(),
            virt.clone(),
            translator.clone(),
        ))
        .with_filter(NodeWrite::new(host.clone(), virt.clone()))
        .with_filter(ServiceWrite::new(
            host.clone(),
            virt.clone(),
            translator.clone(),
        ))
        .with_filter(MetricsServerProxy::new(
            host_upstream,
            virt.clone(),
            translator,
        ))
        .with_rbac(VirtualRbac::new(Arc::new(virt.clone())));

        let gateway = Gateway::new(authn, authz, Arc::new(nodes), pipeline, gateway_metrics);
        let tls = server::tls_config(&store, client_ca.as_deref())?;

        tokio::spawn(
            server::serve(
                "gateway",
                listen_addr,
                tls.clone(),
                gateway.clone(),
                runtime.shutdown_handle(),
            )
            .map_err(|error| tracing::error!(%error, "Gateway server failed"))
            .instrument(info_span!("gateway")),
        );
        tokio::spawn(
            server::serve(
                "apiservice",
                apiservice_listen_addr,
                tls,
                AllowList::new(gateway),
                runtime.shutdown_handle(),
            )
            .map_err(|error| tracing::error!(%error, "APIService server failed"))
            .instrument(info_span!("apiservice")),
        );

        tokio::spawn(
            apiservice::reconcile(
                virt,
                Registration::metrics(apiservice_listen_addr.port()),
                metrics_apiservice,
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("apiservices")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Builds the privileged virtual cluster client and the credential-less
/// client used for pass-through requests.
async fn virtual_clients(
    kubeconfig: &std::path::Path,
    server_url: Option<http::Uri>,
    ca: Option<&std::path::Path>,
) -> Result<(kube::Client, kube::Client)> {
    let kubeconfig = Kubeconfig::read_from(kubeconfig)?;
    let config =
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;

    let mut passthrough = config.clone();
    passthrough.auth_info = Default::default();
    if let Some(url) = server_url {
        passthrough.cluster_url = url;
    }
    if let Some(path) = ca {
        let pem = std::fs::read(path)
            .with_context(|| format!("failed to read virtual CA {}", path.display()))?;
        let roots = rustls_pemfile::certs(&mut pem.as_slice())
            .map(|cert| cert.map(|c| c.to_vec()))
            .collect::<Result<Vec<_>, _>>()?;
        if roots.is_empty() {
            bail!("no certificates found in {}", path.display());
        }
        passthrough.root_cert = Some(roots);
    }

    Ok((
        kube::Client::try_from(config)?,
        kube::Client::try_from(passthrough)?,
    ))
}
