use crate::{CertStore, Error, Generator, Material, SanProvider};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use rand::Rng;
use std::sync::Arc;
use tokio::time;
use tracing::{debug, info, warn};

pub const INTERVAL: time::Duration = time::Duration::from_secs(2);
/// Each wait lasts up to `INTERVAL * (1 + JITTER)`.
pub const JITTER: f64 = 1.25;

type Listener = Box<dyn Fn(&Material) + Send + Sync>;

/// Reissues the serving certificate whenever the set of serving names
/// changes.
pub struct Syncer {
    store: CertStore,
    generator: Arc<dyn Generator>,
    providers: Vec<Arc<dyn SanProvider>>,
    listeners: Vec<Listener>,
    metrics: SyncerMetrics,
}

#[derive(Clone, Debug, Default)]
pub struct SyncerMetrics {
    rotations: Counter,
    errors: Counter,
}

// === impl Syncer ===

impl Syncer {
    pub fn new(store: CertStore, generator: Arc<dyn Generator>, metrics: SyncerMetrics) -> Self {
        Self {
            store,
            generator,
            providers: Vec::new(),
            listeners: Vec::new(),
            metrics,
        }
    }

    pub fn with_provider(mut self, provider: impl SanProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Registers a callback that runs after every rotation.
    pub fn with_listener(mut self, listener: impl Fn(&Material) + Send + Sync + 'static) -> Self {
        self.listeners.push(Box::new(listener));
        self
    }

    pub fn store(&self) -> &CertStore {
        &self.store
    }

    /// Runs a single sync cycle, returning whether the certificate changed.
    pub async fn run_once(&self) -> Result<bool, Error> {
        let mut sans = Vec::new();
        for provider in &self.providers {
            sans.extend(provider.sans().await?);
        }
        sans.sort();
        sans.dedup();

        let current = self.store.material();
        if current.as_ref().is_some_and(|m| m.sans == sans) {
            debug!("Serving names unchanged");
            return Ok(false);
        }

        let material = self.generator.generate(current.as_ref(), &sans)?;
        self.store.swap(material.clone())?;
        self.metrics.rotations.inc();
        info!(sans = ?material.sans, "Issued serving certificate");

        for listener in &self.listeners {
            listener(&material);
        }
        Ok(true)
    }

    /// Syncs on a jittered interval until shutdown. A failed cycle keeps the
    /// current certificate.
    pub async fn run(self, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = time::sleep(jittered(INTERVAL, JITTER)) => {}
                _ = &mut shutdown => {
                    debug!("Shutting down");
                    return;
                }
            }

            if let Err(error) = self.run_once().await {
                self.metrics.errors.inc();
                warn!(%error, "Failed to sync serving certificate");
            }
        }
    }
}

fn jittered(base: time::Duration, factor: f64) -> time::Duration {
    base + base.mul_f64(rand::thread_rng().gen_range(0.0..factor))
}

// === impl SyncerMetrics ===

impl SyncerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "serving_cert_rotations",
            "Serving certificates issued",
            metrics.rotations.clone(),
        );
        reg.register(
            "serving_cert_sync_errors",
            "Serving certificate sync cycles that failed",
            metrics.errors.clone(),
        );
        metrics
    }
}
