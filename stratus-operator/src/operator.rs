//! Operator loop - drives every managed resource of one cluster.
//!
//! Handlers run in a fixed order each pass: blobs first so new nodes find
//! their bootstrap configuration, then fleets, then the VPN. Teardown walks
//! the list backwards. A failing handler is logged and the pass moves on to
//! the next one; the following tick retries from fresh provider state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::bootstrap::KeyRing;
use crate::clients::MemoryCloud;
use crate::cluster::ClusterSpec;
use crate::error::{Error, Result};
use crate::gatekeeper::Gatekeeper;
use crate::reconciler::blob::BlobReconciler;
use crate::reconciler::fleet::FleetReconciler;
use crate::reconciler::vpn::{VpnReconciler, VpnSide};
use crate::reconciler::{self, ReconcileOutcome, Resource};
use crate::scale::Incremental;

/// Object-safe view of a cluster resource.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reconcile(&self, cluster: &ClusterSpec) -> Result<ReconcileOutcome>;

    async fn teardown(&self, cluster: &ClusterSpec) -> Result<ReconcileOutcome>;
}

#[async_trait]
impl<R> Handler for R
where
    R: Resource<Object = ClusterSpec>,
{
    fn name(&self) -> &'static str {
        Resource::name(self)
    }

    async fn reconcile(&self, cluster: &ClusterSpec) -> Result<ReconcileOutcome> {
        reconciler::reconcile(self, cluster).await
    }

    async fn teardown(&self, cluster: &ClusterSpec) -> Result<ReconcileOutcome> {
        reconciler::teardown(self, cluster).await
    }
}

/// Outcome of every handler in one pass.
#[derive(Debug, Default)]
pub struct PassReport {
    pub outcomes: Vec<(&'static str, std::result::Result<ReconcileOutcome, Error>)>,
}

impl PassReport {
    /// Every handler found its resource converged.
    pub fn is_converged(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, r)| matches!(r, Ok(ReconcileOutcome::Converged)))
    }

    pub fn error_count(&self) -> usize {
        self.outcomes.iter().filter(|(_, r)| r.is_err()).count()
    }

    pub fn outcome(&self, handler: &str) -> Option<&std::result::Result<ReconcileOutcome, Error>> {
        self.outcomes
            .iter()
            .find(|(name, _)| *name == handler)
            .map(|(_, r)| r)
    }
}

/// Reconciles one cluster against its providers.
pub struct Operator {
    cluster: ClusterSpec,
    handlers: Vec<Box<dyn Handler>>,
}

impl Operator {
    pub fn new(cluster: ClusterSpec) -> Self {
        Self {
            cluster,
            handlers: Vec::new(),
        }
    }

    /// Append a handler; handlers run in insertion order.
    pub fn with_handler(mut self, handler: Box<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Operator over two in-memory subscriptions.
    ///
    /// `guest` holds the cluster's own resources, `host` the peer side of the
    /// VPN. The scale set and connection APIs throttle independently, so
    /// each gets its own gate. Blobs and fleets share the key ring: the
    /// documents are encrypted with the key the scale set model carries.
    pub fn simulated(cluster: ClusterSpec, host: &MemoryCloud, guest: &MemoryCloud) -> Self {
        let fleet_gate = Gatekeeper::new();
        let connection_gate = Gatekeeper::new();
        let keys = KeyRing::new();

        let blob = BlobReconciler::new(Arc::new(guest.clone()), keys.clone());
        let fleet = FleetReconciler::new(
            Arc::new(guest.clone()),
            Arc::new(Incremental),
            fleet_gate,
            keys,
        );
        let vpn = VpnReconciler::new(
            VpnSide::new(Arc::new(host.clone()), Arc::new(host.clone())),
            VpnSide::new(Arc::new(guest.clone()), Arc::new(guest.clone())),
            connection_gate,
        );

        Self::new(cluster)
            .with_handler(Box::new(blob))
            .with_handler(Box::new(fleet))
            .with_handler(Box::new(vpn))
    }

    pub fn cluster(&self) -> &ClusterSpec {
        &self.cluster
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Run one converging pass over every handler.
    pub async fn run_once(&self) -> PassReport {
        let mut report = PassReport::default();
        for handler in &self.handlers {
            let result = handler.reconcile(&self.cluster).await;
            log_outcome(&self.cluster.id, handler.name(), &result);
            report.outcomes.push((handler.name(), result));
        }
        report
    }

    /// Run one removal pass, last handler first.
    pub async fn teardown_once(&self) -> PassReport {
        let mut report = PassReport::default();
        for handler in self.handlers.iter().rev() {
            let result = handler.teardown(&self.cluster).await;
            log_outcome(&self.cluster.id, handler.name(), &result);
            report.outcomes.push((handler.name(), result));
        }
        report
    }

    /// Reconcile on every tick until the task is dropped.
    pub async fn run(&self, resync: Duration) {
        info!(
            cluster = %self.cluster.id,
            handlers = ?self.handler_names(),
            "Starting reconcile loop every {:?}",
            resync
        );
        let mut ticker = interval(resync);
        loop {
            ticker.tick().await;
            let report = self.run_once().await;
            if report.is_converged() {
                debug!(cluster = %self.cluster.id, "Cluster converged");
            } else if report.error_count() > 0 {
                warn!(
                    cluster = %self.cluster.id,
                    errors = report.error_count(),
                    "Pass finished with errors"
                );
            }
        }
    }

    /// Repeat teardown passes until nothing is left or `max_passes` is hit.
    /// At least one pass runs.
    ///
    /// Returns the report of the last pass; it is converged only if the
    /// teardown finished.
    pub async fn teardown_all(&self, resync: Duration, max_passes: usize) -> PassReport {
        let mut ticker = interval(resync);
        let mut report = PassReport::default();
        for pass in 1..=max_passes.max(1) {
            ticker.tick().await;
            report = self.teardown_once().await;
            if report.is_converged() {
                info!(cluster = %self.cluster.id, pass, "Teardown complete");
                return report;
            }
        }
        warn!(
            cluster = %self.cluster.id,
            passes = max_passes,
            "Teardown did not finish"
        );
        report
    }
}

fn log_outcome(cluster_id: &str, handler: &str, result: &Result<ReconcileOutcome>) {
    match result {
        Ok(ReconcileOutcome::Converged) => {
            debug!(cluster = %cluster_id, handler, "Converged")
        }
        Ok(ReconcileOutcome::Changed) => info!(cluster = %cluster_id, handler, "Changes applied"),
        Ok(ReconcileOutcome::Deferred(reason)) => {
            info!(cluster = %cluster_id, handler, reason = %reason, "Deferred")
        }
        Err(e) => error!(cluster = %cluster_id, handler, error = %e, "Reconciliation failed"),
    }
}
