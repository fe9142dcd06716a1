//! Fleet reconciler - scale sets of the cluster's compute fleets.
//!
//! Per fleet and pass at most one thing happens: the capacity moves by one
//! step, the scale set model is switched to the new release, or a single
//! instance is updated, drained or reimaged. An instance that the provider
//! still reports as in flight blocks the whole fleet until it settles.
//!
//! The scale set model also carries the key that decrypts the fleet's
//! bootstrap document. A key change rewrites the model like a release does.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::{Patch, Resource, Step};
use crate::audit::AuditLogger;
use crate::bootstrap::KeyRing;
use crate::clients::{BootstrapKey, ScaleSetClient, ScaleSetInstance};
use crate::cluster::ClusterSpec;
use crate::error::{Error, ProviderError, Result};
use crate::gatekeeper::Gatekeeper;
use crate::scale::ScaleStrategy;
use crate::workingset::{self, WorkingSet};

/// Observed or desired state of one fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetState {
    pub capacity: i64,
    pub version: String,
    pub bootstrap_key: BootstrapKey,
    pub instances: Vec<ScaleSetInstance>,
}

/// Fleet states keyed by fleet name.
pub type Fleets = BTreeMap<String, FleetState>;

/// The single action taken on a fleet this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetAction {
    /// Create the scale set.
    Create { capacity: i64, version: String },
    /// Move the capacity one step toward the desired count.
    Scale { capacity: i64, version: String },
    /// Switch the scale set model to a new release or bootstrap key.
    UpdateModel { capacity: i64, version: String },
    UpdateInstance(String),
    DrainInstance(String),
    ReimageInstance(String),
    /// An instance is in flight, nothing may be touched.
    Wait(String),
    Delete,
}

/// Actions keyed by fleet name.
pub type FleetActions = BTreeMap<String, FleetAction>;

/// Fleet reconciler backed by the scale set API.
pub struct FleetReconciler {
    client: Arc<dyn ScaleSetClient>,
    strategy: Arc<dyn ScaleStrategy>,
    gate: Gatekeeper,
    keys: KeyRing,
    audit: AuditLogger,
}

impl FleetReconciler {
    /// `keys` must be the key ring the bootstrap documents are encrypted with.
    pub fn new(
        client: Arc<dyn ScaleSetClient>,
        strategy: Arc<dyn ScaleStrategy>,
        gate: Gatekeeper,
        keys: KeyRing,
    ) -> Self {
        Self {
            client,
            strategy,
            gate,
            keys,
            audit: AuditLogger::new("fleet"),
        }
    }

    fn bootstrap_key(&self, cluster: &ClusterSpec) -> BootstrapKey {
        BootstrapKey::from_encrypter(&self.keys.encrypter(&cluster.id))
    }

    /// Close the gate on throttling responses and hand the error back.
    fn check_throttle(&self, err: ProviderError) -> Error {
        if let ProviderError::Throttled { retry_after } = &err {
            let delay = chrono::Duration::from_std(*retry_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            let not_before = Utc::now() + delay;
            warn!(retry_after = %not_before, "Scale set API throttled");
            self.gate.not_before(not_before);
        }
        Error::Provider(err)
    }

    fn gate_closed(&self) -> Option<String> {
        if self.gate.can_proceed() {
            return None;
        }
        let until = self
            .gate
            .retry_after()
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        Some(format!("scale set API throttled until {}", until))
    }

    /// Pick the action for one existing fleet.
    fn next_action(&self, current: &FleetState, desired: &FleetState) -> Option<FleetAction> {
        if let Some(busy) = current
            .instances
            .iter()
            .find(|i| !i.provisioning_state.is_final())
        {
            return Some(FleetAction::Wait(busy.id.clone()));
        }

        if current.capacity != desired.capacity {
            return Some(FleetAction::Scale {
                capacity: self
                    .strategy
                    .get_node_count(current.capacity, desired.capacity),
                version: current.version.clone(),
            });
        }

        if current.version != desired.version {
            return Some(FleetAction::UpdateModel {
                capacity: current.capacity,
                version: desired.version.clone(),
            });
        }

        if current.bootstrap_key != desired.bootstrap_key {
            return Some(FleetAction::UpdateModel {
                capacity: current.capacity,
                version: current.version.clone(),
            });
        }

        let ws = WorkingSet::from_snapshot(&current.instances, &desired.version);
        if !workingset::is_wip(ws.as_ref()) {
            return None;
        }
        if let Some(i) = workingset::instance_to_update(ws.as_ref()) {
            return Some(FleetAction::UpdateInstance(i.id.clone()));
        }
        if let Some(i) = workingset::instance_to_drain(ws.as_ref()) {
            return Some(FleetAction::DrainInstance(i.id.clone()));
        }
        if let Some(i) = workingset::instance_to_reimage(ws.as_ref()) {
            return Some(FleetAction::ReimageInstance(i.id.clone()));
        }
        workingset::instance_already_being_updated(ws.as_ref())
            .map(|i| FleetAction::Wait(i.id.clone()))
    }

    async fn apply(
        &self,
        cluster: &ClusterSpec,
        fleet: &str,
        action: &FleetAction,
    ) -> Result<Step<()>> {
        let name = cluster.scale_set_name(fleet);
        let client = &self.client;

        match action {
            FleetAction::Create { capacity, version }
            | FleetAction::Scale { capacity, version }
            | FleetAction::UpdateModel { capacity, version } => {
                info!(
                    "Setting scale set {} to capacity {} version {}",
                    name, capacity, version
                );
                self.audit.change(
                    &cluster.id,
                    &name,
                    format!("scale set capacity={} version={}", capacity, version),
                );
                let key = self.bootstrap_key(cluster);
                let op = client
                    .create_or_update(&name, *capacity, version, &key)
                    .await
                    .map_err(|e| self.check_throttle(e))?;
                client
                    .await_operation(&op)
                    .await
                    .map_err(|e| self.check_throttle(e))?;
            }
            FleetAction::UpdateInstance(id) => {
                info!("Updating instance {} of {}", id, name);
                self.audit.change(&cluster.id, id, "instance update");
                let op = client
                    .update_instance(&name, id)
                    .await
                    .map_err(|e| self.check_throttle(e))?;
                client
                    .await_operation(&op)
                    .await
                    .map_err(|e| self.check_throttle(e))?;
            }
            FleetAction::DrainInstance(id) => {
                info!("Draining instance {} of {}", id, name);
                self.audit.change(&cluster.id, id, "instance drain");
                client
                    .drain_instance(&name, id)
                    .await
                    .map_err(|e| self.check_throttle(e))?;
            }
            FleetAction::ReimageInstance(id) => {
                info!("Reimaging instance {} of {}", id, name);
                self.audit.change(&cluster.id, id, "instance reimage");
                let op = client
                    .reimage_instance(&name, id)
                    .await
                    .map_err(|e| self.check_throttle(e))?;
                client
                    .await_operation(&op)
                    .await
                    .map_err(|e| self.check_throttle(e))?;
            }
            FleetAction::Wait(id) => {
                return Ok(Step::Defer(format!(
                    "instance {} of {} is still being updated",
                    id, name
                )));
            }
            FleetAction::Delete => {
                info!("Deleting scale set {}", name);
                self.audit.change(&cluster.id, &name, "scale set delete");
                match client.delete(&name).await {
                    Ok(op) => client
                        .await_operation(&op)
                        .await
                        .map_err(|e| self.check_throttle(e))?,
                    Err(e) if e.is_not_found() => debug!("Scale set {} already gone", name),
                    Err(e) => return Err(self.check_throttle(e)),
                }
            }
        }
        Ok(Step::Continue(()))
    }

    /// Apply every fleet's action. Deferrals of single fleets do not stop
    /// the others; the pass is deferred if any fleet was.
    async fn apply_all(
        &self,
        cluster: &ClusterSpec,
        actions: &FleetActions,
    ) -> Result<Step<()>> {
        if let Some(reason) = self.gate_closed() {
            return Ok(Step::Defer(reason));
        }

        let mut deferred = Vec::new();
        for (fleet, action) in actions {
            if let Step::Defer(reason) = self.apply(cluster, fleet, action).await? {
                debug!("{}", reason);
                deferred.push(reason);
            }
        }

        if deferred.is_empty() {
            Ok(Step::Continue(()))
        } else {
            Ok(Step::Defer(deferred.join("; ")))
        }
    }
}

#[async_trait]
impl Resource for FleetReconciler {
    type Object = ClusterSpec;
    type State = Fleets;
    type Change = FleetActions;

    fn name(&self) -> &'static str {
        "fleet"
    }

    async fn current_state(&self, cluster: &ClusterSpec) -> Result<Step<Fleets>> {
        let mut fleets = Fleets::new();
        for fleet in &cluster.fleets {
            match self.client.get(&cluster.scale_set_name(&fleet.name)).await {
                Ok(set) => {
                    fleets.insert(
                        fleet.name.clone(),
                        FleetState {
                            capacity: set.capacity,
                            version: set.model_version,
                            bootstrap_key: set.bootstrap_key,
                            instances: set.instances,
                        },
                    );
                }
                Err(e) if e.is_not_found() => {
                    debug!("Scale set for fleet {} not found", fleet.name)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Step::Continue(fleets))
    }

    async fn desired_state(&self, cluster: &ClusterSpec) -> Result<Step<Fleets>> {
        let bootstrap_key = self.bootstrap_key(cluster);
        Ok(Step::Continue(
            cluster
                .fleets
                .iter()
                .map(|f| {
                    (
                        f.name.clone(),
                        FleetState {
                            capacity: f.replicas,
                            version: cluster.version.clone(),
                            bootstrap_key: bootstrap_key.clone(),
                            instances: Vec::new(),
                        },
                    )
                })
                .collect(),
        ))
    }

    fn new_update_patch(
        &self,
        _cluster: &ClusterSpec,
        current: &Fleets,
        desired: &Fleets,
    ) -> Result<Patch<FleetActions>> {
        let mut create = FleetActions::new();
        let mut update = FleetActions::new();

        for (name, want) in desired {
            match current.get(name) {
                None => {
                    create.insert(
                        name.clone(),
                        FleetAction::Create {
                            capacity: self.strategy.get_node_count(0, want.capacity),
                            version: want.version.clone(),
                        },
                    );
                }
                Some(have) => {
                    if let Some(action) = self.next_action(have, want) {
                        update.insert(name.clone(), action);
                    }
                }
            }
        }

        let mut patch = Patch::new();
        if !create.is_empty() {
            patch = patch.with_create(create);
        }
        if !update.is_empty() {
            patch = patch.with_update(update);
        }
        Ok(patch)
    }

    fn new_delete_patch(
        &self,
        _cluster: &ClusterSpec,
        current: &Fleets,
        _desired: &Fleets,
    ) -> Result<Patch<FleetActions>> {
        let delete: FleetActions = current
            .keys()
            .map(|name| (name.clone(), FleetAction::Delete))
            .collect();
        if delete.is_empty() {
            return Ok(Patch::new());
        }
        Ok(Patch::new().with_delete(delete))
    }

    async fn apply_create_change(
        &self,
        cluster: &ClusterSpec,
        change: &FleetActions,
    ) -> Result<Step<()>> {
        self.apply_all(cluster, change).await
    }

    async fn apply_update_change(
        &self,
        cluster: &ClusterSpec,
        change: &FleetActions,
    ) -> Result<Step<()>> {
        self.apply_all(cluster, change).await
    }

    async fn apply_delete_change(
        &self,
        cluster: &ClusterSpec,
        change: &FleetActions,
    ) -> Result<Step<()>> {
        self.apply_all(cluster, change).await
    }
}
