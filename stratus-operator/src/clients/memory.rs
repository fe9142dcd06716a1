//! In-process cloud backend.
//!
//! Implements every provider trait against in-memory maps. Mutating calls
//! leave the resource in a non-final provisioning state until the returned
//! operation is awaited. An operation nobody awaits still finishes in the
//! background: the first read of its resource reports it in flight, the
//! next one sees it settled. Used by the operator's simulated mode and by
//! tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{
    BlobClient, BootstrapKey, ConnectionClient, ConnectionDescriptor, ConnectionId,
    ConnectionStatus, GatewayClient, Operation, ProvisioningState, ScaleSet, ScaleSetClient,
    ScaleSetInstance, VpnGateway,
};
use crate::error::ProviderError;

/// Work applied when an operation completes.
#[derive(Debug, Clone)]
enum Pending {
    ConnectionUpsert(ConnectionId),
    ConnectionDelete(ConnectionId),
    ScaleSetUpsert(String),
    ScaleSetDelete(String),
    InstanceUpdate(String, String),
    InstanceReimage(String, String),
}

impl Pending {
    /// Resource the work acts on, keyed like [`connection_key`] and
    /// [`scale_set_key`].
    fn resource(&self) -> String {
        match self {
            Pending::ConnectionUpsert(id) | Pending::ConnectionDelete(id) => connection_key(id),
            Pending::ScaleSetUpsert(name)
            | Pending::ScaleSetDelete(name)
            | Pending::InstanceUpdate(name, _)
            | Pending::InstanceReimage(name, _) => scale_set_key(name),
        }
    }
}

fn connection_key(id: &ConnectionId) -> String {
    format!("connection {}", id)
}

fn scale_set_key(name: &str) -> String {
    format!("scaleset {}", name)
}

#[derive(Debug)]
struct InFlight {
    op: Operation,
    work: Pending,
    seq: u64,
    /// A read has already reported the resource in flight.
    observed: bool,
}

#[derive(Debug, Default)]
struct CloudState {
    connections: BTreeMap<ConnectionId, ConnectionDescriptor>,
    gateways: BTreeMap<(String, String), VpnGateway>,
    containers: BTreeMap<String, BTreeMap<String, String>>,
    scale_sets: BTreeMap<String, ScaleSet>,
    pending: HashMap<String, InFlight>,
    /// Operations settled by a read before anyone awaited them.
    finished: HashSet<String>,
    calls: Vec<String>,
    reads: Vec<String>,
    fail_next: Option<ProviderError>,
    next_instance: u64,
    next_op: u64,
}

impl CloudState {
    /// Settle the work on `resource` that an earlier read already reported
    /// in flight, and mark the rest as reported.
    fn observe(&mut self, resource: &str) {
        let mut due: Vec<(u64, String)> = Vec::new();
        for (id, inflight) in self.pending.iter_mut() {
            if inflight.work.resource() != resource {
                continue;
            }
            if inflight.observed {
                due.push((inflight.seq, id.clone()));
            } else {
                inflight.observed = true;
            }
        }
        due.sort();

        for (_, id) in due {
            if let Some(inflight) = self.pending.remove(&id) {
                self.finished.insert(id);
                self.finish(inflight);
            }
        }
    }

    fn finish(&mut self, inflight: InFlight) {
        debug!(
            operation = %inflight.op.id,
            kind = %inflight.op.kind,
            target = %inflight.op.target,
            "Operation completed"
        );

        match inflight.work {
            Pending::ConnectionUpsert(id) => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.provisioning_state = ProvisioningState::Succeeded;
                    conn.connection_status = ConnectionStatus::Connected;
                }
            }
            Pending::ConnectionDelete(id) => {
                self.connections.remove(&id);
            }
            Pending::ScaleSetUpsert(name) => {
                if let Some(set) = self.scale_sets.get_mut(&name) {
                    for instance in &mut set.instances {
                        if instance.provisioning_state == ProvisioningState::Creating {
                            instance.provisioning_state = ProvisioningState::Succeeded;
                        }
                    }
                }
            }
            Pending::ScaleSetDelete(name) => {
                self.scale_sets.remove(&name);
            }
            Pending::InstanceUpdate(name, instance_id) => {
                if let Some(instance) = find_instance(self, &name, &instance_id) {
                    instance.latest_model_applied = true;
                    instance.provisioning_state = ProvisioningState::Succeeded;
                }
            }
            Pending::InstanceReimage(name, instance_id) => {
                let model_version = self
                    .scale_sets
                    .get(&name)
                    .map(|s| s.model_version.clone())
                    .unwrap_or_default();
                if let Some(instance) = find_instance(self, &name, &instance_id) {
                    instance.version = model_version;
                    instance.drained = false;
                    instance.provisioning_state = ProvisioningState::Succeeded;
                }
            }
        }
    }
}

/// One subscription of a simulated cloud. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCloud {
    state: Arc<Mutex<CloudState>>,
    latency: Duration,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied when awaiting an operation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a mutating call, failing it if a failure was injected.
    fn record(&self, call: String) -> Result<(), ProviderError> {
        let mut state = self.state();
        if let Some(err) = state.fail_next.take() {
            debug!(call = %call, error = %err, "Injected provider failure");
            return Err(err);
        }
        state.calls.push(call);
        Ok(())
    }

    fn begin(&self, kind: &str, target: String, work: Pending) -> Operation {
        let op = Operation::new(kind, target);
        let mut state = self.state();
        state.next_op += 1;
        let inflight = InFlight {
            op: op.clone(),
            work,
            seq: state.next_op,
            observed: false,
        };
        state.pending.insert(op.id.clone(), inflight);
        op
    }

    fn complete(&self, op: &Operation) -> Result<(), ProviderError> {
        let mut state = self.state();
        if state.finished.remove(&op.id) {
            return Ok(());
        }
        let inflight = state
            .pending
            .remove(&op.id)
            .ok_or_else(|| ProviderError::Request(format!("unknown operation {}", op.id)))?;
        state.finish(inflight);
        Ok(())
    }

    async fn settle(&self, op: &Operation) -> Result<(), ProviderError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.complete(op)
    }

    // === Test and simulation helpers ===

    /// Fail the next mutating call with `err`.
    pub fn fail_next(&self, err: ProviderError) {
        self.state().fail_next = Some(err);
    }

    /// Mutating calls issued so far, e.g. `connection.create_or_update rg/name`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        let mut state = self.state();
        state.calls.clear();
        state.reads.clear();
    }

    /// Read calls issued so far, e.g. `connection.get rg/name`.
    pub fn reads(&self) -> Vec<String> {
        self.state().reads.clone()
    }

    pub fn insert_gateway(&self, resource_group: &str, gateway: VpnGateway) {
        self.state()
            .gateways
            .insert((resource_group.to_string(), gateway.name.clone()), gateway);
    }

    pub fn insert_connection(&self, id: ConnectionId, connection: ConnectionDescriptor) {
        self.state().connections.insert(id, connection);
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<ConnectionDescriptor> {
        self.state().connections.get(id).cloned()
    }

    pub fn insert_scale_set(&self, set: ScaleSet) {
        self.state().scale_sets.insert(set.name.clone(), set);
    }

    pub fn scale_set(&self, name: &str) -> Option<ScaleSet> {
        self.state().scale_sets.get(name).cloned()
    }

    pub fn blobs(&self, container: &str) -> Option<BTreeMap<String, String>> {
        self.state().containers.get(container).cloned()
    }
}

fn find_instance<'a>(
    state: &'a mut CloudState,
    name: &str,
    instance_id: &str,
) -> Option<&'a mut ScaleSetInstance> {
    state
        .scale_sets
        .get_mut(name)?
        .instances
        .iter_mut()
        .find(|i| i.id == instance_id)
}

#[async_trait]
impl ConnectionClient for MemoryCloud {
    async fn get(&self, id: &ConnectionId) -> Result<ConnectionDescriptor, ProviderError> {
        let mut state = self.state();
        state.reads.push(format!("connection.get {}", id));
        state.observe(&connection_key(id));
        state
            .connections
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("connection {}", id)))
    }

    async fn create_or_update(
        &self,
        id: &ConnectionId,
        connection: &ConnectionDescriptor,
    ) -> Result<Operation, ProviderError> {
        self.record(format!("connection.create_or_update {}", id))?;
        let mut stored = connection.clone();
        stored.provisioning_state = ProvisioningState::Updating;
        stored.connection_status = ConnectionStatus::Connecting;
        self.state().connections.insert(id.clone(), stored);
        Ok(self.begin(
            "create_or_update",
            id.to_string(),
            Pending::ConnectionUpsert(id.clone()),
        ))
    }

    async fn delete(&self, id: &ConnectionId) -> Result<Operation, ProviderError> {
        if !self.state().connections.contains_key(id) {
            return Err(ProviderError::NotFound(format!("connection {}", id)));
        }
        self.record(format!("connection.delete {}", id))?;
        if let Some(conn) = self.state().connections.get_mut(id) {
            conn.provisioning_state = ProvisioningState::Deleting;
        }
        Ok(self.begin("delete", id.to_string(), Pending::ConnectionDelete(id.clone())))
    }

    async fn await_operation(&self, op: &Operation) -> Result<(), ProviderError> {
        self.settle(op).await
    }
}

#[async_trait]
impl GatewayClient for MemoryCloud {
    async fn get_gateway(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<VpnGateway, ProviderError> {
        let mut state = self.state();
        state
            .reads
            .push(format!("gateway.get {}/{}", resource_group, name));
        state
            .gateways
            .get(&(resource_group.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("gateway {}/{}", resource_group, name)))
    }
}

#[async_trait]
impl BlobClient for MemoryCloud {
    async fn list(&self, container: &str) -> Result<BTreeMap<String, String>, ProviderError> {
        self.state()
            .containers
            .get(container)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("container {}", container)))
    }

    async fn ensure_container(&self, container: &str) -> Result<(), ProviderError> {
        if self.state().containers.contains_key(container) {
            return Ok(());
        }
        self.record(format!("blob.ensure_container {}", container))?;
        self.state()
            .containers
            .insert(container.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn put(&self, container: &str, key: &str, body: &str) -> Result<(), ProviderError> {
        self.record(format!("blob.put {}/{}", container, key))?;
        let mut state = self.state();
        let blobs = state
            .containers
            .get_mut(container)
            .ok_or_else(|| ProviderError::NotFound(format!("container {}", container)))?;
        blobs.insert(key.to_string(), body.to_string());
        Ok(())
    }

    async fn delete(&self, container: &str, key: &str) -> Result<(), ProviderError> {
        let exists = self
            .state()
            .containers
            .get(container)
            .is_some_and(|b| b.contains_key(key));
        if !exists {
            return Err(ProviderError::NotFound(format!("blob {}/{}", container, key)));
        }
        self.record(format!("blob.delete {}/{}", container, key))?;
        if let Some(blobs) = self.state().containers.get_mut(container) {
            blobs.remove(key);
        }
        Ok(())
    }
}

#[async_trait]
impl ScaleSetClient for MemoryCloud {
    async fn get(&self, name: &str) -> Result<ScaleSet, ProviderError> {
        let mut state = self.state();
        state.observe(&scale_set_key(name));
        state
            .scale_sets
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("scale set {}", name)))
    }

    async fn create_or_update(
        &self,
        name: &str,
        capacity: i64,
        model_version: &str,
        bootstrap_key: &BootstrapKey,
    ) -> Result<Operation, ProviderError> {
        self.record(format!(
            "scaleset.create_or_update {} capacity={} version={}",
            name, capacity, model_version
        ))?;

        let mut guard = self.state();
        let state = &mut *guard;
        let set = state
            .scale_sets
            .entry(name.to_string())
            .or_insert_with(|| ScaleSet {
                name: name.to_string(),
                capacity: 0,
                model_version: model_version.to_string(),
                bootstrap_key: bootstrap_key.clone(),
                instances: Vec::new(),
            });
        set.bootstrap_key = bootstrap_key.clone();

        if set.model_version != model_version {
            set.model_version = model_version.to_string();
            for instance in &mut set.instances {
                instance.latest_model_applied = false;
            }
        }

        let target = capacity.max(0) as usize;
        set.instances.truncate(target);
        while set.instances.len() < target {
            state.next_instance += 1;
            set.instances.push(ScaleSetInstance {
                id: format!("{}-{:06}", name, state.next_instance),
                latest_model_applied: true,
                provisioning_state: ProvisioningState::Creating,
                version: model_version.to_string(),
                drained: false,
            });
        }
        set.capacity = capacity;
        drop(guard);

        Ok(self.begin(
            "create_or_update",
            name.to_string(),
            Pending::ScaleSetUpsert(name.to_string()),
        ))
    }

    async fn update_instance(
        &self,
        name: &str,
        instance_id: &str,
    ) -> Result<Operation, ProviderError> {
        self.record(format!("scaleset.update_instance {}/{}", name, instance_id))?;
        let mut state = self.state();
        let instance = find_instance(&mut state, name, instance_id)
            .ok_or_else(|| ProviderError::NotFound(format!("instance {}", instance_id)))?;
        instance.provisioning_state = ProvisioningState::Updating;
        drop(state);
        Ok(self.begin(
            "update_instance",
            instance_id.to_string(),
            Pending::InstanceUpdate(name.to_string(), instance_id.to_string()),
        ))
    }

    async fn drain_instance(&self, name: &str, instance_id: &str) -> Result<(), ProviderError> {
        self.record(format!("scaleset.drain_instance {}/{}", name, instance_id))?;
        let mut state = self.state();
        let instance = find_instance(&mut state, name, instance_id)
            .ok_or_else(|| ProviderError::NotFound(format!("instance {}", instance_id)))?;
        instance.drained = true;
        Ok(())
    }

    async fn reimage_instance(
        &self,
        name: &str,
        instance_id: &str,
    ) -> Result<Operation, ProviderError> {
        self.record(format!("scaleset.reimage_instance {}/{}", name, instance_id))?;
        let mut state = self.state();
        let instance = find_instance(&mut state, name, instance_id)
            .ok_or_else(|| ProviderError::NotFound(format!("instance {}", instance_id)))?;
        instance.provisioning_state = ProvisioningState::Updating;
        drop(state);
        Ok(self.begin(
            "reimage_instance",
            instance_id.to_string(),
            Pending::InstanceReimage(name.to_string(), instance_id.to_string()),
        ))
    }

    async fn delete(&self, name: &str) -> Result<Operation, ProviderError> {
        if !self.state().scale_sets.contains_key(name) {
            return Err(ProviderError::NotFound(format!("scale set {}", name)));
        }
        self.record(format!("scaleset.delete {}", name))?;
        Ok(self.begin(
            "delete",
            name.to_string(),
            Pending::ScaleSetDelete(name.to_string()),
        ))
    }

    async fn await_operation(&self, op: &Operation) -> Result<(), ProviderError> {
        self.settle(op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ConnectionType;

    fn descriptor(name: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            name: name.to_string(),
            provisioning_state: ProvisioningState::Succeeded,
            gateway_id: Some("gw-a".to_string()),
            peer_gateway_id: Some("gw-b".to_string()),
            connection_type: ConnectionType::Vnet2Vnet,
            connection_status: ConnectionStatus::Connected,
        }
    }

    #[tokio::test]
    async fn test_connection_settles_on_await() {
        let cloud = MemoryCloud::new();
        let id = ConnectionId::new("rg", "conn");

        let op = ConnectionClient::create_or_update(&cloud, &id, &descriptor("conn"))
            .await
            .unwrap();
        let pending = ConnectionClient::get(&cloud, &id).await.unwrap();
        assert_eq!(pending.provisioning_state, ProvisioningState::Updating);

        ConnectionClient::await_operation(&cloud, &op).await.unwrap();
        let settled = ConnectionClient::get(&cloud, &id).await.unwrap();
        assert_eq!(settled.provisioning_state, ProvisioningState::Succeeded);
        assert_eq!(settled.connection_status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_unawaited_connection_settles_after_second_read() {
        let cloud = MemoryCloud::new();
        let id = ConnectionId::new("rg", "conn");
        ConnectionClient::create_or_update(&cloud, &id, &descriptor("conn"))
            .await
            .unwrap();

        let first = ConnectionClient::get(&cloud, &id).await.unwrap();
        assert_eq!(first.provisioning_state, ProvisioningState::Updating);
        let second = ConnectionClient::get(&cloud, &id).await.unwrap();
        assert_eq!(second.provisioning_state, ProvisioningState::Succeeded);
    }

    #[tokio::test]
    async fn test_unawaited_scale_set_create_settles_after_second_read() {
        let cloud = MemoryCloud::new();
        let key = BootstrapKey::default();
        let op = ScaleSetClient::create_or_update(&cloud, "workers", 1, "1.0.0", &key)
            .await
            .unwrap();

        let first = ScaleSetClient::get(&cloud, "workers").await.unwrap();
        assert_eq!(
            first.instances[0].provisioning_state,
            ProvisioningState::Creating
        );
        let second = ScaleSetClient::get(&cloud, "workers").await.unwrap();
        assert_eq!(
            second.instances[0].provisioning_state,
            ProvisioningState::Succeeded
        );

        // A late await of an operation settled in the background succeeds.
        tokio_test::assert_ok!(ScaleSetClient::await_operation(&cloud, &op).await);
    }

    #[tokio::test]
    async fn test_read_of_other_resource_leaves_operation_pending() {
        let cloud = MemoryCloud::new();
        let key = BootstrapKey::default();
        ScaleSetClient::create_or_update(&cloud, "workers", 1, "1.0.0", &key)
            .await
            .unwrap();

        for _ in 0..3 {
            tokio_test::assert_err!(ScaleSetClient::get(&cloud, "masters").await);
        }
        let set = ScaleSetClient::get(&cloud, "workers").await.unwrap();
        assert_eq!(set.instances[0].provisioning_state, ProvisioningState::Creating);
    }

    #[tokio::test]
    async fn test_create_or_update_stores_bootstrap_key() {
        let cloud = MemoryCloud::new();
        let key = BootstrapKey {
            encryption_key: "aa".repeat(32),
            initial_vector: "bb".repeat(16),
        };
        let op = ScaleSetClient::create_or_update(&cloud, "workers", 0, "1.0.0", &key)
            .await
            .unwrap();
        ScaleSetClient::await_operation(&cloud, &op).await.unwrap();
        assert_eq!(cloud.scale_set("workers").unwrap().bootstrap_key, key);
    }

    #[tokio::test]
    async fn test_delete_missing_connection_is_not_found() {
        let cloud = MemoryCloud::new();
        let err = tokio_test::assert_err!(
            ConnectionClient::delete(&cloud, &ConnectionId::new("rg", "missing")).await
        );
        assert!(err.is_not_found());
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let cloud = MemoryCloud::new();
        cloud.fail_next(ProviderError::Request("boom".into()));
        tokio_test::assert_err!(cloud.ensure_container("c").await);
        tokio_test::assert_ok!(cloud.ensure_container("c").await);
        assert_eq!(cloud.calls(), vec!["blob.ensure_container c".to_string()]);
    }

    #[tokio::test]
    async fn test_scale_set_model_change_marks_instances_stale() {
        let cloud = MemoryCloud::new();
        let key = BootstrapKey::default();
        let op = ScaleSetClient::create_or_update(&cloud, "workers", 2, "1.0.0", &key)
            .await
            .unwrap();
        ScaleSetClient::await_operation(&cloud, &op).await.unwrap();

        let op = ScaleSetClient::create_or_update(&cloud, "workers", 2, "2.0.0", &key)
            .await
            .unwrap();
        ScaleSetClient::await_operation(&cloud, &op).await.unwrap();

        let set = cloud.scale_set("workers").unwrap();
        assert_eq!(set.instances.len(), 2);
        assert!(set.instances.iter().all(|i| !i.latest_model_applied));
        assert!(set.instances.iter().all(|i| i.version == "1.0.0"));
    }

    #[tokio::test]
    async fn test_reimage_adopts_model_version() {
        let cloud = MemoryCloud::new();
        let key = BootstrapKey::default();
        let op = ScaleSetClient::create_or_update(&cloud, "workers", 1, "1.0.0", &key)
            .await
            .unwrap();
        ScaleSetClient::await_operation(&cloud, &op).await.unwrap();
        let op = ScaleSetClient::create_or_update(&cloud, "workers", 1, "2.0.0", &key)
            .await
            .unwrap();
        ScaleSetClient::await_operation(&cloud, &op).await.unwrap();

        let id = cloud.scale_set("workers").unwrap().instances[0].id.clone();
        cloud.drain_instance("workers", &id).await.unwrap();
        let op = cloud.reimage_instance("workers", &id).await.unwrap();
        ScaleSetClient::await_operation(&cloud, &op).await.unwrap();

        let instance = &cloud.scale_set("workers").unwrap().instances[0];
        assert_eq!(instance.version, "2.0.0");
        assert!(!instance.drained);
    }
}
