//! VPN reconciler - the gateway connection pair between host and cluster network.
//!
//! The tunnel has two sides, each a connection resource in its own
//! subscription that the provider provisions asynchronously. A pass never
//! waits for a side that is still provisioning: it defers and lets the next
//! pass look again.
//!
//! Whenever either side has drifted, both sides are written so their
//! descriptors stay mutually consistent.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::{Patch, Resource, Step};
use crate::audit::AuditLogger;
use crate::clients::{
    ConnectionClient, ConnectionDescriptor, ConnectionId, ConnectionStatus, ConnectionType,
    GatewayClient, ProvisioningState,
};
use crate::cluster::{ClusterSpec, VpnEndpoint};
use crate::error::{Error, ProviderError, Result};
use crate::gatekeeper::Gatekeeper;

/// Observed or desired connections of both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VpnConnectionPair {
    pub host: Option<ConnectionDescriptor>,
    pub guest: Option<ConnectionDescriptor>,
}

impl VpnConnectionPair {
    /// Neither side has been observed.
    pub fn is_empty(&self) -> bool {
        self.host.is_none() && self.guest.is_none()
    }
}

/// Per-side verdict of one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    NotFound,
    /// Provisioning has not settled.
    InProgress(ProvisioningState),
    Observed(ConnectionDescriptor),
}

/// Provider clients of one side of the tunnel.
#[derive(Clone)]
pub struct VpnSide {
    pub connections: Arc<dyn ConnectionClient>,
    pub gateways: Arc<dyn GatewayClient>,
}

impl VpnSide {
    pub fn new(connections: Arc<dyn ConnectionClient>, gateways: Arc<dyn GatewayClient>) -> Self {
        Self {
            connections,
            gateways,
        }
    }
}

/// Whether `current` has to be rewritten to match `desired`.
///
/// Returns false when the desired descriptor lacks its name or either
/// gateway reference, since there is not enough information to justify a
/// change.
pub fn needs_update(
    current: Option<&ConnectionDescriptor>,
    desired: Option<&ConnectionDescriptor>,
) -> bool {
    let Some(desired) = desired else {
        return false;
    };
    if desired.name.is_empty() || desired.gateway_id.is_none() || desired.peer_gateway_id.is_none()
    {
        return false;
    }
    let Some(current) = current else {
        return true;
    };

    current.name != desired.name
        || current.gateway_id != desired.gateway_id
        || current.peer_gateway_id != desired.peer_gateway_id
        || current.connection_type != desired.connection_type
        || current.connection_status == ConnectionStatus::NotConnected
}

/// VPN connection reconciler.
pub struct VpnReconciler {
    host: VpnSide,
    guest: VpnSide,
    gate: Gatekeeper,
    audit: AuditLogger,
}

impl VpnReconciler {
    pub fn new(host: VpnSide, guest: VpnSide, gate: Gatekeeper) -> Self {
        Self {
            host,
            guest,
            gate,
            audit: AuditLogger::new("vpn"),
        }
    }

    async fn observe(side: &VpnSide, id: &ConnectionId) -> Result<Observation> {
        match side.connections.get(id).await {
            Ok(conn) if !conn.provisioning_state.is_final() => {
                Ok(Observation::InProgress(conn.provisioning_state))
            }
            Ok(conn) => Ok(Observation::Observed(conn)),
            Err(e) if e.is_not_found() => Ok(Observation::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// ID of a gateway in a final state, `None` if it does not exist yet.
    async fn gateway_id(side: &VpnSide, endpoint: &VpnEndpoint) -> Result<Step<Option<String>>> {
        match side
            .gateways
            .get_gateway(&endpoint.resource_group, &endpoint.gateway_name)
            .await
        {
            Ok(gw) if !gw.provisioning_state.is_final() => Ok(Step::Defer(format!(
                "gateway {} is {}",
                endpoint.gateway_name, gw.provisioning_state
            ))),
            Ok(gw) => Ok(Step::Continue(Some(gw.id))),
            Err(e) if e.is_not_found() => {
                debug!("Gateway {} not found", endpoint.gateway_name);
                Ok(Step::Continue(None))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn check_throttle(&self, err: ProviderError) -> Error {
        if let ProviderError::Throttled { retry_after } = &err {
            let delay = chrono::Duration::from_std(*retry_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            let not_before = Utc::now() + delay;
            warn!(retry_after = %not_before, "Connection API throttled");
            self.gate.not_before(not_before);
        }
        Error::Provider(err)
    }

    async fn upsert(
        &self,
        cluster_id: &str,
        side: &VpnSide,
        endpoint: &VpnEndpoint,
        conn: &ConnectionDescriptor,
    ) -> Result<()> {
        let id = ConnectionId::new(&endpoint.resource_group, &conn.name);
        info!("Writing connection {}", id);
        self.audit
            .change(cluster_id, &id.to_string(), "connection create_or_update");
        let op = side
            .connections
            .create_or_update(&id, conn)
            .await
            .map_err(|e| self.check_throttle(e))?;
        side.connections
            .await_operation(&op)
            .await
            .map_err(|e| self.check_throttle(e))?;
        Ok(())
    }

    async fn remove(
        &self,
        cluster_id: &str,
        side: &VpnSide,
        endpoint: &VpnEndpoint,
        conn: &ConnectionDescriptor,
    ) -> Result<()> {
        let id = ConnectionId::new(&endpoint.resource_group, &conn.name);
        info!("Deleting connection {}", id);
        self.audit
            .change(cluster_id, &id.to_string(), "connection delete");
        match side.connections.delete(&id).await {
            Ok(op) => match side.connections.await_operation(&op).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(self.check_throttle(e)),
            },
            Err(e) if e.is_not_found() => {
                debug!("Connection {} already gone", id);
                Ok(())
            }
            Err(e) => Err(self.check_throttle(e)),
        }
    }

    /// Write both sides of `pair`, each awaited to completion.
    async fn write_pair(
        &self,
        cluster: &ClusterSpec,
        pair: &VpnConnectionPair,
    ) -> Result<Step<()>> {
        let Some(vpn) = &cluster.vpn else {
            return Ok(Step::Continue(()));
        };
        if !self.gate.can_proceed() {
            return Ok(Step::Defer("connection API throttled".into()));
        }
        if let Some(conn) = &pair.host {
            self.upsert(&cluster.id, &self.host, &vpn.host, conn).await?;
        }
        if let Some(conn) = &pair.guest {
            self.upsert(&cluster.id, &self.guest, &vpn.guest, conn).await?;
        }
        Ok(Step::Continue(()))
    }
}

#[async_trait]
impl Resource for VpnReconciler {
    type Object = ClusterSpec;
    type State = VpnConnectionPair;
    type Change = VpnConnectionPair;

    fn name(&self) -> &'static str {
        "vpn"
    }

    async fn current_state(&self, cluster: &ClusterSpec) -> Result<Step<VpnConnectionPair>> {
        let Some(vpn) = &cluster.vpn else {
            return Ok(Step::Continue(VpnConnectionPair::default()));
        };

        let host_id = ConnectionId::new(&vpn.host.resource_group, &vpn.connection_name);
        let host = match Self::observe(&self.host, &host_id).await? {
            Observation::NotFound => {
                debug!("Host connection {} not found", host_id);
                return Ok(Step::Continue(VpnConnectionPair::default()));
            }
            Observation::InProgress(state) => {
                return Ok(Step::Defer(format!(
                    "host connection {} is {}",
                    host_id, state
                )));
            }
            Observation::Observed(conn) => conn,
        };

        let guest_id = ConnectionId::new(&vpn.guest.resource_group, &vpn.connection_name);
        let guest = match Self::observe(&self.guest, &guest_id).await? {
            Observation::NotFound => {
                debug!("Guest connection {} not found", guest_id);
                None
            }
            Observation::InProgress(state) => {
                return Ok(Step::Defer(format!(
                    "guest connection {} is {}",
                    guest_id, state
                )));
            }
            Observation::Observed(conn) => Some(conn),
        };

        Ok(Step::Continue(VpnConnectionPair {
            host: Some(host),
            guest,
        }))
    }

    async fn desired_state(&self, cluster: &ClusterSpec) -> Result<Step<VpnConnectionPair>> {
        let Some(vpn) = &cluster.vpn else {
            return Ok(Step::Continue(VpnConnectionPair::default()));
        };

        let host_gateway = match Self::gateway_id(&self.host, &vpn.host).await? {
            Step::Continue(id) => id,
            Step::Defer(reason) => return Ok(Step::Defer(reason)),
        };
        let guest_gateway = match Self::gateway_id(&self.guest, &vpn.guest).await? {
            Step::Continue(id) => id,
            Step::Defer(reason) => return Ok(Step::Defer(reason)),
        };

        let descriptor = |gateway: &Option<String>, peer: &Option<String>| ConnectionDescriptor {
            name: vpn.connection_name.clone(),
            provisioning_state: ProvisioningState::Succeeded,
            gateway_id: gateway.clone(),
            peer_gateway_id: peer.clone(),
            connection_type: ConnectionType::Vnet2Vnet,
            connection_status: ConnectionStatus::Connected,
        };

        Ok(Step::Continue(VpnConnectionPair {
            host: Some(descriptor(&host_gateway, &guest_gateway)),
            guest: Some(descriptor(&guest_gateway, &host_gateway)),
        }))
    }

    fn new_update_patch(
        &self,
        _cluster: &ClusterSpec,
        current: &VpnConnectionPair,
        desired: &VpnConnectionPair,
    ) -> Result<Patch<VpnConnectionPair>> {
        let host = needs_update(current.host.as_ref(), desired.host.as_ref());
        let guest = needs_update(current.guest.as_ref(), desired.guest.as_ref());
        if !host && !guest {
            return Ok(Patch::new());
        }
        if current.is_empty() {
            return Ok(Patch::new().with_create(desired.clone()));
        }
        Ok(Patch::new().with_update(desired.clone()))
    }

    fn new_delete_patch(
        &self,
        _cluster: &ClusterSpec,
        current: &VpnConnectionPair,
        desired: &VpnConnectionPair,
    ) -> Result<Patch<VpnConnectionPair>> {
        // Desired names are the deletion target, current may be partial.
        if current.is_empty() || desired.is_empty() {
            return Ok(Patch::new());
        }
        Ok(Patch::new().with_delete(desired.clone()))
    }

    async fn apply_create_change(
        &self,
        cluster: &ClusterSpec,
        change: &VpnConnectionPair,
    ) -> Result<Step<()>> {
        self.write_pair(cluster, change).await
    }

    async fn apply_update_change(
        &self,
        cluster: &ClusterSpec,
        change: &VpnConnectionPair,
    ) -> Result<Step<()>> {
        self.write_pair(cluster, change).await
    }

    async fn apply_delete_change(
        &self,
        cluster: &ClusterSpec,
        change: &VpnConnectionPair,
    ) -> Result<Step<()>> {
        let Some(vpn) = &cluster.vpn else {
            return Ok(Step::Continue(()));
        };
        if !self.gate.can_proceed() {
            return Ok(Step::Defer("connection API throttled".into()));
        }
        if let Some(conn) = &change.host {
            self.remove(&cluster.id, &self.host, &vpn.host, conn).await?;
        }
        if let Some(conn) = &change.guest {
            self.remove(&cluster.id, &self.guest, &vpn.guest, conn).await?;
        }
        Ok(Step::Continue(()))
    }
}
