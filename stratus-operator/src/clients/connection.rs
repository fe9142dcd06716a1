//! VPN gateway and gateway connection clients.

use async_trait::async_trait;

use super::{Operation, ProvisioningState};
use crate::error::ProviderError;

/// Kind of tunnel a connection establishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Vnet2Vnet,
    IPsec,
    ExpressRoute,
}

/// Live status of a connection as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Unknown,
    Connecting,
    Connected,
    NotConnected,
}

/// Address of a connection within a resource group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    pub resource_group: String,
    pub name: String,
}

impl ConnectionId {
    pub fn new(resource_group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_group: resource_group.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.resource_group, self.name)
    }
}

/// One side of a gateway-to-gateway connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub name: String,
    pub provisioning_state: ProvisioningState,
    /// Gateway owning this side of the connection.
    pub gateway_id: Option<String>,
    /// Gateway on the far end.
    pub peer_gateway_id: Option<String>,
    pub connection_type: ConnectionType,
    pub connection_status: ConnectionStatus,
}

/// VPN gateway as seen by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnGateway {
    pub id: String,
    pub name: String,
    pub provisioning_state: ProvisioningState,
}

/// Gateway connection API of one subscription.
#[async_trait]
pub trait ConnectionClient: Send + Sync {
    async fn get(&self, id: &ConnectionId) -> Result<ConnectionDescriptor, ProviderError>;

    async fn create_or_update(
        &self,
        id: &ConnectionId,
        connection: &ConnectionDescriptor,
    ) -> Result<Operation, ProviderError>;

    async fn delete(&self, id: &ConnectionId) -> Result<Operation, ProviderError>;

    /// Block until the operation has completed.
    async fn await_operation(&self, op: &Operation) -> Result<(), ProviderError>;
}

/// VPN gateway API of one subscription.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn get_gateway(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<VpnGateway, ProviderError>;
}
