//! Provider clients.
//!
//! Every managed resource kind talks to the cloud through one of these
//! traits. Implementations issue idempotent calls and hand back
//! long-running operation handles that the caller awaits within the pass.
//!
//! - connection: VPN gateway connections and gateways
//! - blob: storage containers holding node bootstrap configuration
//! - scaleset: compute fleets and their instances
//! - memory: in-process backend implementing all of the above

pub mod blob;
pub mod connection;
pub mod memory;
pub mod scaleset;

use std::fmt;

use uuid::Uuid;

pub use blob::BlobClient;
pub use connection::{
    ConnectionClient, ConnectionDescriptor, ConnectionId, ConnectionStatus, ConnectionType,
    GatewayClient, VpnGateway,
};
pub use memory::MemoryCloud;
pub use scaleset::{BootstrapKey, ScaleSet, ScaleSetClient, ScaleSetInstance};

/// Provider-reported state of an async create/update/delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Creating,
    Updating,
    Deleting,
    Succeeded,
    Failed,
    Canceled,
}

impl ProvisioningState {
    /// Whether the provider has settled this resource.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ProvisioningState::Succeeded | ProvisioningState::Failed | ProvisioningState::Canceled
        )
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisioningState::Creating => "Creating",
            ProvisioningState::Updating => "Updating",
            ProvisioningState::Deleting => "Deleting",
            ProvisioningState::Succeeded => "Succeeded",
            ProvisioningState::Failed => "Failed",
            ProvisioningState::Canceled => "Canceled",
        };
        f.write_str(s)
    }
}

/// Handle to a long-running provider operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: String,
    /// What the operation does, e.g. "create_or_update".
    pub kind: String,
    /// Resource the operation acts on.
    pub target: String,
}

impl Operation {
    pub fn new(kind: &str, target: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            target: target.into(),
        }
    }
}
