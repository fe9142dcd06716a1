//! Cluster specification - the declared state the operator converges to.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_container() -> String {
    "ignition".to_string()
}

fn default_vm_size() -> String {
    "Standard_D4s_v3".to_string()
}

/// Declared state of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub id: String,
    /// Release version every instance should run.
    pub version: String,
    /// Storage container holding node bootstrap configuration.
    #[serde(default = "default_container")]
    pub storage_container: String,
    #[serde(default)]
    pub fleets: Vec<FleetSpec>,
    #[serde(default)]
    pub vpn: Option<VpnSpec>,
    /// TLS material embedded (encrypted) in node configuration, keyed by path on the node.
    #[serde(default)]
    pub tls_files: BTreeMap<String, String>,
}

/// One compute fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSpec {
    pub name: String,
    pub replicas: i64,
    #[serde(default = "default_vm_size")]
    pub vm_size: String,
}

/// Site-to-site tunnel between the host network and the cluster network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnSpec {
    pub connection_name: String,
    pub host: VpnEndpoint,
    pub guest: VpnEndpoint,
}

/// Gateway side of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnEndpoint {
    pub resource_group: String,
    pub gateway_name: String,
}

impl ClusterSpec {
    /// Load and validate a spec from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let spec: ClusterSpec = serde_json::from_str(data)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::Config("cluster id must not be empty".into()));
        }
        if self.version.is_empty() {
            return Err(Error::Config("cluster version must not be empty".into()));
        }
        if self.storage_container.is_empty() {
            return Err(Error::Config("storage container must not be empty".into()));
        }

        let mut names = HashSet::new();
        for fleet in &self.fleets {
            if fleet.name.is_empty() {
                return Err(Error::Config("fleet name must not be empty".into()));
            }
            if fleet.replicas < 0 {
                return Err(Error::Config(format!(
                    "fleet {} has negative replica count {}",
                    fleet.name, fleet.replicas
                )));
            }
            if !names.insert(fleet.name.as_str()) {
                return Err(Error::Config(format!("duplicate fleet name {}", fleet.name)));
            }
        }

        if let Some(vpn) = &self.vpn {
            let fields = [
                ("vpn.connection_name", &vpn.connection_name),
                ("vpn.host.resource_group", &vpn.host.resource_group),
                ("vpn.host.gateway_name", &vpn.host.gateway_name),
                ("vpn.guest.resource_group", &vpn.guest.resource_group),
                ("vpn.guest.gateway_name", &vpn.guest.gateway_name),
            ];
            if let Some((field, _)) = fields.iter().find(|(_, v)| v.is_empty()) {
                return Err(Error::Config(format!("{} must not be empty", field)));
            }
        }

        Ok(())
    }

    /// Name of the scale set backing a fleet.
    pub fn scale_set_name(&self, fleet: &str) -> String {
        format!("{}-{}", self.id, fleet)
    }

    /// Blob key of a fleet's bootstrap configuration.
    pub fn bootstrap_blob_key(&self, fleet: &str) -> String {
        format!("{}/{}.json", self.version, fleet)
    }
}
