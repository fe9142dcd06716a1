//! Test helpers for stratus-operator integration tests.

#![allow(dead_code)]

use stratus_operator::clients::{
    ConnectionId, MemoryCloud, ProvisioningState, VpnGateway,
};
use stratus_operator::{ClusterSpec, Operator};

pub const HOST_RG: &str = "host-rg";
pub const GUEST_RG: &str = "c1";
pub const CONNECTION: &str = "c1-vpn";

/// Cluster with one worker fleet and a VPN to the host network.
pub fn cluster(version: &str, replicas: i64) -> ClusterSpec {
    ClusterSpec::from_json(&format!(
        r#"{{
            "id": "c1",
            "version": "{version}",
            "fleets": [{{"name": "workers", "replicas": {replicas}}}],
            "vpn": {{
                "connection_name": "{CONNECTION}",
                "host": {{"resource_group": "{HOST_RG}", "gateway_name": "host-gw"}},
                "guest": {{"resource_group": "{GUEST_RG}", "gateway_name": "c1-gw"}}
            }},
            "tls_files": {{"/etc/kubernetes/ssl/ca.pem": "-----BEGIN CERTIFICATE-----"}}
        }}"#
    ))
    .expect("valid cluster spec")
}

/// Host and guest subscriptions with both VPN gateways provisioned.
pub struct TestCloud {
    pub host: MemoryCloud,
    pub guest: MemoryCloud,
}

impl TestCloud {
    pub fn new() -> Self {
        let host = MemoryCloud::new();
        let guest = MemoryCloud::new();
        host.insert_gateway(HOST_RG, gateway("/gw/host", "host-gw"));
        guest.insert_gateway(GUEST_RG, gateway("/gw/guest", "c1-gw"));
        Self { host, guest }
    }

    pub fn operator(&self, cluster: ClusterSpec) -> Operator {
        Operator::simulated(cluster, &self.host, &self.guest)
    }

    pub fn clear_calls(&self) {
        self.host.clear_calls();
        self.guest.clear_calls();
    }

    pub fn host_connection_id() -> ConnectionId {
        ConnectionId::new(HOST_RG, CONNECTION)
    }

    pub fn guest_connection_id() -> ConnectionId {
        ConnectionId::new(GUEST_RG, CONNECTION)
    }
}

fn gateway(id: &str, name: &str) -> VpnGateway {
    VpnGateway {
        id: id.to_string(),
        name: name.to_string(),
        provisioning_state: ProvisioningState::Succeeded,
    }
}

/// Run passes until every handler reports converged. Returns the number of
/// passes that changed something.
pub async fn converge(operator: &Operator, max_passes: usize) -> usize {
    for pass in 0..max_passes {
        let report = operator.run_once().await;
        assert_eq!(report.error_count(), 0, "pass {} failed: {:?}", pass, report);
        if report.is_converged() {
            return pass;
        }
    }
    panic!("cluster did not converge within {} passes", max_passes);
}

/// Scale set calls recorded on `cloud`.
pub fn scale_set_calls(cloud: &MemoryCloud) -> Vec<String> {
    cloud
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("scaleset."))
        .collect()
}
