//! Node bootstrap configuration.
//!
//! Each fleet gets one JSON document that its instances fetch on first boot.
//! TLS material in the document is encrypted with the cluster's key. The key
//! and IV are not part of the document; nodes receive them through the scale
//! set model and decrypt locally.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cluster::{ClusterSpec, FleetSpec};
use crate::encrypter::{EncryptionKeyMaterial, Encrypter, IV_LEN, KEY_LEN};
use crate::error::{EncrypterError, Result};

/// Bootstrap document fetched by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub cluster_id: String,
    pub fleet: String,
    pub version: String,
    pub vm_size: String,
    /// Encrypted file contents (hex) keyed by path on the node.
    pub files: BTreeMap<String, String>,
}

impl NodeConfig {
    /// Decrypt every file with the cluster's key material.
    pub fn decrypt_files(
        &self,
        material: &EncryptionKeyMaterial,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let encrypter = Encrypter::new(material.clone());
        self.files
            .iter()
            .map(|(path, content)| -> Result<(String, Vec<u8>)> {
                let ciphertext = hex::decode(content).map_err(EncrypterError::from)?;
                Ok((path.clone(), encrypter.decrypt(&ciphertext)))
            })
            .collect()
    }
}

/// Fresh random key material. Called once per cluster.
pub fn generate_key_material() -> EncryptionKeyMaterial {
    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut key);
    rng.fill_bytes(&mut iv);
    EncryptionKeyMaterial { key, iv }
}

/// Key material per cluster, held in memory only.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: Arc<Mutex<HashMap<String, EncryptionKeyMaterial>>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encrypter for a cluster, generating key material on first use.
    pub fn encrypter(&self, cluster_id: &str) -> Encrypter {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let material = keys.entry(cluster_id.to_string()).or_insert_with(|| {
            info!(cluster = cluster_id, "Generated node config encryption key");
            generate_key_material()
        });
        Encrypter::new(material.clone())
    }

    /// Use externally provided key material for a cluster.
    pub fn insert(&self, cluster_id: &str, material: EncryptionKeyMaterial) {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cluster_id.to_string(), material);
    }
}

/// Render the bootstrap document of one fleet.
pub fn render_node_config(
    cluster: &ClusterSpec,
    fleet: &FleetSpec,
    encrypter: &Encrypter,
) -> Result<String> {
    let files = cluster
        .tls_files
        .iter()
        .map(|(path, content)| (path.clone(), hex::encode(encrypter.encrypt(content.as_bytes()))))
        .collect();

    let config = NodeConfig {
        cluster_id: cluster.id.clone(),
        fleet: fleet.name.clone(),
        version: cluster.version.clone(),
        vm_size: fleet.vm_size.clone(),
        files,
    };
    Ok(serde_json::to_string_pretty(&config)?)
}
