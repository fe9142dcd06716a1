//! Compute scale set client.

use std::fmt;

use async_trait::async_trait;

use super::{Operation, ProvisioningState};
use crate::encrypter::{EncryptionKeyMaterial, Encrypter};
use crate::error::{EncrypterError, ProviderError};

/// Hex key and IV that decrypt a fleet's bootstrap document.
///
/// Delivered to instances through the scale set model, never through the
/// storage container holding the ciphertext.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BootstrapKey {
    pub encryption_key: String,
    pub initial_vector: String,
}

impl BootstrapKey {
    pub fn from_encrypter(encrypter: &Encrypter) -> Self {
        Self {
            encryption_key: encrypter.encryption_key(),
            initial_vector: encrypter.initial_vector(),
        }
    }

    pub fn key_material(&self) -> Result<EncryptionKeyMaterial, EncrypterError> {
        EncryptionKeyMaterial::from_hex(&self.encryption_key, &self.initial_vector)
    }
}

impl fmt::Debug for BootstrapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapKey")
            .field("encryption_key", &"<redacted>")
            .field("initial_vector", &"<redacted>")
            .finish()
    }
}

/// Instance of a scale set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleSetInstance {
    pub id: String,
    /// Whether the instance runs the scale set's current model.
    pub latest_model_applied: bool,
    pub provisioning_state: ProvisioningState,
    /// Release version tag of the image the instance booted.
    pub version: String,
    /// Workloads have been evicted from the node on this instance.
    pub drained: bool,
}

/// Scale set with its instance snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleSet {
    pub name: String,
    pub capacity: i64,
    /// Release version of the scale set model.
    pub model_version: String,
    /// Key material handed to instances of the model.
    pub bootstrap_key: BootstrapKey,
    pub instances: Vec<ScaleSetInstance>,
}

/// Scale set API of one resource group.
#[async_trait]
pub trait ScaleSetClient: Send + Sync {
    async fn get(&self, name: &str) -> Result<ScaleSet, ProviderError>;

    /// Create the scale set or change its capacity, model version and
    /// bootstrap key.
    async fn create_or_update(
        &self,
        name: &str,
        capacity: i64,
        model_version: &str,
        bootstrap_key: &BootstrapKey,
    ) -> Result<Operation, ProviderError>;

    /// Roll the scale set model out to one instance.
    async fn update_instance(&self, name: &str, instance_id: &str)
        -> Result<Operation, ProviderError>;

    /// Evict workloads from the node on one instance.
    async fn drain_instance(&self, name: &str, instance_id: &str) -> Result<(), ProviderError>;

    /// Reinstall one instance from the scale set model.
    async fn reimage_instance(
        &self,
        name: &str,
        instance_id: &str,
    ) -> Result<Operation, ProviderError>;

    async fn delete(&self, name: &str) -> Result<Operation, ProviderError>;

    /// Block until the operation has completed.
    async fn await_operation(&self, op: &Operation) -> Result<(), ProviderError>;
}
