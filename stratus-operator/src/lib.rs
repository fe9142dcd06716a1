pub mod audit;
pub mod bootstrap;
pub mod clients;
pub mod cluster;
pub mod encrypter;
pub mod error;
pub mod gatekeeper;
pub mod operator;
pub mod reconciler;
pub mod scale;
pub mod workingset;

pub use audit::AuditLogger;
pub use bootstrap::{generate_key_material, KeyRing, NodeConfig};
pub use cluster::ClusterSpec;
pub use encrypter::{EncryptionKeyMaterial, Encrypter};
pub use error::{EncrypterError, Error, ProviderError, Result};
pub use gatekeeper::Gatekeeper;
pub use operator::{Handler, Operator, PassReport};
pub use reconciler::{ReconcileOutcome, Resource};
pub use scale::{Incremental, ScaleStrategy};
pub use workingset::WorkingSet;
