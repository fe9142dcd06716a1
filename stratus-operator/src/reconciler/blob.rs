//! Blob reconciler - keeps node bootstrap configuration in the storage container.
//!
//! Blobs present in the container but absent from the desired set are left
//! alone; they belong to older releases and are removed on teardown only.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{diff_keyed, Patch, Resource, Step};
use crate::bootstrap::{render_node_config, KeyRing};
use crate::clients::BlobClient;
use crate::cluster::ClusterSpec;
use crate::error::Result;

type Blobs = BTreeMap<String, String>;

/// Blob reconciler backed by a storage account.
pub struct BlobReconciler {
    client: Arc<dyn BlobClient>,
    keys: KeyRing,
}

impl BlobReconciler {
    pub fn new(client: Arc<dyn BlobClient>, keys: KeyRing) -> Self {
        Self { client, keys }
    }

    async fn put_all(&self, container: &str, blobs: &Blobs) -> Result<()> {
        for (key, body) in blobs {
            debug!("Uploading blob {}/{}", container, key);
            self.client.put(container, key, body).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Resource for BlobReconciler {
    type Object = ClusterSpec;
    type State = Blobs;
    type Change = Blobs;

    fn name(&self) -> &'static str {
        "blob"
    }

    async fn current_state(&self, cluster: &ClusterSpec) -> Result<Step<Blobs>> {
        match self.client.list(&cluster.storage_container).await {
            Ok(blobs) => Ok(Step::Continue(blobs)),
            Err(e) if e.is_not_found() => {
                debug!("Container {} not found", cluster.storage_container);
                Ok(Step::Continue(Blobs::new()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn desired_state(&self, cluster: &ClusterSpec) -> Result<Step<Blobs>> {
        let encrypter = self.keys.encrypter(&cluster.id);
        let mut blobs = Blobs::new();
        for fleet in &cluster.fleets {
            let body = render_node_config(cluster, fleet, &encrypter)?;
            blobs.insert(cluster.bootstrap_blob_key(&fleet.name), body);
        }
        Ok(Step::Continue(blobs))
    }

    fn new_update_patch(
        &self,
        _cluster: &ClusterSpec,
        current: &Blobs,
        desired: &Blobs,
    ) -> Result<Patch<Blobs>> {
        if current.is_empty() && !desired.is_empty() {
            return Ok(Patch::new().with_create(desired.clone()));
        }
        Ok(diff_keyed(current, desired, false))
    }

    fn new_delete_patch(
        &self,
        _cluster: &ClusterSpec,
        current: &Blobs,
        desired: &Blobs,
    ) -> Result<Patch<Blobs>> {
        let existing: Blobs = desired
            .keys()
            .filter_map(|k| current.get_key_value(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if existing.is_empty() {
            return Ok(Patch::new());
        }
        Ok(Patch::new().with_delete(existing))
    }

    async fn apply_create_change(
        &self,
        cluster: &ClusterSpec,
        change: &Blobs,
    ) -> Result<Step<()>> {
        info!(
            "Creating container {} with {} blobs",
            cluster.storage_container,
            change.len()
        );
        self.client
            .ensure_container(&cluster.storage_container)
            .await?;
        self.put_all(&cluster.storage_container, change).await?;
        Ok(Step::Continue(()))
    }

    async fn apply_update_change(
        &self,
        cluster: &ClusterSpec,
        change: &Blobs,
    ) -> Result<Step<()>> {
        info!(
            "Updating {} blobs in container {}",
            change.len(),
            cluster.storage_container
        );
        self.put_all(&cluster.storage_container, change).await?;
        Ok(Step::Continue(()))
    }

    async fn apply_delete_change(
        &self,
        cluster: &ClusterSpec,
        change: &Blobs,
    ) -> Result<Step<()>> {
        for key in change.keys() {
            info!("Deleting blob {}/{}", cluster.storage_container, key);
            match self.client.delete(&cluster.storage_container, key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!("Blob {} already gone", key),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Step::Continue(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MemoryCloud;
    use crate::error::ProviderError;
    use crate::reconciler::{reconcile, teardown, ReconcileOutcome};

    fn cluster(version: &str) -> ClusterSpec {
        ClusterSpec::from_json(&format!(
            r#"{{"id": "c1", "version": "{}",
                "fleets": [{{"name": "masters", "replicas": 1}},
                           {{"name": "workers", "replicas": 2}}],
                "tls_files": {{"/etc/ssl/ca.pem": "CA"}}}}"#,
            version
        ))
        .unwrap()
    }

    fn reconciler(cloud: &MemoryCloud) -> BlobReconciler {
        BlobReconciler::new(Arc::new(cloud.clone()), KeyRing::new())
    }

    #[tokio::test]
    async fn test_stored_blobs_carry_no_key_material() {
        let cloud = MemoryCloud::new();
        let keys = KeyRing::new();
        let r = BlobReconciler::new(Arc::new(cloud.clone()), keys.clone());
        let cluster = cluster("1.0.0");
        reconcile(&r, &cluster).await.unwrap();

        let encrypter = keys.encrypter("c1");
        let blobs = cloud.blobs("ignition").unwrap();
        assert_eq!(blobs.len(), 2);
        for body in blobs.values() {
            assert!(!body.contains(&encrypter.encryption_key()));
            assert!(!body.contains(&encrypter.initial_vector()));
            assert!(!body.contains("\"CA\""));
        }
    }

    #[tokio::test]
    async fn test_creates_container_then_converges() {
        let cloud = MemoryCloud::new();
        let r = reconciler(&cloud);
        let cluster = cluster("1.0.0");

        assert_eq!(
            reconcile(&r, &cluster).await.unwrap(),
            ReconcileOutcome::Changed
        );
        let blobs = cloud.blobs("ignition").unwrap();
        assert_eq!(
            blobs.keys().cloned().collect::<Vec<_>>(),
            vec!["1.0.0/masters.json", "1.0.0/workers.json"]
        );

        cloud.clear_calls();
        assert_eq!(
            reconcile(&r, &cluster).await.unwrap(),
            ReconcileOutcome::Converged
        );
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_upgrade_leaves_old_release_blobs() {
        let cloud = MemoryCloud::new();
        let r = reconciler(&cloud);
        reconcile(&r, &cluster("1.0.0")).await.unwrap();
        reconcile(&r, &cluster("2.0.0")).await.unwrap();

        let blobs = cloud.blobs("ignition").unwrap();
        assert_eq!(blobs.len(), 4);
        assert!(blobs.contains_key("1.0.0/workers.json"));
    }

    #[tokio::test]
    async fn test_interrupted_create_resumes_with_update() {
        let cloud = MemoryCloud::new();
        let r = reconciler(&cloud);
        let cluster = cluster("1.0.0");

        // Container gets created, first upload fails.
        cloud.ensure_container("ignition").await.unwrap();
        cloud
            .put("ignition", "1.0.0/masters.json", "stale")
            .await
            .unwrap();

        let current = match r.current_state(&cluster).await.unwrap() {
            Step::Continue(s) => s,
            Step::Defer(_) => panic!("unexpected defer"),
        };
        let desired = match r.desired_state(&cluster).await.unwrap() {
            Step::Continue(s) => s,
            Step::Defer(_) => panic!("unexpected defer"),
        };
        let patch = r.new_update_patch(&cluster, &current, &desired).unwrap();
        assert!(patch.create.is_none());
        assert_eq!(patch.update.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_provider_error_propagates() {
        let cloud = MemoryCloud::new();
        let r = reconciler(&cloud);
        cloud.fail_next(ProviderError::Request("storage unavailable".into()));
        let err = reconcile(&r, &cluster("1.0.0")).await.unwrap_err();
        assert_eq!(
            err.provider(),
            Some(&ProviderError::Request("storage unavailable".into()))
        );
    }

    #[tokio::test]
    async fn test_teardown_removes_desired_blobs_only() {
        let cloud = MemoryCloud::new();
        let r = reconciler(&cloud);
        reconcile(&r, &cluster("1.0.0")).await.unwrap();
        cloud.put("ignition", "unrelated.txt", "keep").await.unwrap();

        assert_eq!(
            teardown(&r, &cluster("1.0.0")).await.unwrap(),
            ReconcileOutcome::Changed
        );
        let blobs = cloud.blobs("ignition").unwrap();
        assert_eq!(blobs.keys().collect::<Vec<_>>(), vec!["unrelated.txt"]);

        assert_eq!(
            teardown(&r, &cluster("1.0.0")).await.unwrap(),
            ReconcileOutcome::Converged
        );
    }
}
