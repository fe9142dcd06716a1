//! Reconcilers for the managed resource kinds.
//!
//! Each reconciler compares the observed state of its resource (from the
//! provider) with the desired state (from the cluster spec) and produces a
//! [`Patch`]. The patch is applied create → update → delete. Nothing is
//! remembered between passes: a pass interrupted half-way simply recomputes
//! its patch from fresh provider state next time.

pub mod blob;
pub mod fleet;
pub mod vpn;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::Result;

/// Changes needed to converge one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch<T> {
    pub create: Option<T>,
    pub update: Option<T>,
    pub delete: Option<T>,
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Self {
            create: None,
            update: None,
            delete: None,
        }
    }
}

impl<T> Patch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_create(mut self, change: T) -> Self {
        self.create = Some(change);
        self
    }

    pub fn with_update(mut self, change: T) -> Self {
        self.update = Some(change);
        self
    }

    pub fn with_delete(mut self, change: T) -> Self {
        self.delete = Some(change);
        self
    }

    /// Empty patch: state already converged.
    pub fn is_empty(&self) -> bool {
        self.create.is_none() && self.update.is_none() && self.delete.is_none()
    }
}

/// Result of one step that may voluntarily stop the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    Continue(T),
    /// Stop the pass without side effects and retry on the next one.
    Defer(String),
}

/// Result of one reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Observed already matched desired, no provider call issued.
    Converged,
    /// Changes were applied.
    Changed,
    /// The pass stopped early and wants to be retried.
    Deferred(String),
}

/// One managed resource kind.
///
/// The cluster spec is passed to every hook as `obj`. Hooks return provider
/// errors unchanged; the caller decides when to retry.
#[async_trait]
pub trait Resource: Send + Sync {
    /// The object being reconciled.
    type Object: Send + Sync;
    /// Observed and desired state share one comparable type.
    type State: Clone + PartialEq + Send + Sync + std::fmt::Debug;
    /// Payload of a patch field.
    type Change: Send + Sync + std::fmt::Debug;

    fn name(&self) -> &'static str;

    async fn current_state(&self, obj: &Self::Object) -> Result<Step<Self::State>>;

    async fn desired_state(&self, obj: &Self::Object) -> Result<Step<Self::State>>;

    /// Changes that converge `current` toward `desired`. Must be pure.
    fn new_update_patch(
        &self,
        obj: &Self::Object,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::Change>>;

    /// Changes that remove the resource.
    fn new_delete_patch(
        &self,
        obj: &Self::Object,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::Change>>;

    async fn apply_create_change(&self, obj: &Self::Object, change: &Self::Change)
        -> Result<Step<()>>;

    async fn apply_update_change(&self, obj: &Self::Object, change: &Self::Change)
        -> Result<Step<()>>;

    async fn apply_delete_change(&self, obj: &Self::Object, change: &Self::Change)
        -> Result<Step<()>>;
}

macro_rules! step {
    ($e:expr) => {
        match $e {
            Step::Continue(v) => v,
            Step::Defer(reason) => return Ok(ReconcileOutcome::Deferred(reason)),
        }
    };
}

async fn observe<R: Resource>(
    resource: &R,
    obj: &R::Object,
) -> Result<Step<(R::State, R::State)>> {
    let current = match resource.current_state(obj).await? {
        Step::Continue(s) => s,
        Step::Defer(reason) => return Ok(Step::Defer(reason)),
    };
    let desired = match resource.desired_state(obj).await? {
        Step::Continue(s) => s,
        Step::Defer(reason) => return Ok(Step::Defer(reason)),
    };
    Ok(Step::Continue((current, desired)))
}

/// Run one converging pass of `resource`.
pub async fn reconcile<R: Resource>(resource: &R, obj: &R::Object) -> Result<ReconcileOutcome> {
    let (current, desired) = step!(observe(resource, obj).await?);
    let patch = resource.new_update_patch(obj, &current, &desired)?;
    apply_patch(resource, obj, patch).await
}

/// Run one pass removing `resource`.
pub async fn teardown<R: Resource>(resource: &R, obj: &R::Object) -> Result<ReconcileOutcome> {
    let (current, desired) = step!(observe(resource, obj).await?);
    let patch = resource.new_delete_patch(obj, &current, &desired)?;
    apply_patch(resource, obj, patch).await
}

/// Apply the non-empty fields of `patch` in create → update → delete order.
pub async fn apply_patch<R: Resource>(
    resource: &R,
    obj: &R::Object,
    patch: Patch<R::Change>,
) -> Result<ReconcileOutcome> {
    if patch.is_empty() {
        debug!(resource = resource.name(), "Already converged");
        return Ok(ReconcileOutcome::Converged);
    }

    if let Some(change) = &patch.create {
        info!(resource = resource.name(), "Applying create change");
        step!(resource.apply_create_change(obj, change).await?);
    }
    if let Some(change) = &patch.update {
        info!(resource = resource.name(), "Applying update change");
        step!(resource.apply_update_change(obj, change).await?);
    }
    if let Some(change) = &patch.delete {
        info!(resource = resource.name(), "Applying delete change");
        step!(resource.apply_delete_change(obj, change).await?);
    }

    Ok(ReconcileOutcome::Changed)
}

/// Element-wise diff of keyed collections.
///
/// Entries in `desired` that are missing or different in `observed` form the
/// update set. Entries only in `observed` form the delete set when
/// `delete_on_drift` is set; otherwise they are left alone.
pub fn diff_keyed<K, V>(
    observed: &BTreeMap<K, V>,
    desired: &BTreeMap<K, V>,
    delete_on_drift: bool,
) -> Patch<BTreeMap<K, V>>
where
    K: Ord + Clone,
    V: PartialEq + Clone,
{
    let update: BTreeMap<K, V> = desired
        .iter()
        .filter(|(k, v)| observed.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let delete: BTreeMap<K, V> = if delete_on_drift {
        observed
            .iter()
            .filter(|(k, _)| !desired.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    } else {
        BTreeMap::new()
    };

    let mut patch = Patch::new();
    if !update.is_empty() {
        patch = patch.with_update(update);
    }
    if !delete.is_empty() {
        patch = patch.with_delete(delete);
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_diff_equal_is_empty() {
        let a = map(&[("a", "1"), ("b", "2")]);
        assert!(diff_keyed(&a, &a.clone(), true).is_empty());
        assert!(diff_keyed(&BTreeMap::<String, String>::new(), &BTreeMap::new(), true).is_empty());
    }

    #[test]
    fn test_diff_missing_and_changed_are_updates() {
        let observed = map(&[("a", "1"), ("b", "old")]);
        let desired = map(&[("a", "1"), ("b", "new"), ("c", "3")]);
        let patch = diff_keyed(&observed, &desired, false);
        assert_eq!(patch.update, Some(map(&[("b", "new"), ("c", "3")])));
        assert!(patch.create.is_none());
        assert!(patch.delete.is_none());
    }

    #[test]
    fn test_diff_extra_deleted_only_on_drift() {
        let observed = map(&[("a", "1"), ("orphan", "x")]);
        let desired = map(&[("a", "1")]);

        assert!(diff_keyed(&observed, &desired, false).is_empty());

        let patch = diff_keyed(&observed, &desired, true);
        assert_eq!(patch.delete, Some(map(&[("orphan", "x")])));
        assert!(patch.update.is_none());
    }

    #[test]
    fn test_diff_is_deterministic() {
        let observed = map(&[("z", "1"), ("a", "2")]);
        let desired = map(&[("m", "3"), ("a", "9")]);
        assert_eq!(
            diff_keyed(&observed, &desired, true),
            diff_keyed(&observed, &desired, true)
        );
    }

    /// Counter resource: state is a number, changes record into a log.
    struct Counter {
        current: Mutex<i64>,
        desired: i64,
        log: Mutex<Vec<String>>,
        defer_reads: bool,
    }

    impl Counter {
        fn new(current: i64, desired: i64) -> Self {
            Self {
                current: Mutex::new(current),
                desired,
                log: Mutex::new(Vec::new()),
                defer_reads: false,
            }
        }
    }

    #[async_trait]
    impl Resource for Counter {
        type Object = ();
        type State = i64;
        type Change = i64;

        fn name(&self) -> &'static str {
            "counter"
        }

        async fn current_state(&self, _: &()) -> Result<Step<i64>> {
            if self.defer_reads {
                return Ok(Step::Defer("busy".into()));
            }
            Ok(Step::Continue(*self.current.lock().unwrap()))
        }

        async fn desired_state(&self, _: &()) -> Result<Step<i64>> {
            Ok(Step::Continue(self.desired))
        }

        fn new_update_patch(&self, _: &(), current: &i64, desired: &i64) -> Result<Patch<i64>> {
            Ok(match (*current, *desired) {
                (0, d) if d != 0 => Patch::new().with_create(d),
                (c, d) if c != d => Patch::new().with_update(d),
                _ => Patch::new(),
            })
        }

        fn new_delete_patch(&self, _: &(), current: &i64, _: &i64) -> Result<Patch<i64>> {
            Ok(if *current != 0 {
                Patch::new().with_delete(0)
            } else {
                Patch::new()
            })
        }

        async fn apply_create_change(&self, _: &(), change: &i64) -> Result<Step<()>> {
            self.log.lock().unwrap().push(format!("create {}", change));
            *self.current.lock().unwrap() = *change;
            Ok(Step::Continue(()))
        }

        async fn apply_update_change(&self, _: &(), change: &i64) -> Result<Step<()>> {
            self.log.lock().unwrap().push(format!("update {}", change));
            *self.current.lock().unwrap() = *change;
            Ok(Step::Continue(()))
        }

        async fn apply_delete_change(&self, _: &(), change: &i64) -> Result<Step<()>> {
            self.log.lock().unwrap().push(format!("delete {}", change));
            *self.current.lock().unwrap() = *change;
            Ok(Step::Continue(()))
        }
    }

    #[tokio::test]
    async fn test_reconcile_converged_issues_nothing() {
        let counter = Counter::new(4, 4);
        let outcome = reconcile(&counter, &()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Converged);
        assert!(counter.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_create_then_converged() {
        let counter = Counter::new(0, 3);
        assert_eq!(
            reconcile(&counter, &()).await.unwrap(),
            ReconcileOutcome::Changed
        );
        assert_eq!(
            reconcile(&counter, &()).await.unwrap(),
            ReconcileOutcome::Converged
        );
        assert_eq!(*counter.log.lock().unwrap(), vec!["create 3".to_string()]);
    }

    #[tokio::test]
    async fn test_teardown() {
        let counter = Counter::new(5, 5);
        assert_eq!(
            teardown(&counter, &()).await.unwrap(),
            ReconcileOutcome::Changed
        );
        assert_eq!(*counter.current.lock().unwrap(), 0);
        assert_eq!(
            teardown(&counter, &()).await.unwrap(),
            ReconcileOutcome::Converged
        );
    }

    #[tokio::test]
    async fn test_deferred_read_skips_apply() {
        let mut counter = Counter::new(1, 2);
        counter.defer_reads = true;
        let outcome = reconcile(&counter, &()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Deferred("busy".into()));
        assert!(counter.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_order_create_update_delete() {
        let counter = Counter::new(1, 1);
        let patch = Patch::new().with_delete(0).with_update(7).with_create(9);
        apply_patch(&counter, &(), patch).await.unwrap();
        assert_eq!(
            *counter.log.lock().unwrap(),
            vec![
                "create 9".to_string(),
                "update 7".to_string(),
                "delete 0".to_string()
            ]
        );
    }
}
