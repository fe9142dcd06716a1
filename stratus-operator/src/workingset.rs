//! WorkingSet - the single in-flight instance mutation of a fleet.
//!
//! A working set is built fresh each reconcile pass from a snapshot of the
//! fleet's instances and discarded afterwards. At most one of its markers is
//! acted upon, so a rolling update touches one instance per pass.
//!
//! Absence of a working set (`None`) means the fleet is idle. The free
//! functions in this module accept `Option<&WorkingSet>` so callers never
//! need to check for absence first.

use crate::clients::ScaleSetInstance;

/// Marked instances of one fleet for the current pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingSet {
    instance_to_update: Option<ScaleSetInstance>,
    instance_to_drain: Option<ScaleSetInstance>,
    instance_to_reimage: Option<ScaleSetInstance>,
    instance_already_being_updated: Option<ScaleSetInstance>,
}

impl WorkingSet {
    /// Select the next actionable instance from a fleet snapshot.
    ///
    /// Update scheduling takes priority over drain, drain over reimage, and
    /// reimage over detecting an instance that is already mid-update. An
    /// out-of-date instance found mid-update while looking for update
    /// candidates is reported as already being updated. Returns `None` when
    /// nothing needs doing.
    pub fn from_snapshot(instances: &[ScaleSetInstance], desired_version: &str) -> Option<Self> {
        // Instances not yet on the latest scale set model.
        if let Some(instance) = instances.iter().find(|i| !i.latest_model_applied) {
            if !instance.provisioning_state.is_final() {
                return Some(with_instance_already_being_updated(None, instance.clone()));
            }
            return Some(with_instance_to_update(None, instance.clone()));
        }

        // On the latest model but still running an old release.
        if let Some(instance) = instances
            .iter()
            .find(|i| i.version != desired_version && !i.drained && i.provisioning_state.is_final())
        {
            return Some(with_instance_to_drain(None, instance.clone()));
        }

        if let Some(instance) = instances
            .iter()
            .find(|i| i.version != desired_version && i.drained && i.provisioning_state.is_final())
        {
            return Some(with_instance_to_reimage(None, instance.clone()));
        }

        instances
            .iter()
            .find(|i| !i.provisioning_state.is_final())
            .map(|i| with_instance_already_being_updated(None, i.clone()))
    }

    /// True iff any marker is set.
    pub fn is_wip(&self) -> bool {
        self.instance_to_update.is_some()
            || self.instance_to_drain.is_some()
            || self.instance_to_reimage.is_some()
            || self.instance_already_being_updated.is_some()
    }
}

/// True iff a working set is present and has a marker set.
pub fn is_wip(ws: Option<&WorkingSet>) -> bool {
    ws.is_some_and(WorkingSet::is_wip)
}

pub fn instance_to_update(ws: Option<&WorkingSet>) -> Option<&ScaleSetInstance> {
    ws.and_then(|w| w.instance_to_update.as_ref())
}

pub fn instance_to_drain(ws: Option<&WorkingSet>) -> Option<&ScaleSetInstance> {
    ws.and_then(|w| w.instance_to_drain.as_ref())
}

pub fn instance_to_reimage(ws: Option<&WorkingSet>) -> Option<&ScaleSetInstance> {
    ws.and_then(|w| w.instance_to_reimage.as_ref())
}

pub fn instance_already_being_updated(ws: Option<&WorkingSet>) -> Option<&ScaleSetInstance> {
    ws.and_then(|w| w.instance_already_being_updated.as_ref())
}

pub fn with_instance_to_update(ws: Option<WorkingSet>, instance: ScaleSetInstance) -> WorkingSet {
    WorkingSet {
        instance_to_update: Some(instance),
        ..ws.unwrap_or_default()
    }
}

pub fn with_instance_to_drain(ws: Option<WorkingSet>, instance: ScaleSetInstance) -> WorkingSet {
    WorkingSet {
        instance_to_drain: Some(instance),
        ..ws.unwrap_or_default()
    }
}

pub fn with_instance_to_reimage(ws: Option<WorkingSet>, instance: ScaleSetInstance) -> WorkingSet {
    WorkingSet {
        instance_to_reimage: Some(instance),
        ..ws.unwrap_or_default()
    }
}

pub fn with_instance_already_being_updated(
    ws: Option<WorkingSet>,
    instance: ScaleSetInstance,
) -> WorkingSet {
    WorkingSet {
        instance_already_being_updated: Some(instance),
        ..ws.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ProvisioningState;

    fn instance(id: &str, version: &str) -> ScaleSetInstance {
        ScaleSetInstance {
            id: id.to_string(),
            latest_model_applied: true,
            provisioning_state: ProvisioningState::Succeeded,
            version: version.to_string(),
            drained: false,
        }
    }

    #[test]
    fn test_absent_working_set_is_idle() {
        assert!(!is_wip(None));
        assert!(instance_to_update(None).is_none());
        assert!(instance_to_drain(None).is_none());
        assert!(instance_to_reimage(None).is_none());
        assert!(instance_already_being_updated(None).is_none());
    }

    #[test]
    fn test_empty_working_set_is_idle() {
        let ws = WorkingSet::default();
        assert!(!ws.is_wip());
        assert!(!is_wip(Some(&ws)));
    }

    #[test]
    fn test_builders_set_marker() {
        let ws = with_instance_to_drain(None, instance("vm-0", "1.0.0"));
        assert!(is_wip(Some(&ws)));
        assert_eq!(instance_to_drain(Some(&ws)).unwrap().id, "vm-0");
        assert!(instance_to_update(Some(&ws)).is_none());
    }

    #[test]
    fn test_builders_compose() {
        let ws = with_instance_to_update(None, instance("vm-0", "1.0.0"));
        let ws = with_instance_to_reimage(Some(ws), instance("vm-1", "1.0.0"));
        assert_eq!(instance_to_update(Some(&ws)).unwrap().id, "vm-0");
        assert_eq!(instance_to_reimage(Some(&ws)).unwrap().id, "vm-1");
    }

    #[test]
    fn test_converged_fleet_has_no_working_set() {
        let instances = vec![instance("vm-0", "2.0.0"), instance("vm-1", "2.0.0")];
        assert_eq!(WorkingSet::from_snapshot(&instances, "2.0.0"), None);
        assert_eq!(WorkingSet::from_snapshot(&[], "2.0.0"), None);
    }

    #[test]
    fn test_update_takes_priority() {
        let mut stale_model = instance("vm-1", "2.0.0");
        stale_model.latest_model_applied = false;
        let instances = vec![instance("vm-0", "1.0.0"), stale_model];

        let ws = WorkingSet::from_snapshot(&instances, "2.0.0");
        assert_eq!(instance_to_update(ws.as_ref()).unwrap().id, "vm-1");
        assert!(instance_to_drain(ws.as_ref()).is_none());
    }

    #[test]
    fn test_stale_model_mid_update_is_reported() {
        let mut updating = instance("vm-0", "2.0.0");
        updating.latest_model_applied = false;
        updating.provisioning_state = ProvisioningState::Updating;
        let mut stale = instance("vm-1", "2.0.0");
        stale.latest_model_applied = false;

        let ws = WorkingSet::from_snapshot(&[updating, stale], "2.0.0");
        assert_eq!(instance_already_being_updated(ws.as_ref()).unwrap().id, "vm-0");
        assert!(instance_to_update(ws.as_ref()).is_none());
    }

    #[test]
    fn test_drain_before_reimage() {
        let mut drained = instance("vm-0", "1.0.0");
        drained.drained = true;
        let instances = vec![drained, instance("vm-1", "1.0.0")];

        let ws = WorkingSet::from_snapshot(&instances, "2.0.0");
        assert_eq!(instance_to_drain(ws.as_ref()).unwrap().id, "vm-1");
        assert!(instance_to_reimage(ws.as_ref()).is_none());
    }

    #[test]
    fn test_reimage_drained_instance() {
        let mut drained = instance("vm-0", "1.0.0");
        drained.drained = true;
        let instances = vec![drained, instance("vm-1", "2.0.0")];

        let ws = WorkingSet::from_snapshot(&instances, "2.0.0");
        assert_eq!(instance_to_reimage(ws.as_ref()).unwrap().id, "vm-0");
    }

    #[test]
    fn test_in_flight_instance_blocks_idle_fleet() {
        let mut reimaging = instance("vm-0", "2.0.0");
        reimaging.provisioning_state = ProvisioningState::Updating;
        let instances = vec![reimaging, instance("vm-1", "2.0.0")];

        let ws = WorkingSet::from_snapshot(&instances, "2.0.0");
        assert!(is_wip(ws.as_ref()));
        assert_eq!(instance_already_being_updated(ws.as_ref()).unwrap().id, "vm-0");
    }

    #[test]
    fn test_exactly_one_marker_from_snapshot() {
        let mut a = instance("vm-0", "1.0.0");
        a.drained = true;
        let b = instance("vm-1", "1.0.0");
        let ws = WorkingSet::from_snapshot(&[a, b], "2.0.0").unwrap();
        let set = [
            ws.instance_to_update.is_some(),
            ws.instance_to_drain.is_some(),
            ws.instance_to_reimage.is_some(),
            ws.instance_already_being_updated.is_some(),
        ];
        assert_eq!(set.iter().filter(|s| **s).count(), 1);
    }
}
