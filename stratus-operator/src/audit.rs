//! Audit logging of infrastructure changes.
//!
//! Every mutating provider call the operator issues is recorded on the
//! `audit` tracing target together with the affected object ids, so the
//! history of a cluster can be filtered out of the regular log stream.

/// Audit logger for one operator component.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    component: String,
}

impl AuditLogger {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
        }
    }

    /// Record a change issued against a cluster's infrastructure.
    pub fn change(&self, cluster_id: &str, object_id: &str, message: impl AsRef<str>) {
        tracing::info!(
            target: "audit",
            component = %self.component,
            objects = ?[cluster_id, object_id],
            "{}",
            message.as_ref()
        );
    }
}
