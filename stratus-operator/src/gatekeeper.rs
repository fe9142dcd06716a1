//! Gatekeeper - process-wide admission gate for throttled provider calls.
//!
//! After the provider answers with a throttling response, the caller records
//! the earliest retry time with [`Gatekeeper::not_before`]. Every gated call
//! site checks [`Gatekeeper::can_proceed`] first. This is a single shared
//! cell, not a rate limiter.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

/// Shared handle to one admission gate. Clones share the same timestamp.
#[derive(Debug, Clone, Default)]
pub struct Gatekeeper {
    not_before: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl Gatekeeper {
    /// Create an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        // The slot holds a plain timestamp, a poisoned lock still has a valid value.
        self.not_before.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the earliest permissible retry time. Last writer wins.
    pub fn not_before(&self, t: DateTime<Utc>) {
        debug!(not_before = %t, "Gate closed");
        *self.slot() = Some(t);
    }

    /// True iff the current time is strictly after the recorded time.
    pub fn can_proceed(&self) -> bool {
        self.can_proceed_at(Utc::now())
    }

    /// Like [`Gatekeeper::can_proceed`] with an explicit clock reading.
    pub fn can_proceed_at(&self, now: DateTime<Utc>) -> bool {
        match *self.slot() {
            Some(t) => now > t,
            None => true,
        }
    }

    /// The last value passed to [`Gatekeeper::not_before`], if any.
    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        *self.slot()
    }
}
