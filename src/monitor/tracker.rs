//! Per-device reachability state machine.

use crate::device::DeviceStatus;
use crate::probe::{ProbeError, ProbeOutcome};

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// A change of observed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: DeviceStatus,
    pub to: DeviceStatus,
    pub at: DateTime<Utc>,
}

/// Runtime state of one device.
///
/// `episode` increases on every transition. Anything armed for an earlier
/// episode (an offline timer, a pending alert) is stale once it changes.
#[derive(Debug, Clone)]
pub struct DeviceState {
    status: DeviceStatus,
    since: Option<Instant>,
    since_at: Option<DateTime<Utc>>,
    notified: bool,
    episode: u64,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceState {
    pub fn new() -> Self {
        Self {
            status: DeviceStatus::Unknown,
            since: None,
            since_at: None,
            notified: false,
            episode: 0,
        }
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    /// Monotonic start of the current status, `None` while Unknown.
    pub fn since(&self) -> Option<Instant> {
        self.since
    }

    /// Wall-clock start of the current status, `None` while Unknown.
    pub fn since_at(&self) -> Option<DateTime<Utc>> {
        self.since_at
    }

    pub fn notified(&self) -> bool {
        self.notified
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }

    /// Time spent in the current status. Display only.
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default()
    }

    /// Feed one probe result. Returns the transition if the status changed.
    pub fn observe(
        &mut self,
        result: &Result<ProbeOutcome, ProbeError>,
        now: Instant,
        at: DateTime<Utc>,
    ) -> Option<Transition> {
        let observed = observed_status(result);
        if observed == self.status {
            return None;
        }

        let transition = Transition {
            from: self.status,
            to: observed,
            at,
        };

        self.status = observed;
        self.since = Some(now);
        self.since_at = Some(at);
        self.notified = false;
        self.episode += 1;

        Some(transition)
    }

    /// Record that the offline alert for `episode` went out.
    ///
    /// Returns false when the state has moved on since the alert was armed, or
    /// the alert was already raised; the caller must then stay silent.
    pub fn mark_notified(&mut self, episode: u64) -> bool {
        if self.episode != episode || self.status != DeviceStatus::Offline || self.notified {
            return false;
        }
        self.notified = true;
        true
    }
}

/// Errors fail closed: a probe that could not run counts as unreachable.
pub fn observed_status(result: &Result<ProbeOutcome, ProbeError>) -> DeviceStatus {
    match result {
        Ok(ProbeOutcome::Reachable) => DeviceStatus::Online,
        Ok(ProbeOutcome::Unreachable) | Err(_) => DeviceStatus::Offline,
    }
}
