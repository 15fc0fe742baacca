//! Alert decisions: debounced offline alerts and immediate recovery alerts.

use crate::device::{DeviceId, DeviceStatus, ExpectedState};
use crate::registry::{offline_deadline, DeviceSnapshot, Observation};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    /// The device stayed offline for its whole notification delay.
    Unreachable,
    /// An expected-online device came back.
    Recovered,
}

/// A user-visible alert, handed to whoever renders notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub device_id: DeviceId,
    pub label: String,
    pub address: String,
    pub at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, device: &DeviceSnapshot, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            device_id: device.id,
            label: device.label.clone(),
            address: device.address.clone(),
            at,
        }
    }
}

/// What the notifier wants done after an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    /// Raise a recovery alert now.
    Recovered,
    /// The offline timer for `episode` has expired. The alert may only be
    /// raised once the registry confirms the episode is still current.
    OfflineDue { episode: u64 },
}

#[derive(Debug, Clone, Copy)]
struct OfflineTimer {
    episode: u64,
    deadline: Instant,
}

/// Per-device offline timers.
///
/// A timer is armed when a device goes offline and expires at `since + delay`.
/// It fires on the first offline observation at or after its deadline, so the
/// device has been seen offline across the whole delay.
#[derive(Debug, Default)]
pub struct Notifier {
    timers: HashMap<DeviceId, OfflineTimer>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_observation(&mut self, obs: &Observation, now: Instant) -> Option<AlertDecision> {
        let device = &obs.device;

        match obs.transition {
            Some(t) => {
                self.cancel(device.id);
                match t.to {
                    DeviceStatus::Offline => {
                        self.arm(device);
                        self.take_due(device, now)
                    }
                    DeviceStatus::Online
                        if t.from == DeviceStatus::Offline && device.expected == ExpectedState::Online =>
                    {
                        Some(AlertDecision::Recovered)
                    }
                    _ => None,
                }
            }
            None if device.status == DeviceStatus::Offline => self.take_due(device, now),
            None => None,
        }
    }

    /// (Re)arm the offline timer from a device's current state and policy.
    ///
    /// Used on a fresh offline transition and whenever the policy changes; the
    /// deadline is always measured from the start of the current episode.
    pub fn arm(&mut self, device: &DeviceSnapshot) {
        self.timers.remove(&device.id);
        if let Some(deadline) = offline_deadline(device) {
            tracing::debug!("Offline timer armed for {} ({})", device.label, device.address);
            self.timers.insert(
                device.id,
                OfflineTimer {
                    episode: device.episode,
                    deadline,
                },
            );
        }
    }

    /// Cancel a device's pending timer. Returns whether one was pending.
    pub fn cancel(&mut self, id: DeviceId) -> bool {
        self.timers.remove(&id).is_some()
    }

    pub fn cancel_all(&mut self) {
        self.timers.clear();
    }

    /// Deadline of the pending offline timer for a device.
    pub fn pending(&self, id: DeviceId) -> Option<Instant> {
        self.timers.get(&id).map(|t| t.deadline)
    }

    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }

    fn take_due(&mut self, device: &DeviceSnapshot, now: Instant) -> Option<AlertDecision> {
        let timer = *self.timers.get(&device.id)?;

        // A timer left over from an earlier episode can never fire.
        if timer.episode != device.episode {
            self.timers.remove(&device.id);
            return None;
        }
        if now < timer.deadline {
            return None;
        }

        self.timers.remove(&device.id);
        Some(AlertDecision::OfflineDue {
            episode: timer.episode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceConfig, NotificationDelay};
    use crate::probe::ProbeOutcome;
    use crate::registry::Registry;
    use std::time::Duration;

    fn setup(delay: NotificationDelay, expected: ExpectedState) -> (Registry, DeviceId) {
        let registry = Registry::new();
        let device = registry
            .add(DeviceConfig::new("D1", "10.0.0.5", delay, expected))
            .unwrap();
        (registry, device.id)
    }

    fn observe(registry: &Registry, id: DeviceId, up: bool, now: Instant) -> Observation {
        let outcome = if up { ProbeOutcome::Reachable } else { ProbeOutcome::Unreachable };
        registry.observe(id, &Ok(outcome), now, Utc::now()).unwrap()
    }

    #[test]
    fn test_offline_alert_after_delay() {
        let (registry, id) = setup(NotificationDelay::from_secs(5), ExpectedState::Offline);
        let mut notifier = Notifier::new();
        let t0 = Instant::now();

        let obs = observe(&registry, id, false, t0);
        assert_eq!(notifier.on_observation(&obs, t0), None);
        assert_eq!(notifier.pending(id), Some(t0 + Duration::from_secs(5)));

        let t3 = t0 + Duration::from_secs(3);
        assert_eq!(notifier.on_observation(&observe(&registry, id, false, t3), t3), None);

        let t6 = t0 + Duration::from_secs(6);
        let decision = notifier.on_observation(&observe(&registry, id, false, t6), t6);
        assert_eq!(decision, Some(AlertDecision::OfflineDue { episode: obs.device.episode }));
        assert_eq!(notifier.pending_count(), 0);

        // Further offline observations in the same episode stay quiet
        let t9 = t0 + Duration::from_secs(9);
        assert_eq!(notifier.on_observation(&observe(&registry, id, false, t9), t9), None);
    }

    #[test]
    fn test_recovery_before_delay_cancels() {
        let (registry, id) = setup(NotificationDelay::from_secs(5), ExpectedState::Offline);
        let mut notifier = Notifier::new();
        let t0 = Instant::now();

        notifier.on_observation(&observe(&registry, id, false, t0), t0);
        assert!(notifier.pending(id).is_some());

        let t3 = t0 + Duration::from_secs(3);
        assert_eq!(notifier.on_observation(&observe(&registry, id, true, t3), t3), None);
        assert!(notifier.pending(id).is_none());
    }

    #[test]
    fn test_recovery_alert_only_when_expected_online() {
        let t0 = Instant::now();
        let t3 = t0 + Duration::from_secs(3);

        let (registry, id) = setup(NotificationDelay::Never, ExpectedState::Online);
        let mut notifier = Notifier::new();
        notifier.on_observation(&observe(&registry, id, false, t0), t0);
        assert_eq!(
            notifier.on_observation(&observe(&registry, id, true, t3), t3),
            Some(AlertDecision::Recovered)
        );

        let (registry, id) = setup(NotificationDelay::Never, ExpectedState::Offline);
        let mut notifier = Notifier::new();
        notifier.on_observation(&observe(&registry, id, false, t0), t0);
        assert_eq!(notifier.on_observation(&observe(&registry, id, true, t3), t3), None);
    }

    #[test]
    fn test_first_probe_online_is_silent() {
        let (registry, id) = setup(NotificationDelay::from_secs(5), ExpectedState::Online);
        let mut notifier = Notifier::new();
        let t0 = Instant::now();
        assert_eq!(notifier.on_observation(&observe(&registry, id, true, t0), t0), None);
        assert_eq!(notifier.pending_count(), 0);
    }

    #[test]
    fn test_never_does_not_arm() {
        let (registry, id) = setup(NotificationDelay::Never, ExpectedState::Online);
        let mut notifier = Notifier::new();
        let t0 = Instant::now();

        for i in 0..100 {
            let now = t0 + Duration::from_secs(3 * i);
            assert_eq!(notifier.on_observation(&observe(&registry, id, false, now), now), None);
        }
        assert_eq!(notifier.pending_count(), 0);
    }

    #[test]
    fn test_rearm_after_policy_change() {
        let (registry, id) = setup(NotificationDelay::Never, ExpectedState::Online);
        let mut notifier = Notifier::new();
        let t0 = Instant::now();
        notifier.on_observation(&observe(&registry, id, false, t0), t0);
        assert!(notifier.pending(id).is_none());

        let updated = registry
            .update_policy("10.0.0.5", NotificationDelay::from_secs(5), ExpectedState::Online)
            .unwrap();
        notifier.arm(&updated);
        // Measured from when the device went offline, not from the change
        assert_eq!(notifier.pending(id), Some(t0 + Duration::from_secs(5)));

        let t6 = t0 + Duration::from_secs(6);
        assert!(matches!(
            notifier.on_observation(&observe(&registry, id, false, t6), t6),
            Some(AlertDecision::OfflineDue { .. })
        ));
    }

    #[test]
    fn test_cancel() {
        let (registry, id) = setup(NotificationDelay::from_secs(5), ExpectedState::Online);
        let mut notifier = Notifier::new();
        let t0 = Instant::now();
        notifier.on_observation(&observe(&registry, id, false, t0), t0);

        assert!(notifier.cancel(id));
        assert!(!notifier.cancel(id));
    }
}
