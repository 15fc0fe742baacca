//! Device registry: the set of monitored endpoints and their runtime state.
//!
//! Everything lives behind one coarse lock. The poll loop takes a snapshot of
//! probe targets under it, probes without it, then applies each result under
//! it again, so removal and result processing are strictly ordered.

mod file;

pub use file::*;

use crate::device::{format_elapsed, DeviceConfig, DeviceId, DeviceStatus, ExpectedState, NotificationDelay};
use crate::monitor::tracker::{DeviceState, Transition};
use crate::probe::{ProbeError, ProbeOutcome};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::time::Instant;

/// Registry error types.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("device with address {0} already exists")]
    DuplicateAddress(String),
    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
    #[error("invalid label: {0:?}")]
    InvalidLabel(String),
    #[error("device {0} not found")]
    NotFound(String),
}

/// Immutable copy of a device handed out to readers.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub id: DeviceId,
    pub label: String,
    pub address: String,
    pub delay: NotificationDelay,
    pub expected: ExpectedState,
    pub status: DeviceStatus,
    pub status_since: Option<DateTime<Utc>>,
    pub elapsed_secs: u64,
    pub elapsed: String,
    pub notified: bool,
    #[serde(skip)]
    pub since: Option<Instant>,
    #[serde(skip)]
    pub episode: u64,
}

/// One probe the poll loop should run this cycle.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub id: DeviceId,
    pub address: String,
}

/// Result of applying a probe result to a registered device.
#[derive(Debug, Clone)]
pub struct Observation {
    pub device: DeviceSnapshot,
    pub transition: Option<Transition>,
}

struct Entry {
    id: DeviceId,
    config: DeviceConfig,
    state: DeviceState,
}

impl Entry {
    fn snapshot(&self, now: Instant) -> DeviceSnapshot {
        let elapsed = self.state.elapsed(now);
        DeviceSnapshot {
            id: self.id,
            label: self.config.label.clone(),
            address: self.config.address.clone(),
            delay: self.config.delay,
            expected: self.config.expected,
            status: self.state.status(),
            status_since: self.state.since_at(),
            elapsed_secs: elapsed.as_secs(),
            elapsed: format_elapsed(elapsed),
            notified: self.state.notified(),
            since: self.state.since(),
            episode: self.state.episode(),
        }
    }
}

struct Inner {
    entries: Vec<Entry>,
    next_id: DeviceId,
}

impl Inner {
    fn position(&self, address: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.config.address == address)
    }

    fn by_id_mut(&mut self, id: DeviceId) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }
}

/// Thread-safe device registry, in insertion order.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Register a device. It starts `Unknown` until its first probe.
    pub fn add(&self, config: DeviceConfig) -> Result<DeviceSnapshot, RegistryError> {
        let config = validate(config)?;

        let mut inner = self.inner.lock();
        if inner.position(&config.address).is_some() {
            return Err(RegistryError::DuplicateAddress(config.address));
        }

        let id = inner.next_id;
        inner.next_id += 1;

        let entry = Entry {
            id,
            config,
            state: DeviceState::new(),
        };
        let snapshot = entry.snapshot(Instant::now());
        inner.entries.push(entry);
        Ok(snapshot)
    }

    /// Unregister a device. Results still in flight for it are discarded.
    pub fn remove(&self, address: &str) -> Result<DeviceSnapshot, RegistryError> {
        let address = normalize_address(address);
        let mut inner = self.inner.lock();
        let pos = inner
            .position(&address)
            .ok_or_else(|| RegistryError::NotFound(address.clone()))?;
        let entry = inner.entries.remove(pos);
        Ok(entry.snapshot(Instant::now()))
    }

    /// Change alerting policy. Status and time-in-state are left alone.
    pub fn update_policy(
        &self,
        address: &str,
        delay: NotificationDelay,
        expected: ExpectedState,
    ) -> Result<DeviceSnapshot, RegistryError> {
        let address = normalize_address(address);
        let mut inner = self.inner.lock();
        let pos = inner
            .position(&address)
            .ok_or_else(|| RegistryError::NotFound(address.clone()))?;

        let entry = &mut inner.entries[pos];
        entry.config.delay = delay;
        entry.config.expected = expected;
        Ok(entry.snapshot(Instant::now()))
    }

    pub fn list(&self) -> Vec<DeviceSnapshot> {
        let now = Instant::now();
        self.inner.lock().entries.iter().map(|e| e.snapshot(now)).collect()
    }

    pub fn get(&self, address: &str) -> Option<DeviceSnapshot> {
        let address = normalize_address(address);
        let inner = self.inner.lock();
        inner
            .position(&address)
            .map(|pos| inner.entries[pos].snapshot(Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configuration of every device, for persisting the device list.
    pub fn configs(&self) -> Vec<DeviceConfig> {
        self.inner.lock().entries.iter().map(|e| e.config.clone()).collect()
    }

    pub fn probe_targets(&self) -> Vec<ProbeTarget> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| ProbeTarget {
                id: e.id,
                address: e.config.address.clone(),
            })
            .collect()
    }

    /// Apply a probe result to the device it was taken for.
    ///
    /// Returns `None` if that device has been removed since the cycle started.
    pub fn observe(
        &self,
        id: DeviceId,
        result: &Result<ProbeOutcome, ProbeError>,
        now: Instant,
        at: DateTime<Utc>,
    ) -> Option<Observation> {
        let mut inner = self.inner.lock();
        let entry = inner.by_id_mut(id)?;
        let transition = entry.state.observe(result, now, at);
        Some(Observation {
            device: entry.snapshot(now),
            transition,
        })
    }

    /// Confirm an offline alert against the current state.
    ///
    /// This is the re-check made when an offline timer fires: it succeeds only
    /// if the device still exists and is in the same unnotified offline
    /// episode the timer was armed for.
    pub fn mark_notified(&self, id: DeviceId, episode: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.by_id_mut(id) {
            Some(entry) if entry.config.delay != NotificationDelay::Never => entry.state.mark_notified(episode),
            _ => false,
        }
    }
}

fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

fn validate(mut config: DeviceConfig) -> Result<DeviceConfig, RegistryError> {
    config.address = normalize_address(&config.address);
    config.label = config.label.trim().to_string();

    if !is_valid_address(&config.address) {
        return Err(RegistryError::InvalidAddress(config.address));
    }
    // The device list is comma-delimited, one device per line.
    if config.label.is_empty() || config.label.contains([',', '\n', '\r']) {
        return Err(RegistryError::InvalidLabel(config.label));
    }
    Ok(config)
}

/// An IP literal or an RFC 1123 host name.
pub fn is_valid_address(address: &str) -> bool {
    if address.parse::<IpAddr>().is_ok() {
        return true;
    }

    static HOSTNAME: OnceLock<Regex> = OnceLock::new();
    let re = HOSTNAME.get_or_init(|| {
        Regex::new(r"^(?i)[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)*\.?$")
            .expect("valid regex")
    });

    // Dotted all-numeric strings that are not valid IPs (e.g. 300.1.1.1)
    let all_numeric = address.chars().all(|c| c.is_ascii_digit() || c == '.');
    address.len() <= 253 && !all_numeric && re.is_match(address)
}

/// When the offline alert for this snapshot's episode becomes due, if ever.
pub fn offline_deadline(device: &DeviceSnapshot) -> Option<Instant> {
    match (device.status, device.delay, device.since) {
        (DeviceStatus::Offline, NotificationDelay::After(delay), Some(since)) if !device.notified => {
            // Unrepresentable deadlines never come due.
            since.checked_add(delay)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn router() -> DeviceConfig {
        DeviceConfig::new("Router", "10.0.0.1", NotificationDelay::from_secs(5), ExpectedState::Online)
    }

    #[test]
    fn test_add_and_list() {
        let registry = Registry::new();
        let added = registry.add(router()).unwrap();
        assert_eq!(added.status, DeviceStatus::Unknown);
        assert_eq!(added.elapsed, "0d 0h 0m");

        let devices = registry.list();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].label, "Router");
        assert_eq!(devices[0].address, "10.0.0.1");
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let registry = Registry::new();
        registry.add(router()).unwrap();

        let mut dup = router();
        dup.label = "Other".to_string();
        dup.address = " 10.0.0.1 ".to_string();
        assert_eq!(
            registry.add(dup).unwrap_err(),
            RegistryError::DuplicateAddress("10.0.0.1".to_string())
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_address_rejected() {
        let registry = Registry::new();
        for bad in ["", "300.1.1.1", "host name", "-leading.example", "a..b"] {
            let mut cfg = router();
            cfg.address = bad.to_string();
            assert!(
                matches!(registry.add(cfg), Err(RegistryError::InvalidAddress(_))),
                "{bad:?} accepted"
            );
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_valid_addresses() {
        for good in ["10.0.0.5", "::1", "fe80::1", "printer", "nas.local", "Example.COM"] {
            assert!(is_valid_address(good), "{good:?} rejected");
        }
    }

    #[test]
    fn test_invalid_label_rejected() {
        let registry = Registry::new();
        for bad in ["", "   ", "a,b", "two\nlines"] {
            let mut cfg = router();
            cfg.label = bad.to_string();
            assert!(matches!(registry.add(cfg), Err(RegistryError::InvalidLabel(_))));
        }
    }

    #[test]
    fn test_remove_not_found() {
        let registry = Registry::new();
        assert_eq!(
            registry.remove("10.9.9.9").unwrap_err(),
            RegistryError::NotFound("10.9.9.9".to_string())
        );
    }

    #[test]
    fn test_result_for_removed_device_is_dropped() {
        let registry = Registry::new();
        let added = registry.add(router()).unwrap();
        let targets = registry.probe_targets();
        assert_eq!(targets.len(), 1);

        registry.remove("10.0.0.1").unwrap();
        let obs = registry.observe(added.id, &Ok(ProbeOutcome::Reachable), Instant::now(), Utc::now());
        assert!(obs.is_none());
        assert!(registry.probe_targets().is_empty());
    }

    #[test]
    fn test_readded_device_gets_fresh_identity() {
        let registry = Registry::new();
        let first = registry.add(router()).unwrap();
        registry.remove("10.0.0.1").unwrap();
        let second = registry.add(router()).unwrap();
        assert_ne!(first.id, second.id);

        // A late result for the old entry must not touch the new one
        assert!(registry
            .observe(first.id, &Ok(ProbeOutcome::Reachable), Instant::now(), Utc::now())
            .is_none());
        assert_eq!(registry.get("10.0.0.1").unwrap().status, DeviceStatus::Unknown);
    }

    #[test]
    fn test_update_policy_keeps_state() {
        let registry = Registry::new();
        let added = registry.add(router()).unwrap();
        let start = Instant::now();
        registry
            .observe(added.id, &Ok(ProbeOutcome::Unreachable), start, Utc::now())
            .unwrap();

        let updated = registry
            .update_policy("10.0.0.1", NotificationDelay::Never, ExpectedState::Offline)
            .unwrap();
        assert_eq!(updated.status, DeviceStatus::Offline);
        assert_eq!(updated.since, Some(start));
        assert_eq!(updated.delay, NotificationDelay::Never);
        assert_eq!(updated.expected, ExpectedState::Offline);

        assert!(matches!(
            registry.update_policy("10.0.0.2", NotificationDelay::Never, ExpectedState::Offline),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_is_a_copy() {
        let registry = Registry::new();
        let added = registry.add(router()).unwrap();
        let before = registry.list();

        registry
            .observe(added.id, &Ok(ProbeOutcome::Reachable), Instant::now(), Utc::now())
            .unwrap();

        assert_eq!(before[0].status, DeviceStatus::Unknown);
        assert_eq!(registry.list()[0].status, DeviceStatus::Online);
    }

    #[test]
    fn test_mark_notified_respects_never() {
        let registry = Registry::new();
        let mut cfg = router();
        cfg.delay = NotificationDelay::Never;
        let added = registry.add(cfg).unwrap();
        let obs = registry
            .observe(added.id, &Ok(ProbeOutcome::Unreachable), Instant::now(), Utc::now())
            .unwrap();
        assert!(!registry.mark_notified(added.id, obs.device.episode));
    }

    #[test]
    fn test_offline_deadline() {
        let registry = Registry::new();
        let added = registry.add(router()).unwrap();
        let start = Instant::now();
        let obs = registry
            .observe(added.id, &Ok(ProbeOutcome::Unreachable), start, Utc::now())
            .unwrap();
        assert_eq!(offline_deadline(&obs.device), Some(start + Duration::from_secs(5)));

        assert!(registry.mark_notified(added.id, obs.device.episode));
        assert_eq!(offline_deadline(&registry.get("10.0.0.1").unwrap()), None);
    }

    #[test]
    fn test_unrepresentable_deadline_is_never_due() {
        let registry = Registry::new();
        let added = registry
            .add(DeviceConfig::new("Far", "10.0.0.9", NotificationDelay::from_secs(u64::MAX), ExpectedState::Online))
            .unwrap();
        let obs = registry
            .observe(added.id, &Ok(ProbeOutcome::Unreachable), Instant::now(), Utc::now())
            .unwrap();
        assert_eq!(offline_deadline(&obs.device), None);
    }
}
