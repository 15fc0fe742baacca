//! Availability monitor: the poll loop and the pieces it drives.
//!
//! Each cycle snapshots the registry, probes every device concurrently, then
//! feeds results one by one through the state tracker, the notifier and the
//! history log.

mod history;
mod notifier;
pub mod tracker;

pub use history::*;
pub use notifier::*;

use crate::db::HistoryRecord;
use crate::device::{DeviceConfig, DeviceId, DeviceStatus, ExpectedState, NotificationDelay};
use crate::probe::{probe_with_deadline, ProbeError, ProbeOutcome, Prober};
use crate::registry::{self, DeviceSnapshot, ProbeTarget, Registry, RegistryError};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

/// A status change of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    pub device_id: DeviceId,
    pub label: String,
    pub address: String,
    pub from: DeviceStatus,
    pub to: DeviceStatus,
    pub at: DateTime<Utc>,
}

/// Everything the monitor publishes to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Transition(TransitionEvent),
    Alert(Alert),
}

/// Poll loop tuning.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub max_concurrent_probes: usize,
    /// Also log a history row for every steady-state observation.
    pub log_samples: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(2),
            max_concurrent_probes: 64,
            log_samples: false,
        }
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub probed: usize,
    pub transitions: usize,
    pub alerts: usize,
    pub elapsed: Duration,
}

/// The monitoring engine.
pub struct Monitor {
    settings: MonitorSettings,
    registry: Registry,
    notifier: Mutex<Notifier>,
    history: HistoryLog,
    prober: Arc<dyn Prober>,
    probe_limit: Arc<Semaphore>,
    events: broadcast::Sender<MonitorEvent>,
    devices_path: Option<PathBuf>,
    cancel: CancellationToken,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    /// Create a monitor. `devices_path`, when set, is rewritten after every
    /// add, remove and policy change.
    pub fn new(
        settings: MonitorSettings,
        prober: Arc<dyn Prober>,
        history: HistoryLog,
        devices_path: Option<PathBuf>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let probe_limit = Arc::new(Semaphore::new(settings.max_concurrent_probes.max(1)));

        Self {
            settings,
            registry: Registry::new(),
            notifier: Mutex::new(Notifier::new()),
            history,
            prober,
            probe_limit,
            events,
            devices_path,
            cancel: CancellationToken::new(),
            poll_task: Mutex::new(None),
        }
    }

    /// Register persisted devices without rewriting the device file.
    pub fn load_devices(&self, configs: Vec<DeviceConfig>) -> usize {
        let mut loaded = 0;
        for config in configs {
            match self.registry.add(config) {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!("Skipping persisted device: {}", e),
            }
        }
        loaded
    }

    /// Load the device file, if any. An unreadable file is logged and the
    /// monitor starts with whatever it already has.
    pub fn restore_devices(&self) -> usize {
        let Some(path) = &self.devices_path else {
            return 0;
        };

        match registry::load_devices(path) {
            Ok(configs) => self.load_devices(configs),
            Err(e) => {
                tracing::error!("Failed to read device list from {}: {}", path.display(), e);
                0
            }
        }
    }

    pub fn add_device(&self, config: DeviceConfig) -> Result<DeviceSnapshot, RegistryError> {
        let device = self.registry.add(config)?;
        tracing::info!("Monitor: Added device {} ({})", device.label, device.address);
        self.save_devices();
        Ok(device)
    }

    /// Remove a device and cancel its pending offline timer.
    ///
    /// Holding the notifier lock orders this against result processing: once
    /// it returns, no alert, event or history row is produced for the device.
    pub fn remove_device(&self, address: &str) -> Result<DeviceSnapshot, RegistryError> {
        let device = {
            let mut notifier = self.notifier.lock();
            let device = self.registry.remove(address)?;
            notifier.cancel(device.id);
            self.history.purge(&device.address);
            device
        };
        tracing::info!("Monitor: Removed device {} ({})", device.label, device.address);
        self.save_devices();
        Ok(device)
    }

    /// Change a device's alerting policy; a running offline timer is re-armed
    /// against the new delay.
    pub fn update_policy(
        &self,
        address: &str,
        delay: NotificationDelay,
        expected: ExpectedState,
    ) -> Result<DeviceSnapshot, RegistryError> {
        let device = {
            let mut notifier = self.notifier.lock();
            let device = self.registry.update_policy(address, delay, expected)?;
            notifier.arm(&device);
            device
        };
        tracing::info!(
            "Monitor: Updated {} ({}): delay={}, expected={}",
            device.label,
            device.address,
            device.delay,
            device.expected
        );
        self.save_devices();
        Ok(device)
    }

    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        self.registry.list()
    }

    pub fn device(&self, address: &str) -> Option<DeviceSnapshot> {
        self.registry.get(address)
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Number of armed offline timers.
    pub fn pending_alerts(&self) -> usize {
        self.notifier.lock().pending_count()
    }

    /// Persist the device list. Failures are logged; memory stays authoritative.
    pub fn save_devices(&self) -> bool {
        let Some(path) = &self.devices_path else {
            return true;
        };

        match registry::save_devices(path, &self.registry.configs()) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to save device list to {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Start the poll loop in the background.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.poll_task.lock();
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(run_poll_loop(self.clone())));
    }

    /// Stop the poll loop, drop pending timers, flush history and save devices.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let task = self.poll_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Poll loop ended abnormally: {}", e);
            }
        }

        self.notifier.lock().cancel_all();
        self.history.flush().await;
        self.save_devices();
        tracing::info!("Monitor stopped");
    }

    /// Probe every registered device once and apply the results.
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let targets = self.registry.probe_targets();
        let mut report = CycleReport {
            probed: targets.len(),
            ..Default::default()
        };

        let mut probes = JoinSet::new();
        for target in targets {
            let prober = self.prober.clone();
            let limit = self.probe_limit.clone();
            let timeout = self.settings.probe_timeout;

            probes.spawn(async move {
                let result = match limit.acquire_owned().await {
                    Ok(_permit) => probe_with_deadline(prober.as_ref(), &target.address, timeout).await,
                    Err(_) => Err(ProbeError::Network("probe pool closed".to_string())),
                };
                (target, result)
            });
        }

        // Results are applied in completion order; a failed task only loses its own device.
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((target, result)) => self.apply_result(&target, result, &mut report),
                Err(e) => tracing::error!("Probe task failed: {}", e),
            }
        }

        report.elapsed = started.elapsed();
        report
    }

    fn apply_result(
        &self,
        target: &ProbeTarget,
        result: Result<ProbeOutcome, ProbeError>,
        report: &mut CycleReport,
    ) {
        match &result {
            Err(ProbeError::Timeout(_)) => tracing::debug!("Probe timed out for {}", target.address),
            Err(e) => tracing::warn!("Probe failed for {}: {}", target.address, e),
            Ok(_) => {}
        }

        let now = Instant::now();
        let at = Utc::now();

        let mut notifier = self.notifier.lock();
        let Some(obs) = self.registry.observe(target.id, &result, now, at) else {
            tracing::debug!("Dropping result for removed device {}", target.address);
            return;
        };
        let device = &obs.device;

        if let Some(t) = obs.transition {
            tracing::info!("{} ({}) is now {} (was {})", device.label, device.address, t.to, t.from);
            report.transitions += 1;

            self.history
                .append(HistoryRecord::new(&device.label, &device.address, t.at, t.to));
            let _ = self.events.send(MonitorEvent::Transition(TransitionEvent {
                device_id: device.id,
                label: device.label.clone(),
                address: device.address.clone(),
                from: t.from,
                to: t.to,
                at: t.at,
            }));
        } else if self.settings.log_samples {
            self.history
                .append(HistoryRecord::new(&device.label, &device.address, at, device.status));
        }

        let alert = match notifier.on_observation(&obs, now) {
            Some(AlertDecision::Recovered) => Some(Alert::new(AlertKind::Recovered, device, at)),
            Some(AlertDecision::OfflineDue { episode }) => {
                if self.registry.mark_notified(device.id, episode) {
                    Some(Alert::new(AlertKind::Unreachable, device, at))
                } else {
                    tracing::debug!("Stale offline timer for {} ignored", device.address);
                    None
                }
            }
            None => None,
        };

        if let Some(alert) = alert {
            tracing::debug!("Alert raised for {} ({}): {:?}", alert.label, alert.address, alert.kind);
            report.alerts += 1;
            let _ = self.events.send(MonitorEvent::Alert(alert));
        }
    }
}

/// Run cycles at the configured cadence until cancelled.
///
/// A cycle that overruns the interval is followed immediately by the next;
/// missed ticks are not replayed.
async fn run_poll_loop(monitor: Arc<Monitor>) {
    let mut interval = tokio::time::interval(monitor.settings.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        "Poll loop started: interval={:?}, timeout={:?}, devices={}",
        monitor.settings.poll_interval,
        monitor.settings.probe_timeout,
        monitor.registry.len()
    );

    loop {
        tokio::select! {
            _ = monitor.cancel.cancelled() => break,
            _ = interval.tick() => {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    report = monitor.run_cycle() => {
                        tracing::debug!(
                            "Cycle: probed={} transitions={} alerts={} in {:?}",
                            report.probed,
                            report.transitions,
                            report.alerts,
                            report.elapsed
                        );
                    }
                }
            }
        }
    }

    tracing::info!("Poll loop stopped");
}
