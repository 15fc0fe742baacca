//! Device model types shared by the registry, the monitor and the web API.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Registry-assigned identity of a device entry.
///
/// A removed and re-added address gets a fresh id, so results for the old
/// entry can never be applied to the new one.
pub type DeviceId = u64;

/// Observed reachability of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Unknown,
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Unknown => "Unknown",
            DeviceStatus::Online => "Online",
            DeviceStatus::Offline => "Offline",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unknown" => Ok(DeviceStatus::Unknown),
            "Online" => Ok(DeviceStatus::Online),
            "Offline" => Ok(DeviceStatus::Offline),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// Whether the operator expects the device to be online.
///
/// Only `Online` devices raise a recovery alert when they come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExpectedState {
    Online,
    #[default]
    Offline,
}

impl ExpectedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpectedState::Online => "On",
            ExpectedState::Offline => "Off",
        }
    }
}

impl fmt::Display for ExpectedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExpectedState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" | "online" => Ok(ExpectedState::Online),
            "off" | "offline" => Ok(ExpectedState::Offline),
            other => Err(format!("invalid expected state: {}", other)),
        }
    }
}

impl TryFrom<String> for ExpectedState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExpectedState> for String {
    fn from(value: ExpectedState) -> Self {
        value.as_str().to_string()
    }
}

/// Preset notification delays, in the order they are offered to operators.
const DELAY_PRESETS: &[(&str, Option<u64>)] = &[
    ("Never", None),
    ("3 seconds", Some(3)),
    ("5 seconds", Some(5)),
    ("15 seconds", Some(15)),
    ("30 seconds", Some(30)),
    ("1 minute", Some(60)),
    ("3 minutes", Some(3 * 60)),
    ("5 minutes", Some(5 * 60)),
    ("15 minutes", Some(15 * 60)),
    ("30 minutes", Some(30 * 60)),
    ("1 hour", Some(3600)),
    ("2 hours", Some(2 * 3600)),
    ("3 hours", Some(3 * 3600)),
    ("5 hours", Some(5 * 3600)),
    ("10 hours", Some(10 * 3600)),
    ("20 hours", Some(20 * 3600)),
    ("24 hours", Some(24 * 3600)),
    ("48 hours", Some(48 * 3600)),
];

/// Longest accepted delay, matching the largest preset.
pub const MAX_DELAY: Duration = Duration::from_secs(48 * 3600);

/// How long a device must stay offline before an unreachable alert is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NotificationDelay {
    #[default]
    Never,
    After(Duration),
}

impl NotificationDelay {
    pub fn from_secs(secs: u64) -> Self {
        NotificationDelay::After(Duration::from_secs(secs))
    }

    /// Labels of all presets, `Never` first.
    pub fn preset_labels() -> Vec<&'static str> {
        DELAY_PRESETS.iter().map(|(label, _)| *label).collect()
    }

    /// Persisted label: the preset name when one matches, `<secs>s` otherwise.
    pub fn label(&self) -> String {
        match self {
            NotificationDelay::Never => "Never".to_string(),
            NotificationDelay::After(d) if d.subsec_nanos() != 0 => format!("{}ms", d.as_millis()),
            NotificationDelay::After(d) => DELAY_PRESETS
                .iter()
                .find(|(_, secs)| *secs == Some(d.as_secs()))
                .map(|(label, _)| label.to_string())
                .unwrap_or_else(|| format!("{}s", d.as_secs())),
        }
    }
}

impl fmt::Display for NotificationDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl FromStr for NotificationDelay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Some((_, secs)) = DELAY_PRESETS
            .iter()
            .find(|(label, _)| label.eq_ignore_ascii_case(s))
        {
            return Ok(match secs {
                Some(secs) => NotificationDelay::from_secs(*secs),
                None => NotificationDelay::Never,
            });
        }

        if let Some(ms) = s.strip_suffix("ms") {
            return ms
                .parse::<u64>()
                .map_err(|_| format!("invalid notification delay: {}", s))
                .and_then(|ms| bounded(s, Duration::from_millis(ms)));
        }

        if let Some(secs) = s.strip_suffix('s') {
            if let Ok(secs) = secs.parse::<u64>() {
                return bounded(s, Duration::from_secs(secs));
            }
        }

        Err(format!("invalid notification delay: {}", s))
    }
}

fn bounded(s: &str, delay: Duration) -> Result<NotificationDelay, String> {
    if delay > MAX_DELAY {
        return Err(format!("notification delay {} exceeds {}", s, NotificationDelay::After(MAX_DELAY)));
    }
    Ok(NotificationDelay::After(delay))
}

impl TryFrom<String> for NotificationDelay {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NotificationDelay> for String {
    fn from(value: NotificationDelay) -> Self {
        value.label()
    }
}

/// Operator-controlled configuration of one monitored device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub label: String,
    pub address: String,
    #[serde(default)]
    pub delay: NotificationDelay,
    #[serde(default)]
    pub expected: ExpectedState,
}

impl DeviceConfig {
    pub fn new(label: &str, address: &str, delay: NotificationDelay, expected: ExpectedState) -> Self {
        Self {
            label: label.to_string(),
            address: address.to_string(),
            delay,
            expected,
        }
    }
}

/// Format a time-in-state as `Nd Nh Nm`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let days = secs / 86400;
    let hours = (secs % 86400) / 3600;
    let minutes = (secs % 3600) / 60;
    format!("{}d {}h {}m", days, hours, minutes)
}
