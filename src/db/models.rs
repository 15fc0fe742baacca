//! Database model types.

use crate::device::DeviceStatus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of device history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    /// Assigned by the database; 0 before the record is stored.
    pub id: i64,
    pub label: String,
    pub address: String,
    pub time: DateTime<Utc>,
    pub status: DeviceStatus,
}

impl HistoryRecord {
    pub fn new(label: &str, address: &str, time: DateTime<Utc>, status: DeviceStatus) -> Self {
        Self {
            id: 0,
            label: label.to_string(),
            address: address.to_string(),
            time,
            status,
        }
    }
}

/// Filter for history reads. Unset fields do not restrict.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    pub address: Option<String>,
    /// Inclusive lower bound.
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Online/offline record counts for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceActivity {
    pub label: String,
    pub address: String,
    pub online_count: i64,
    pub offline_count: i64,
}

/// Per-device activity over the observed period, for report export.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivityReport {
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub total_records: i64,
    pub devices: Vec<DeviceActivity>,
}
