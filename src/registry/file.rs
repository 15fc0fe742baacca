//! Device list file: one `label,address,delay,expected` line per device.

use crate::device::{DeviceConfig, ExpectedState, NotificationDelay};

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;

/// Persistence error types.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed record on line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Parse one device line.
pub fn parse_device_line(line: &str, line_no: usize) -> Result<DeviceConfig, PersistError> {
    let malformed = |reason: String| PersistError::Malformed { line: line_no, reason };

    let parts: Vec<&str> = line.trim().splitn(4, ',').collect();
    let [label, address, delay, expected] = parts.as_slice() else {
        return Err(malformed(format!("expected 4 fields, found {}", parts.len())));
    };

    let delay: NotificationDelay = delay.parse().map_err(malformed)?;
    let expected: ExpectedState = expected.parse().map_err(malformed)?;

    Ok(DeviceConfig::new(label.trim(), address.trim(), delay, expected))
}

pub fn format_device_line(device: &DeviceConfig) -> String {
    format!(
        "{},{},{},{}",
        device.label,
        device.address,
        device.delay.label(),
        device.expected.as_str()
    )
}

/// Load the device list. A missing file is an empty list; bad lines are
/// skipped with a warning.
pub fn load_devices<P: AsRef<Path>>(path: P) -> Result<Vec<DeviceConfig>, PersistError> {
    let path = path.as_ref();
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut devices = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_device_line(line, idx + 1) {
            Ok(device) => devices.push(device),
            Err(e) => tracing::warn!("Skipping device entry in {}: {}", path.display(), e),
        }
    }

    Ok(devices)
}

/// Write the device list, replacing the file atomically.
pub fn save_devices<P: AsRef<Path>>(path: P, devices: &[DeviceConfig]) -> Result<(), PersistError> {
    let path = path.as_ref();
    let tmp = path.with_extension("tmp");

    {
        let mut file = fs::File::create(&tmp)?;
        for device in devices {
            writeln!(file, "{}", format_device_line(device))?;
        }
        file.sync_all()?;
    }

    fs::rename(&tmp, path)?;
    Ok(())
}
