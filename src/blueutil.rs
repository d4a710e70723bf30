//! macOS backend driving the `blueutil` command line tool.

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, info, warn};
use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::command;
use crate::device::{DeviceSnapshot, parse_address};
use crate::error::ScanError;
use crate::scanner::{DeviceScanner, LookupKey, Reconnector};

#[derive(Clone, Debug)]
pub struct Blueutil {
    pub program: String,
    pub info_timeout: Duration,
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for Blueutil {
    fn default() -> Self {
        Blueutil {
            program: "blueutil".to_string(),
            info_timeout: Duration::from_secs(3),
            scan_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Deserialize, Debug)]
struct BlueutilDevice {
    #[serde(default)]
    address: String,
    name: Option<String>,
    #[serde(default)]
    connected: bool,
    #[serde(default)]
    paired: bool,
    #[serde(rename = "RSSI")]
    rssi: Option<serde_json::Value>,
}

impl BlueutilDevice {
    fn into_snapshot(self) -> Option<DeviceSnapshot> {
        let Some(address) = parse_address(&self.address) else {
            debug!("Skipping device with unparseable address {:?}", self.address);
            return None;
        };
        let rssi = self
            .rssi
            .as_ref()
            .and_then(serde_json::Value::as_i64)
            .and_then(|r| i16::try_from(r).ok());
        Some(DeviceSnapshot {
            name: self.name.unwrap_or_else(|| "Unknown".to_string()),
            address,
            connected: self.connected,
            paired: self.paired,
            rssi,
        })
    }
}

/// blueutil wants `aa-bb-cc-dd-ee-ff`.
fn blueutil_address(address: &MacAddress) -> String {
    address.to_string().replace(':', "-").to_lowercase()
}

fn parse_listing(json: &str) -> Result<Vec<DeviceSnapshot>, ScanError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let devices: Vec<BlueutilDevice> = serde_json::from_str(json)?;
    Ok(devices
        .into_iter()
        .filter_map(BlueutilDevice::into_snapshot)
        .collect())
}

/// Connected devices first, then paired devices that are not already listed.
fn merge_listings(connected: Vec<DeviceSnapshot>, paired: Vec<DeviceSnapshot>) -> Vec<DeviceSnapshot> {
    let mut seen: HashSet<MacAddress> = connected.iter().map(|d| d.address).collect();
    let mut devices: Vec<DeviceSnapshot> = connected
        .into_iter()
        .map(|d| DeviceSnapshot {
            connected: true,
            ..d
        })
        .collect();
    for device in paired {
        if seen.insert(device.address) {
            devices.push(DeviceSnapshot {
                connected: false,
                paired: true,
                ..device
            });
        }
    }
    devices
}

impl Blueutil {
    async fn json(&self, args: &[&str], timeout: Duration) -> Result<String, ScanError> {
        let output = command::run(&self.program, args, timeout).await?;
        if !output.status.success() {
            return Err(ScanError::Exited {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: command::stderr_of(&output),
            });
        }
        Ok(command::stdout_of(&output))
    }

    async fn is_connected(&self, address: &str) -> Result<bool, ScanError> {
        let answer = self
            .json(&["--is-connected", address], self.info_timeout)
            .await?;
        Ok(answer == "1")
    }

    /// A listing that fails is skipped so the other one still counts.
    async fn listing(&self, which: &str) -> Vec<DeviceSnapshot> {
        let listed = self
            .json(&[which, "--format", "json"], self.scan_timeout)
            .await
            .and_then(|json| parse_listing(&json));
        match listed {
            Ok(devices) => devices,
            Err(err) => {
                debug!("Skipping blueutil {which} listing: {err}");
                Vec::new()
            }
        }
    }
}

impl DeviceScanner for Blueutil {
    async fn lookup(&self, key: LookupKey<'_>) -> Result<Option<DeviceSnapshot>, ScanError> {
        let id = match key {
            LookupKey::Address(address) => blueutil_address(address),
            LookupKey::Name(name) => name.to_string(),
        };
        // Unknown ids make blueutil exit non-zero, which is just "not found" here.
        let output = command::run(&self.program, &["--info", id.as_str(), "--format", "json"], self.info_timeout).await?;
        let stdout = command::stdout_of(&output);
        if !output.status.success() || stdout.is_empty() {
            return Ok(None);
        }
        let device: BlueutilDevice = serde_json::from_str(&stdout)?;
        Ok(device.into_snapshot())
    }

    async fn scan(&self) -> Result<Vec<DeviceSnapshot>, ScanError> {
        let connected = self.listing("--connected").await;
        let paired = self.listing("--paired").await;
        Ok(merge_listings(connected, paired))
    }

    fn scan_budget(&self) -> Duration {
        self.scan_timeout * 2 + Duration::from_secs(1)
    }
}

impl Reconnector for Blueutil {
    async fn reconnect(&self, address: &MacAddress) -> bool {
        let id = blueutil_address(address);

        match self.is_connected(&id).await {
            Ok(true) => {
                debug!("{address} is already connected");
                return true;
            }
            Ok(false) => {}
            Err(err) => debug!("Could not check connection state of {address}: {err}"),
        }

        info!("Attempting to reconnect to {address}");
        match command::run(&self.program, &["--connect", id.as_str()], self.connect_timeout).await {
            Ok(output) if output.status.success() => {
                info!("Reconnection to {address} succeeded");
                true
            }
            Ok(output) => {
                warn!("Reconnection to {address} failed: {}", command::stderr_of(&output));
                false
            }
            Err(err) => {
                warn!("Reconnection to {address} failed: {err}");
                false
            }
        }
    }
}
