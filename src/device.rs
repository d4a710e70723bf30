use std::fmt;
use std::str::FromStr as _;

use mac_address::MacAddress;

/// What a backend reported about one device at one instant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub name: String,
    pub address: MacAddress,
    pub connected: bool,
    pub paired: bool,
    /// Received signal strength in dBm.
    pub rssi: Option<i16>,
}

impl DeviceSnapshot {
    pub fn signal_quality(&self) -> SignalQuality {
        SignalQuality::from_rssi(self.rssi)
    }
}

/// Parses `aa:bb:cc:dd:ee:ff` or `AA-BB-CC-DD-EE-FF` into a canonical address.
pub fn parse_address(raw: &str) -> Option<MacAddress> {
    let normalized = raw.trim().replace('-', ":");
    if normalized.is_empty() {
        return None;
    }
    MacAddress::from_str(&normalized).ok()
}

/// The device the monitor is watching for, by address and/or name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceTarget {
    pub name: Option<String>,
    pub address: Option<MacAddress>,
}

impl DeviceTarget {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.address.is_none()
    }

    /// Picks the target out of a full listing. An address match wins over a
    /// (case-insensitive, substring) name match anywhere in the list.
    pub fn select<'a>(&self, devices: &'a [DeviceSnapshot]) -> Option<&'a DeviceSnapshot> {
        if let Some(address) = &self.address {
            if let Some(device) = devices.iter().find(|d| &d.address == address) {
                return Some(device);
            }
        }
        let name = self.name.as_deref()?.to_lowercase();
        devices
            .iter()
            .find(|d| d.name.to_lowercase().contains(&name))
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.address) {
            (Some(name), Some(address)) => write!(f, "{name} ({address})"),
            (Some(name), None) => f.write_str(name),
            (None, Some(address)) => write!(f, "{address}"),
            (None, None) => f.write_str("<unconfigured>"),
        }
    }
}

/// Coarse signal label. Informational only, never used for presence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalQuality {
    Excellent,
    Good,
    Fair,
    Weak,
    Unknown,
}

impl SignalQuality {
    pub fn from_rssi(rssi: Option<i16>) -> Self {
        match rssi {
            Some(r) if r > -40 => SignalQuality::Excellent,
            Some(r) if r > -60 => SignalQuality::Good,
            Some(r) if r > -80 => SignalQuality::Fair,
            Some(_) => SignalQuality::Weak,
            None => SignalQuality::Unknown,
        }
    }
}

impl fmt::Display for SignalQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SignalQuality::Excellent => "excellent",
            SignalQuality::Good => "good",
            SignalQuality::Fair => "fair",
            SignalQuality::Weak => "weak",
            SignalQuality::Unknown => "unknown",
        };
        f.write_str(label)
    }
}
