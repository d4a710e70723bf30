use std::future::Future;
use std::time::Duration;

use log::debug;
use mac_address::MacAddress;

use crate::device::{DeviceSnapshot, DeviceTarget};
use crate::error::ScanError;

/// How long a single backend call may take before the device counts as not found.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(6);

#[derive(Clone, Copy, Debug)]
pub enum LookupKey<'a> {
    Address(&'a MacAddress),
    Name(&'a str),
}

/// A source of Bluetooth device facts.
pub trait DeviceScanner {
    /// Fast lookup of a single device. `Ok(None)` means the backend does not know it.
    async fn lookup(&self, key: LookupKey<'_>) -> Result<Option<DeviceSnapshot>, ScanError>;

    /// Every connected or paired device the backend knows about.
    async fn scan(&self) -> Result<Vec<DeviceSnapshot>, ScanError>;

    /// Upper bound for a whole [`scan`](Self::scan). Backends that make
    /// several bounded calls per scan cover all of them here.
    fn scan_budget(&self) -> Duration {
        DEFAULT_CALL_TIMEOUT
    }
}

/// Best-effort request to re-establish the link to a paired device.
///
/// Implementations bound their own calls and must report success without
/// side effects when the device is already connected.
pub trait Reconnector {
    async fn reconnect(&self, address: &MacAddress) -> bool;
}

/// Resolves the configured target into a snapshot, treating every failure
/// or overrun as "not found".
pub struct PresenceQuery<S> {
    scanner: S,
    call_timeout: Duration,
}

impl<S: DeviceScanner> PresenceQuery<S> {
    pub fn new(scanner: S) -> Self {
        Self::with_timeout(scanner, DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_timeout(scanner: S, call_timeout: Duration) -> Self {
        PresenceQuery {
            scanner,
            call_timeout,
        }
    }

    #[cfg(test)]
    pub fn scanner(&self) -> &S {
        &self.scanner
    }

    pub async fn query(&self, target: &DeviceTarget) -> Option<DeviceSnapshot> {
        if let Some(address) = &target.address {
            if let Some(device) = self.lookup(LookupKey::Address(address)).await {
                return Some(device);
            }
        }
        if let Some(name) = &target.name {
            if let Some(device) = self.lookup(LookupKey::Name(name)).await {
                return Some(device);
            }
        }

        let devices = self.scan_all().await;
        target.select(&devices).cloned()
    }

    /// Full listing; empty when the backend fails.
    pub async fn scan_all(&self) -> Vec<DeviceSnapshot> {
        let budget = self.call_timeout.max(self.scanner.scan_budget());
        self.bounded(self.scanner.scan(), budget, "device scan")
            .await
            .unwrap_or_default()
    }

    async fn lookup(&self, key: LookupKey<'_>) -> Option<DeviceSnapshot> {
        self.bounded(self.scanner.lookup(key), self.call_timeout, "direct lookup")
            .await
            .flatten()
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ScanError>>,
        timeout: Duration,
        what: &str,
    ) -> Option<T> {
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                debug!("Bluetooth {what} failed: {err}");
                None
            }
            Err(_) => {
                debug!("Bluetooth {what} timed out after {timeout:?}");
                None
            }
        }
    }
}
