//! BlueZ/CoreBluetooth backend built on btleplug.

use std::future::Future;
use std::time::Duration;

use btleplug::api::{Central as _, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use log::{debug, info, warn};
use mac_address::MacAddress;

use crate::device::{DeviceSnapshot, parse_address};
use crate::error::ScanError;
use crate::scanner::{DeviceScanner, LookupKey, Reconnector};

const CALL_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct BleBackend {
    adapter: Adapter,
}

async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = btleplug::Result<T>>,
) -> Result<T, ScanError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ScanError::TimedOut(timeout)),
    }
}

impl BleBackend {
    /// Opens the first Bluetooth adapter and starts a background scan so
    /// peripherals stay visible.
    pub async fn connect() -> anyhow::Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no Bluetooth adapter found"))?;

        adapter.start_scan(ScanFilter::default()).await?;
        info!("Scanning with Bluetooth adapter {}", adapter.adapter_info().await?);

        Ok(BleBackend { adapter })
    }

    async fn snapshot(&self, peripheral: &Peripheral) -> Result<Option<DeviceSnapshot>, ScanError> {
        let Some(address) = parse_address(&peripheral.address().to_string()) else {
            return Ok(None);
        };
        let properties = bounded(CALL_TIMEOUT, peripheral.properties()).await?;
        let connected = bounded(CALL_TIMEOUT, peripheral.is_connected()).await?;

        let (name, rssi) = match properties {
            Some(p) => (p.local_name, p.rssi),
            None => (None, None),
        };

        // btleplug has no bonding information; a peripheral the adapter
        // knows about is treated as paired.
        Ok(Some(DeviceSnapshot {
            name: name.unwrap_or_else(|| "Unknown".to_string()),
            address,
            connected,
            paired: true,
            rssi,
        }))
    }

    async fn find(&self, address: &MacAddress) -> Result<Option<Peripheral>, ScanError> {
        let peripherals = bounded(CALL_TIMEOUT, self.adapter.peripherals()).await?;
        Ok(peripherals
            .into_iter()
            .find(|p| parse_address(&p.address().to_string()).as_ref() == Some(address)))
    }
}

impl DeviceScanner for BleBackend {
    async fn lookup(&self, key: LookupKey<'_>) -> Result<Option<DeviceSnapshot>, ScanError> {
        match key {
            LookupKey::Address(address) => match self.find(address).await? {
                Some(peripheral) => self.snapshot(&peripheral).await,
                None => Ok(None),
            },
            LookupKey::Name(name) => {
                let wanted = name.to_lowercase();
                Ok(self
                    .scan()
                    .await?
                    .into_iter()
                    .find(|d| d.name.to_lowercase() == wanted))
            }
        }
    }

    async fn scan(&self) -> Result<Vec<DeviceSnapshot>, ScanError> {
        let peripherals = bounded(CALL_TIMEOUT, self.adapter.peripherals()).await?;
        let mut devices = Vec::with_capacity(peripherals.len());
        for peripheral in &peripherals {
            match self.snapshot(peripheral).await {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(err) => debug!("Skipping peripheral {}: {err}", peripheral.address()),
            }
        }
        devices.sort_by_key(|d| !d.connected);
        Ok(devices)
    }

    fn scan_budget(&self) -> Duration {
        CALL_TIMEOUT * 4
    }
}

impl Reconnector for BleBackend {
    async fn reconnect(&self, address: &MacAddress) -> bool {
        let peripheral = match self.find(address).await {
            Ok(Some(peripheral)) => peripheral,
            Ok(None) => {
                warn!("Cannot reconnect to {address}: not visible to the adapter");
                return false;
            }
            Err(err) => {
                warn!("Cannot reconnect to {address}: {err}");
                return false;
            }
        };

        if let Ok(true) = bounded(CALL_TIMEOUT, peripheral.is_connected()).await {
            debug!("{address} is already connected");
            return true;
        }

        info!("Attempting to reconnect to {address}");
        match bounded(CONNECT_TIMEOUT, peripheral.connect()).await {
            Ok(()) => {
                info!("Reconnection to {address} succeeded");
                true
            }
            Err(err) => {
                warn!("Reconnection to {address} failed: {err}");
                false
            }
        }
    }
}
