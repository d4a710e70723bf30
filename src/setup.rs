//! Interactive device selection and the one-shot device listing.

use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::Context as _;

use crate::config::AppConfig;
use crate::device::DeviceSnapshot;
use crate::scanner::{DeviceScanner, PresenceQuery};

pub fn describe(device: &DeviceSnapshot) -> String {
    let status = if device.connected {
        "Connected"
    } else if device.paired {
        "Paired"
    } else {
        "Seen"
    };
    let mut line = format!("{} ({}) - {status}", device.name, device.address);
    if let Some(rssi) = device.rssi {
        line.push_str(&format!(" | RSSI: {rssi}dBm ({})", device.signal_quality()));
    }
    if device.name.to_lowercase().contains("phone") {
        line.push_str(" | Type: Mobile Phone");
    }
    line
}

pub async fn list_devices<S: DeviceScanner>(presence: &PresenceQuery<S>) {
    println!("Scanning for Bluetooth devices...");
    let devices = presence.scan_all().await;
    if devices.is_empty() {
        println!("No Bluetooth devices found.");
    }
    for device in &devices {
        println!("- {}", describe(device));
    }
}

pub async fn run<S: DeviceScanner>(
    path: &Path,
    config: AppConfig,
    presence: &PresenceQuery<S>,
) -> anyhow::Result<()> {
    println!();
    println!("=== Proximity Lock Setup ===");
    println!("Scanning for Bluetooth devices...");

    let devices = presence.scan_all().await;
    if devices.is_empty() {
        println!("No Bluetooth devices found. Make sure your phone is paired and connected.");
        return Ok(());
    }

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();
    match choose(&mut input, &mut output, &devices, config)? {
        Some(config) => {
            config
                .save(path)
                .with_context(|| format!("Failed to save configuration to {}", path.display()))?;
            println!();
            println!(
                "Configuration saved! Your device: {}",
                config.device_name.as_deref().unwrap_or_default()
            );
        }
        None => println!("Setup cancelled"),
    }
    Ok(())
}

/// Walks the prompts. `None` means the user gave input we cannot use.
fn choose<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    devices: &[DeviceSnapshot],
    mut config: AppConfig,
) -> io::Result<Option<AppConfig>> {
    writeln!(output)?;
    writeln!(output, "Found devices:")?;
    for (i, device) in devices.iter().enumerate() {
        writeln!(output, "{}. {}", i + 1, describe(device))?;
    }

    let answer = prompt(input, output, &format!("\nSelect your device (1-{}): ", devices.len()))?;
    let Some(device) = answer
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| devices.get(i))
    else {
        writeln!(output, "Invalid selection")?;
        return Ok(None);
    };
    config.device_name = Some(device.name.clone());
    config.device_address = Some(device.address.to_string());

    let label = format!("Timeout in seconds (default {}): ", config.timeout_seconds);
    match parse_optional(&prompt(input, output, &label)?) {
        Ok(Some(value)) => config.timeout_seconds = value,
        Ok(None) => {}
        Err(()) => return Ok(None),
    }

    let label = format!("Poll interval in seconds (default {}): ", config.poll_interval_seconds);
    match parse_optional(&prompt(input, output, &label)?) {
        Ok(Some(value)) => config.poll_interval_seconds = value,
        Ok(None) => {}
        Err(()) => return Ok(None),
    }

    Ok(Some(config))
}

fn prompt<R: BufRead, W: Write>(input: &mut R, output: &mut W, label: &str) -> io::Result<String> {
    write!(output, "{label}")?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Blank keeps the default; zero or junk is rejected.
fn parse_optional(answer: &str) -> Result<Option<u64>, ()> {
    if answer.is_empty() {
        return Ok(None);
    }
    match answer.parse::<u64>() {
        Ok(value) if value > 0 => Ok(Some(value)),
        _ => Err(()),
    }
}
