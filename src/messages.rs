use std::fmt;

use log::Level;
use serde_derive::Serialize;

/// Why the device does not count as present this cycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Absence {
    NotFound,
    NotConnected { device: String },
    PairedDisconnected { device: String, reconnect_attempts: u32, max_attempts: u32 },
}

impl fmt::Display for Absence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Absence::NotFound => f.write_str("device NOT FOUND"),
            Absence::NotConnected { device } => write!(f, "{device} found but not connected"),
            Absence::PairedDisconnected {
                device,
                reconnect_attempts,
                max_attempts,
            } => {
                write!(f, "{device} PAIRED but disconnected")?;
                if *reconnect_attempts > 0 {
                    write!(f, " (reconnect attempts: {reconnect_attempts}/{max_attempts})")?;
                }
                Ok(())
            }
        }
    }
}

/// Everything the monitor reports, one status event per cycle plus transitions.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    Started { target: String, timeout_secs: u64, poll_interval_secs: u64 },
    DeviceReturned { cycle: u64 },
    DeviceLeft { cycle: u64 },
    Present {
        cycle: u64,
        device: String,
        rssi: Option<i16>,
        signal: String,
        screen_locked_by_us: bool,
    },
    ManualUnlock { cycle: u64 },
    ReconnectAttempt { cycle: u64, attempt: u32, max_attempts: u32, away_secs: f64 },
    ImmediateReconnect { cycle: u64 },
    Reconnected { cycle: u64 },
    ReconnectFailed { cycle: u64 },
    CountingDown {
        cycle: u64,
        absence: Absence,
        away_secs: f64,
        remaining_secs: f64,
        screen_locked_by_us: bool,
    },
    TimeoutReached { cycle: u64, absence: Absence, away_secs: f64 },
    ReconnectBudgetReset { cycle: u64 },
    Locking { cycle: u64 },
    LockFailed { cycle: u64, error: String },
    StillAway { cycle: u64, os_locked: bool },
    Stopped { cycles: u64 },
}

impl MonitorEvent {
    pub fn level(&self) -> Level {
        match self {
            MonitorEvent::DeviceLeft { .. }
            | MonitorEvent::TimeoutReached { .. }
            | MonitorEvent::ReconnectFailed { .. }
            | MonitorEvent::Locking { .. } => Level::Warn,
            MonitorEvent::LockFailed { .. } => Level::Error,
            _ => Level::Info,
        }
    }
}

fn lock_label(locked: bool) -> &'static str {
    if locked { "locked" } else { "unlocked" }
}

impl fmt::Display for MonitorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorEvent::Started {
                target,
                timeout_secs,
                poll_interval_secs,
            } => write!(
                f,
                "Monitoring {target} | timeout {timeout_secs}s | poll every {poll_interval_secs}s"
            ),
            MonitorEvent::DeviceReturned { cycle } => write!(
                f,
                "[Cycle {cycle:03}] Device RECONNECTED - assuming user returned and unlocked"
            ),
            MonitorEvent::DeviceLeft { cycle } => write!(
                f,
                "[Cycle {cycle:03}] Device DISCONNECTED - starting timeout countdown"
            ),
            MonitorEvent::Present {
                cycle,
                device,
                rssi,
                signal,
                screen_locked_by_us,
            } => {
                let rssi = rssi.map_or_else(|| "n/a".to_string(), |r| format!("{r}dBm"));
                write!(
                    f,
                    "[Cycle {cycle:03}] {device} CONNECTED | RSSI: {rssi} ({signal}) | Screen {}",
                    lock_label(*screen_locked_by_us)
                )
            }
            MonitorEvent::ManualUnlock { cycle } => {
                write!(f, "[Cycle {cycle:03}] Screen was manually unlocked - user is back")
            }
            MonitorEvent::ReconnectAttempt {
                cycle,
                attempt,
                max_attempts,
                away_secs,
            } => write!(
                f,
                "[Cycle {cycle:03}] Away for {away_secs:.1}s, reconnection attempt {attempt}/{max_attempts}"
            ),
            MonitorEvent::ImmediateReconnect { cycle } => write!(
                f,
                "[Cycle {cycle:03}] Device still disconnected, attempting immediate reconnection"
            ),
            MonitorEvent::Reconnected { cycle } => {
                write!(f, "[Cycle {cycle:03}] Reconnected, absence timer reset")
            }
            MonitorEvent::ReconnectFailed { cycle } => {
                write!(f, "[Cycle {cycle:03}] Reconnection failed")
            }
            MonitorEvent::CountingDown {
                cycle,
                absence,
                away_secs,
                remaining_secs,
                screen_locked_by_us,
            } => write!(
                f,
                "[Cycle {cycle:03}] {absence} | Away: {away_secs:.1}s | Lock in: {remaining_secs:.1}s | Screen {}",
                lock_label(*screen_locked_by_us)
            ),
            MonitorEvent::TimeoutReached {
                cycle,
                absence,
                away_secs,
            } => write!(
                f,
                "[Cycle {cycle:03}] {absence} | Away: {away_secs:.1}s | TIMEOUT REACHED"
            ),
            MonitorEvent::ReconnectBudgetReset { cycle } => {
                write!(f, "[Cycle {cycle:03}] Resetting reconnection attempts after timeout")
            }
            MonitorEvent::Locking { cycle } => write!(f, "[Cycle {cycle:03}] LOCKING SCREEN NOW"),
            MonitorEvent::LockFailed { cycle, error } => {
                write!(f, "[Cycle {cycle:03}] Failed to lock screen, will retry: {error}")
            }
            MonitorEvent::StillAway { cycle, os_locked } => {
                let screen = if *os_locked { "locked" } else { "unlocked (manually)" };
                write!(f, "[Cycle {cycle:03}] Screen {screen} | Device still away")
            }
            MonitorEvent::Stopped { cycles } => {
                write!(f, "Monitoring stopped after {cycles} cycles")
            }
        }
    }
}
