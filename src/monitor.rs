//! The presence monitor: one poll cycle at a time, deciding whether to lock.
//!
//! All session state lives in [`MonitorState`], owned by the caller of
//! [`Monitor::run_cycle`] and mutated only there. Adapter failures are
//! downgraded to "unknown" and never end the loop.

use std::time::Duration;

use mac_address::MacAddress;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::config::AppConfig;
use crate::device::{DeviceSnapshot, DeviceTarget};
use crate::error::ConfigError;
use crate::lock::ScreenLock;
use crate::messages::{Absence, MonitorEvent};
use crate::scanner::{DeviceScanner, PresenceQuery, Reconnector};

#[derive(Clone, Debug)]
pub struct MonitorSettings {
    pub target: DeviceTarget,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_spacing: Duration,
}

impl MonitorSettings {
    /// Fails when there is no device to watch.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let target = config.target()?;
        if target.is_empty() {
            return Err(ConfigError::NoDevice);
        }
        Ok(MonitorSettings {
            target,
            timeout: Duration::from_secs(config.timeout_seconds),
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            auto_reconnect: config.auto_reconnect,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_spacing: Duration::from_secs(config.reconnect_delay_seconds),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MonitorState {
    /// Only ever moves forward.
    pub last_seen_at: Instant,
    /// Set right after we issue a lock, cleared on reconnect or manual unlock.
    pub screen_locked_by_us: bool,
    pub last_connected_observed: Option<bool>,
    pub reconnect_attempts: u32,
    pub last_reconnect_at: Option<Instant>,
    pub cycle: u64,
}

impl MonitorState {
    pub fn new(now: Instant) -> Self {
        MonitorState {
            last_seen_at: now,
            screen_locked_by_us: false,
            last_connected_observed: None,
            reconnect_attempts: 0,
            last_reconnect_at: None,
            cycle: 0,
        }
    }

    fn mark_seen(&mut self, now: Instant) {
        if now > self.last_seen_at {
            self.last_seen_at = now;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Sleep for the poll interval before the next cycle.
    Settled,
    /// A reconnection succeeded; start the next cycle straight away.
    Reconnected,
}

pub struct Monitor<S, L, R> {
    settings: MonitorSettings,
    presence: PresenceQuery<S>,
    lock: L,
    reconnector: R,
    events: broadcast::Sender<MonitorEvent>,
}

impl<S, L, R> Monitor<S, L, R>
where
    S: DeviceScanner,
    L: ScreenLock,
    R: Reconnector,
{
    pub fn new(settings: MonitorSettings, presence: PresenceQuery<S>, lock: L, reconnector: R) -> Self {
        let (events, _) = broadcast::channel(32);
        Monitor {
            settings,
            presence,
            lock,
            reconnector,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MonitorEvent) {
        log::log!(event.level(), "{event}");
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Polls until `shutdown` flips to true (or its sender goes away).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> MonitorState {
        let mut state = MonitorState::new(Instant::now());
        self.emit(MonitorEvent::Started {
            target: self.settings.target.to_string(),
            timeout_secs: self.settings.timeout.as_secs(),
            poll_interval_secs: self.settings.poll_interval.as_secs(),
        });

        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.run_cycle(&mut state, Instant::now()).await == CycleOutcome::Reconnected {
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.emit(MonitorEvent::Stopped { cycles: state.cycle });
        state
    }

    pub async fn run_cycle(&self, state: &mut MonitorState, now: Instant) -> CycleOutcome {
        state.cycle += 1;
        let cycle = state.cycle;

        let snapshot = self.presence.query(&self.settings.target).await;
        let connected = snapshot.as_ref().is_some_and(|d| d.connected);

        match state.last_connected_observed {
            Some(false) if connected => {
                state.screen_locked_by_us = false;
                self.emit(MonitorEvent::DeviceReturned { cycle });
            }
            Some(true) if !connected => self.emit(MonitorEvent::DeviceLeft { cycle }),
            _ => {}
        }
        state.last_connected_observed = Some(connected);

        if let Some(device) = snapshot.as_ref().filter(|d| d.connected) {
            state.mark_seen(now);
            state.reconnect_attempts = 0;
            self.emit(MonitorEvent::Present {
                cycle,
                device: device.name.clone(),
                rssi: device.rssi,
                signal: device.signal_quality().to_string(),
                screen_locked_by_us: state.screen_locked_by_us,
            });
            return CycleOutcome::Settled;
        }

        let elapsed = now.saturating_duration_since(state.last_seen_at);
        let os_locked = match self.lock.is_screen_locked().await {
            Some(locked) => locked,
            None => {
                log::debug!("Screen lock state unknown, assuming {}", state.screen_locked_by_us);
                state.screen_locked_by_us
            }
        };
        let reconnectable = snapshot
            .as_ref()
            .filter(|d| d.paired && self.settings.auto_reconnect)
            .map(|d| d.address);
        let mut attempted = false;

        if state.screen_locked_by_us && !os_locked {
            state.screen_locked_by_us = false;
            self.emit(MonitorEvent::ManualUnlock { cycle });

            if let Some(address) = reconnectable {
                self.emit(MonitorEvent::ImmediateReconnect { cycle });
                attempted = true;
                if self.attempt_reconnect(state, &address, now).await {
                    return CycleOutcome::Reconnected;
                }
            }
        }

        if let Some(address) = reconnectable {
            let spaced = state
                .last_reconnect_at
                .is_none_or(|at| now.saturating_duration_since(at) >= self.settings.reconnect_spacing);
            if !attempted
                && spaced
                && state.reconnect_attempts < self.settings.max_reconnect_attempts
                && elapsed < self.settings.timeout
            {
                state.reconnect_attempts += 1;
                self.emit(MonitorEvent::ReconnectAttempt {
                    cycle,
                    attempt: state.reconnect_attempts,
                    max_attempts: self.settings.max_reconnect_attempts,
                    away_secs: elapsed.as_secs_f64(),
                });
                if self.attempt_reconnect(state, &address, now).await {
                    return CycleOutcome::Reconnected;
                }
            }
        }

        let absence = self.absence(snapshot.as_ref(), state);
        if elapsed >= self.settings.timeout {
            self.emit(MonitorEvent::TimeoutReached {
                cycle,
                absence,
                away_secs: elapsed.as_secs_f64(),
            });
            if state.reconnect_attempts > 0 {
                self.emit(MonitorEvent::ReconnectBudgetReset { cycle });
            }
            state.reconnect_attempts = 0;

            if state.screen_locked_by_us {
                self.emit(MonitorEvent::StillAway { cycle, os_locked });
            } else {
                self.emit(MonitorEvent::Locking { cycle });
                match self.lock.lock_screen().await {
                    Ok(()) => state.screen_locked_by_us = true,
                    // Flag stays clear so the next cycle tries again.
                    Err(err) => self.emit(MonitorEvent::LockFailed {
                        cycle,
                        error: err.to_string(),
                    }),
                }
            }
        } else {
            self.emit(MonitorEvent::CountingDown {
                cycle,
                absence,
                away_secs: elapsed.as_secs_f64(),
                remaining_secs: (self.settings.timeout - elapsed).as_secs_f64(),
                screen_locked_by_us: state.screen_locked_by_us,
            });
        }

        CycleOutcome::Settled
    }

    async fn attempt_reconnect(&self, state: &mut MonitorState, address: &MacAddress, now: Instant) -> bool {
        let cycle = state.cycle;
        let started = Instant::now();
        let reconnected = self.reconnector.reconnect(address).await;
        // Spacing counts from the end of the call, however long it took.
        state.last_reconnect_at = Some(now + started.elapsed());
        if reconnected {
            state.mark_seen(now);
            state.reconnect_attempts = 0;
            self.emit(MonitorEvent::Reconnected { cycle });
            true
        } else {
            self.emit(MonitorEvent::ReconnectFailed { cycle });
            false
        }
    }

    fn absence(&self, snapshot: Option<&DeviceSnapshot>, state: &MonitorState) -> Absence {
        match snapshot {
            None => Absence::NotFound,
            Some(device) if device.paired => Absence::PairedDisconnected {
                device: device.name.clone(),
                reconnect_attempts: state.reconnect_attempts,
                max_attempts: self.settings.max_reconnect_attempts,
            },
            Some(device) => Absence::NotConnected {
                device: device.name.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    use super::*;
    use crate::device::parse_address;
    use crate::device::tests::snapshot;
    use crate::error::{LockError, ScanError};
    use crate::scanner::LookupKey;

    const PHONE: &str = "aa:bb:cc:dd:ee:ff";

    #[derive(Default)]
    struct FakeScanner {
        current: RefCell<Option<DeviceSnapshot>>,
    }

    impl DeviceScanner for FakeScanner {
        async fn lookup(&self, _key: LookupKey<'_>) -> Result<Option<DeviceSnapshot>, ScanError> {
            Ok(self.current.borrow().clone())
        }

        async fn scan(&self) -> Result<Vec<DeviceSnapshot>, ScanError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct FakeLock {
        os_state: Cell<Option<bool>>,
        lock_calls: Cell<u32>,
        fail_lock: Cell<bool>,
    }

    impl ScreenLock for FakeLock {
        async fn is_screen_locked(&self) -> Option<bool> {
            self.os_state.get()
        }

        async fn lock_screen(&self) -> Result<(), LockError> {
            self.lock_calls.set(self.lock_calls.get() + 1);
            if self.fail_lock.get() {
                return Err(LockError::EmptyCommand);
            }
            self.os_state.set(Some(true));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeReconnector {
        results: RefCell<VecDeque<bool>>,
        calls: Cell<u32>,
        always_succeed: Cell<bool>,
        delay: Cell<Duration>,
    }

    impl Reconnector for FakeReconnector {
        async fn reconnect(&self, _address: &MacAddress) -> bool {
            self.calls.set(self.calls.get() + 1);
            if !self.delay.get().is_zero() {
                tokio::time::sleep(self.delay.get()).await;
            }
            self.always_succeed.get() || self.results.borrow_mut().pop_front().unwrap_or(false)
        }
    }

    fn settings(timeout: u64, auto_reconnect: bool) -> MonitorSettings {
        MonitorSettings {
            target: DeviceTarget {
                name: None,
                address: parse_address(PHONE),
            },
            timeout: Duration::from_secs(timeout),
            poll_interval: Duration::from_secs(5),
            auto_reconnect,
            max_reconnect_attempts: 3,
            reconnect_spacing: Duration::ZERO,
        }
    }

    type TestMonitor = Monitor<FakeScanner, FakeLock, FakeReconnector>;

    fn monitor(settings: MonitorSettings) -> TestMonitor {
        Monitor::new(
            settings,
            PresenceQuery::new(FakeScanner::default()),
            FakeLock::default(),
            FakeReconnector::default(),
        )
    }

    impl TestMonitor {
        fn device(&self, device: Option<DeviceSnapshot>) {
            *self.presence.scanner().current.borrow_mut() = device;
        }
    }

    fn at(start: Instant, secs: u64) -> Instant {
        start + Duration::from_secs(secs)
    }

    fn connected() -> Option<DeviceSnapshot> {
        Some(snapshot("Pixel 8", PHONE, true))
    }

    fn disconnected() -> Option<DeviceSnapshot> {
        Some(snapshot("Pixel 8", PHONE, false))
    }

    #[test]
    fn test_settings_require_a_device() {
        assert!(matches!(
            MonitorSettings::from_config(&AppConfig::default()),
            Err(ConfigError::NoDevice)
        ));

        let config = AppConfig {
            device_name: Some("Pixel 8".to_string()),
            reconnect_delay_seconds: 4,
            ..AppConfig::default()
        };
        let settings = MonitorSettings::from_config(&config).unwrap();
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.poll_interval, Duration::from_secs(5));
        assert_eq!(settings.reconnect_spacing, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_present_device_tracks_now_and_never_locks() {
        let monitor = monitor(settings(10, true));
        let start = Instant::now();
        let mut state = MonitorState::new(start);
        monitor.device(connected());

        for secs in [0, 5, 10, 15, 20, 25] {
            let outcome = monitor.run_cycle(&mut state, at(start, secs)).await;
            assert_eq!(outcome, CycleOutcome::Settled);
            assert_eq!(state.last_seen_at, at(start, secs));
        }
        assert_eq!(monitor.lock.lock_calls.get(), 0);
        assert!(!state.screen_locked_by_us);
        assert_eq!(state.last_connected_observed, Some(true));
    }

    #[tokio::test]
    async fn test_locks_on_second_disconnected_cycle_without_reconnect() {
        let monitor = monitor(settings(10, false));
        let start = Instant::now();
        let mut state = MonitorState::new(start);

        monitor.device(connected());
        monitor.run_cycle(&mut state, at(start, 0)).await;

        monitor.device(disconnected());
        monitor.run_cycle(&mut state, at(start, 5)).await;
        assert_eq!(monitor.lock.lock_calls.get(), 0);

        monitor.run_cycle(&mut state, at(start, 10)).await;
        assert_eq!(monitor.lock.lock_calls.get(), 1);
        assert!(state.screen_locked_by_us);

        monitor.run_cycle(&mut state, at(start, 15)).await;
        monitor.run_cycle(&mut state, at(start, 20)).await;
        assert_eq!(monitor.lock.lock_calls.get(), 1);
        assert_eq!(monitor.reconnector.calls.get(), 0);
    }

    #[tokio::test]
    async fn test_missing_device_counts_as_absent() {
        let monitor = monitor(settings(10, true));
        let start = Instant::now();
        let mut state = MonitorState::new(start);
        let mut events = monitor.subscribe();

        monitor.run_cycle(&mut state, at(start, 12)).await;
        assert_eq!(state.last_connected_observed, Some(false));
        assert_eq!(monitor.lock.lock_calls.get(), 1);
        assert_eq!(monitor.reconnector.calls.get(), 0);

        let mut saw_not_found = false;
        while let Ok(event) = events.try_recv() {
            if let MonitorEvent::TimeoutReached { absence, .. } = event {
                saw_not_found = absence == Absence::NotFound;
            }
        }
        assert!(saw_not_found);
    }

    #[tokio::test]
    async fn test_failed_reconnects_then_lock_resets_budget() {
        let monitor = monitor(settings(10, true));
        let start = Instant::now();
        let mut state = MonitorState::new(start);

        monitor.device(connected());
        monitor.run_cycle(&mut state, at(start, 0)).await;

        monitor.device(disconnected());
        for (secs, attempts) in [(2, 1), (4, 2), (6, 3), (8, 3)] {
            monitor.run_cycle(&mut state, at(start, secs)).await;
            assert_eq!(state.reconnect_attempts, attempts);
        }
        assert_eq!(monitor.reconnector.calls.get(), 3);
        assert_eq!(monitor.lock.lock_calls.get(), 0);

        monitor.run_cycle(&mut state, at(start, 10)).await;
        assert_eq!(monitor.lock.lock_calls.get(), 1);
        assert_eq!(state.reconnect_attempts, 0);
        assert_eq!(monitor.reconnector.calls.get(), 3);
    }

    #[tokio::test]
    async fn test_reconnect_attempts_stay_within_budget() {
        let monitor = monitor(settings(3600, true));
        let start = Instant::now();
        let mut state = MonitorState::new(start);
        monitor.device(disconnected());

        for secs in 1..50 {
            monitor.run_cycle(&mut state, at(start, secs)).await;
            assert!(state.reconnect_attempts <= 3);
        }
        assert_eq!(monitor.reconnector.calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_spacing_is_respected() {
        let mut settings = settings(3600, true);
        settings.reconnect_spacing = Duration::from_secs(10);
        let monitor = monitor(settings);
        let start = Instant::now();
        let mut state = MonitorState::new(start);
        monitor.device(disconnected());

        for secs in [1, 5, 9, 11, 15, 21] {
            monitor.run_cycle(&mut state, at(start, secs)).await;
        }
        // Attempts at 1s, 11s and 21s only.
        assert_eq!(monitor.reconnector.calls.get(), 3);
    }

    #[tokio::test]
    async fn test_successful_reconnect_resets_timer() {
        let monitor = monitor(settings(10, true));
        monitor.reconnector.results.borrow_mut().push_back(true);
        let start = Instant::now();
        let mut state = MonitorState::new(start);
        monitor.device(disconnected());

        let outcome = monitor.run_cycle(&mut state, at(start, 4)).await;
        assert_eq!(outcome, CycleOutcome::Reconnected);
        assert_eq!(state.last_seen_at, at(start, 4));
        assert_eq!(state.reconnect_attempts, 0);
        assert_eq!(monitor.lock.lock_calls.get(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_edge_clears_lock_flag() {
        let monitor = monitor(settings(10, false));
        let start = Instant::now();
        let mut state = MonitorState::new(start);
        monitor.device(disconnected());

        monitor.run_cycle(&mut state, at(start, 5)).await;
        monitor.run_cycle(&mut state, at(start, 60)).await;
        assert!(state.screen_locked_by_us);

        monitor.device(connected());
        monitor.run_cycle(&mut state, at(start, 65)).await;
        assert!(!state.screen_locked_by_us);
        assert_eq!(state.last_seen_at, at(start, 65));
    }

    #[tokio::test]
    async fn test_manual_unlock_triggers_one_immediate_reconnect() {
        let monitor = monitor(settings(10, true));
        monitor.reconnector.results.borrow_mut().push_back(true);
        let start = Instant::now();
        let mut state = MonitorState {
            screen_locked_by_us: true,
            last_connected_observed: Some(false),
            ..MonitorState::new(start)
        };
        monitor.device(disconnected());
        monitor.lock.os_state.set(Some(false));

        let outcome = monitor.run_cycle(&mut state, at(start, 60)).await;
        assert_eq!(outcome, CycleOutcome::Reconnected);
        assert!(!state.screen_locked_by_us);
        assert_eq!(monitor.reconnector.calls.get(), 1);
        assert_eq!(state.last_seen_at, at(start, 60));
        assert_eq!(monitor.lock.lock_calls.get(), 0);
    }

    #[tokio::test]
    async fn test_manual_unlock_with_failed_reconnect_falls_through_to_timeout() {
        let monitor = monitor(settings(10, true));
        let start = Instant::now();
        let mut state = MonitorState {
            screen_locked_by_us: true,
            last_connected_observed: Some(false),
            ..MonitorState::new(start)
        };
        monitor.device(disconnected());
        monitor.lock.os_state.set(Some(false));

        let outcome = monitor.run_cycle(&mut state, at(start, 5)).await;
        assert_eq!(outcome, CycleOutcome::Settled);
        assert!(!state.screen_locked_by_us);
        // Still within the timeout, but only the immediate attempt is made.
        assert_eq!(monitor.reconnector.calls.get(), 1);
        assert_eq!(state.reconnect_attempts, 0);

        monitor.run_cycle(&mut state, at(start, 30)).await;
        assert_eq!(monitor.lock.lock_calls.get(), 1);
        assert!(state.screen_locked_by_us);
    }

    #[tokio::test]
    async fn test_unknown_lock_state_keeps_internal_flag() {
        let monitor = monitor(settings(10, true));
        let start = Instant::now();
        let mut state = MonitorState {
            screen_locked_by_us: true,
            last_connected_observed: Some(false),
            ..MonitorState::new(start)
        };
        monitor.device(None);
        monitor.lock.os_state.set(None);

        monitor.run_cycle(&mut state, at(start, 60)).await;
        assert!(state.screen_locked_by_us);
        assert_eq!(monitor.lock.lock_calls.get(), 0);
        assert_eq!(monitor.reconnector.calls.get(), 0);
    }

    #[tokio::test]
    async fn test_failed_lock_is_retried_next_cycle() {
        let monitor = monitor(settings(10, false));
        monitor.lock.fail_lock.set(true);
        let start = Instant::now();
        let mut state = MonitorState::new(start);
        monitor.device(disconnected());

        monitor.run_cycle(&mut state, at(start, 10)).await;
        assert!(!state.screen_locked_by_us);

        monitor.lock.fail_lock.set(false);
        monitor.run_cycle(&mut state, at(start, 15)).await;
        assert!(state.screen_locked_by_us);
        assert_eq!(monitor.lock.lock_calls.get(), 2);
    }

    #[tokio::test]
    async fn test_transitions_are_reported() {
        let monitor = monitor(settings(10, false));
        let mut events = monitor.subscribe();
        let start = Instant::now();
        let mut state = MonitorState::new(start);

        monitor.device(connected());
        monitor.run_cycle(&mut state, at(start, 0)).await;
        monitor.device(disconnected());
        monitor.run_cycle(&mut state, at(start, 5)).await;
        monitor.run_cycle(&mut state, at(start, 10)).await;
        monitor.device(connected());
        monitor.run_cycle(&mut state, at(start, 15)).await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen[0], MonitorEvent::Present { cycle: 1, .. }));
        assert!(matches!(seen[1], MonitorEvent::DeviceLeft { cycle: 2 }));
        assert!(matches!(
            seen[2],
            MonitorEvent::CountingDown { cycle: 2, remaining_secs, .. } if remaining_secs == 5.0
        ));
        assert!(seen.contains(&MonitorEvent::Locking { cycle: 3 }));
        assert!(seen.contains(&MonitorEvent::DeviceReturned { cycle: 4 }));
        assert!(matches!(
            seen.last(),
            Some(MonitorEvent::Present {
                cycle: 4,
                screen_locked_by_us: false,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let monitor = monitor(settings(10, true));
        monitor.device(connected());
        let (tx, rx) = watch::channel(false);

        let stop = async {
            tokio::time::sleep(Duration::from_secs(12)).await;
            tx.send(true).unwrap();
        };
        let (state, ()) = tokio::join!(monitor.run(rx), stop);

        // Cycles at 0s, 5s and 10s; shutdown lands during the third sleep.
        assert_eq!(state.cycle, 3);
        assert_eq!(monitor.lock.lock_calls.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reconnect_claiming_success_still_sleeps() {
        let monitor = monitor(MonitorSettings {
            reconnect_spacing: Duration::from_secs(2),
            ..settings(30, true)
        });
        monitor.device(disconnected());
        monitor.reconnector.always_succeed.set(true);
        monitor.reconnector.delay.set(Duration::from_secs(3));
        let (tx, rx) = watch::channel(false);

        let stop = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            tx.send(true).unwrap();
        };
        let (state, ()) = tokio::join!(monitor.run(rx), stop);

        // Each claimed reconnect is followed by one immediate cycle that is
        // inside the spacing, then a normal poll sleep: one attempt per 8s.
        assert_eq!(monitor.reconnector.calls.get(), 8);
        assert!(state.cycle <= 16);
    }
}
