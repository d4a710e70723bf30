//! Screen lock detection and triggering.
//!
//! Detection runs an ordered list of probes; the first one that gives a
//! conclusive answer wins. If none does, the caller gets `None` and decides
//! what to assume.

use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use log::{debug, info};

use crate::command;
use crate::error::LockError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Locked,
    Unlocked,
    Inconclusive,
}

/// One way of asking the OS whether the screen is locked.
pub trait LockProbe: Send + Sync {
    fn name(&self) -> &'static str;
    fn probe(&self) -> BoxFuture<'_, ProbeOutcome>;
}

/// Screen lock capability the monitor depends on.
pub trait ScreenLock {
    /// `None` when no probe could tell.
    async fn is_screen_locked(&self) -> Option<bool>;
    async fn lock_screen(&self) -> Result<(), LockError>;
}

pub struct SessionLock {
    probes: Vec<Box<dyn LockProbe>>,
    lock_command: Vec<String>,
    lock_timeout: Duration,
}

impl SessionLock {
    pub fn new(probes: Vec<Box<dyn LockProbe>>, lock_command: &str) -> Self {
        SessionLock {
            probes,
            lock_command: lock_command.split_whitespace().map(str::to_string).collect(),
            lock_timeout: Duration::from_secs(5),
        }
    }

    /// Probes suited to the platform this was built for.
    pub fn for_current_platform(lock_command: &str) -> Self {
        let probes: Vec<Box<dyn LockProbe>> = if cfg!(target_os = "macos") {
            vec![
                Box::new(ScreenSaverProbe) as Box<dyn LockProbe>,
                Box::new(SystemEventsProbe),
            ]
        } else {
            vec![Box::new(LoginctlProbe::from_env()) as Box<dyn LockProbe>]
        };
        Self::new(probes, lock_command)
    }
}

impl ScreenLock for SessionLock {
    async fn is_screen_locked(&self) -> Option<bool> {
        for probe in &self.probes {
            match probe.probe().await {
                ProbeOutcome::Locked => return Some(true),
                ProbeOutcome::Unlocked => return Some(false),
                ProbeOutcome::Inconclusive => debug!("Lock probe {} was inconclusive", probe.name()),
            }
        }
        None
    }

    async fn lock_screen(&self) -> Result<(), LockError> {
        let (program, args) = self.lock_command.split_first().ok_or(LockError::EmptyCommand)?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = command::run(program, &args, self.lock_timeout).await?;
        if !output.status.success() {
            return Err(LockError::Exited {
                code: output.status.code(),
                stderr: command::stderr_of(&output),
            });
        }
        info!("Screen locked with `{}`", self.lock_command.join(" "));
        Ok(())
    }
}

/// systemd-logind's `LockedHint` for the current session.
pub struct LoginctlProbe {
    session: String,
}

impl LoginctlProbe {
    pub fn from_env() -> Self {
        LoginctlProbe {
            session: std::env::var("XDG_SESSION_ID").unwrap_or_else(|_| "auto".to_string()),
        }
    }
}

impl LockProbe for LoginctlProbe {
    fn name(&self) -> &'static str {
        "loginctl"
    }

    fn probe(&self) -> BoxFuture<'_, ProbeOutcome> {
        async move {
            let args = ["show-session", self.session.as_str(), "-p", "LockedHint", "--value"];
            match command::run("loginctl", &args, Duration::from_secs(2)).await {
                Ok(output) if output.status.success() => match command::stdout_of(&output).as_str() {
                    "yes" => ProbeOutcome::Locked,
                    "no" => ProbeOutcome::Unlocked,
                    _ => ProbeOutcome::Inconclusive,
                },
                Ok(_) => ProbeOutcome::Inconclusive,
                Err(err) => {
                    debug!("loginctl probe failed: {err}");
                    ProbeOutcome::Inconclusive
                }
            }
        }
        .boxed()
    }
}

/// A running screensaver means locked; its absence proves nothing.
pub struct ScreenSaverProbe;

impl LockProbe for ScreenSaverProbe {
    fn name(&self) -> &'static str {
        "screensaver"
    }

    fn probe(&self) -> BoxFuture<'_, ProbeOutcome> {
        async {
            match command::run("pgrep", &["-x", "ScreenSaverEngine"], Duration::from_secs(2)).await {
                Ok(output) if output.status.success() => ProbeOutcome::Locked,
                Ok(_) => ProbeOutcome::Inconclusive,
                Err(err) => {
                    debug!("screensaver probe failed: {err}");
                    ProbeOutcome::Inconclusive
                }
            }
        }
        .boxed()
    }
}

/// System Events only answers while the desktop is accessible.
pub struct SystemEventsProbe;

impl LockProbe for SystemEventsProbe {
    fn name(&self) -> &'static str {
        "system-events"
    }

    fn probe(&self) -> BoxFuture<'_, ProbeOutcome> {
        async {
            let script = r#"tell application "System Events" to get name of first desktop"#;
            match command::run("osascript", &["-e", script], Duration::from_secs(2)).await {
                Ok(output) if output.status.success() => ProbeOutcome::Unlocked,
                Ok(_) => ProbeOutcome::Locked,
                Err(err) => {
                    debug!("System Events probe failed: {err}");
                    ProbeOutcome::Inconclusive
                }
            }
        }
        .boxed()
    }
}
