use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure to run an external helper program.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
}

/// Failure while asking a backend about nearby devices.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("`{program}` exited with {code:?}: {stderr}")]
    Exited {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("malformed device listing: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("bluetooth call did not finish within {0:?}")]
    TimedOut(Duration),
}

/// Failure to issue the screen lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("no lock command configured")]
    EmptyCommand,

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("lock command exited with {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("no device configured; run `proximity-lock setup` first")]
    NoDevice,
}
