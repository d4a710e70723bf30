use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::sync::watch;

mod ble;
mod blueutil;
mod command;
mod config;
mod device;
mod error;
mod lock;
mod logging;
mod messages;
mod monitor;
mod mqtt;
mod scanner;
mod setup;

use config::{AppConfig, Backend};
use error::ConfigError;
use monitor::MonitorSettings;
use scanner::{DeviceScanner, PresenceQuery, Reconnector};

/// Locks the screen when your phone walks away.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Pick the device to watch and write the configuration
    Setup,
    /// Print the connected and paired Bluetooth devices
    ListDevices,
    /// Watch the device and lock the screen when it goes away (default)
    Monitor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_or_create(&cli.config)?;

    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    logging::builder(&filters, config.log_file.as_deref())?.init();

    // Settle what to do before touching the adapter.
    let plan = Plan::new(cli.command.unwrap_or(Command::Monitor), &config)?;
    let backend = config.backend;
    match backend {
        Backend::Blueutil => dispatch(plan, &cli.config, config, blueutil::Blueutil::default()).await,
        Backend::Ble => {
            let backend = ble::BleBackend::connect().await?;
            dispatch(plan, &cli.config, config, backend).await
        }
    }
}

#[derive(Debug)]
enum Plan {
    Setup,
    ListDevices,
    Monitor(MonitorSettings),
}

impl Plan {
    /// Monitoring without a configured device is fatal.
    fn new(command: Command, config: &AppConfig) -> Result<Self, ConfigError> {
        Ok(match command {
            Command::Setup => Plan::Setup,
            Command::ListDevices => Plan::ListDevices,
            Command::Monitor => Plan::Monitor(MonitorSettings::from_config(config)?),
        })
    }
}

async fn dispatch<B>(plan: Plan, path: &Path, config: AppConfig, backend: B) -> anyhow::Result<()>
where
    B: DeviceScanner + Reconnector + Clone,
{
    match plan {
        Plan::Setup => setup::run(path, config, &PresenceQuery::new(backend)).await,
        Plan::ListDevices => {
            setup::list_devices(&PresenceQuery::new(backend)).await;
            Ok(())
        }
        Plan::Monitor(settings) => run_monitor(settings, config, backend).await,
    }
}

async fn run_monitor<B>(settings: MonitorSettings, config: AppConfig, backend: B) -> anyhow::Result<()>
where
    B: DeviceScanner + Reconnector + Clone,
{
    let lock = lock::SessionLock::for_current_platform(&config.lock_command);
    let monitor = monitor::Monitor::new(settings.clone(), PresenceQuery::new(backend.clone()), lock, backend);

    let mqtt_client = config.mqtt.as_ref().map(|mqtt_config| {
        let (client, mut eventloop) = mqtt::MqttClient::new(mqtt_config);
        tokio::task::spawn(async move {
            mqtt::MqttClient::event_loop(&mut eventloop).await;
        });

        let forwarder = client.clone();
        let device = settings
            .target
            .name
            .clone()
            .unwrap_or_else(|| settings.target.to_string());
        let rx = monitor.subscribe();
        tokio::task::spawn(async move {
            forwarder.forward(device, rx).await;
        });
        client
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::task::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for interrupt: {err}");
            std::future::pending::<()>().await;
        }
        info!("Received interrupt, stopping");
        let _ = shutdown_tx.send(true);
    });

    monitor.run(shutdown_rx).await;

    if let Some(client) = mqtt_client {
        client.disconnect().await?;
    }
    Ok(())
}
