use std::time::Duration;

use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS};
use tokio::sync::broadcast;

use crate::config;
use crate::messages::MonitorEvent;

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "proximity-lock".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "proximity".to_string()),
            },
            eventloop,
        )
    }

    /// Drives the connection. Publishing only makes progress while this runs.
    pub async fn event_loop(eventloop: &mut rumqttc::EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                    debug!("Connection acknowledged");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn topic_for(&self, device: &str) -> String {
        format!(
            "{}/{}/{}",
            self.topic_path,
            self.publisher_id,
            sanitize_name(device)
        )
    }

    pub async fn announce(&self, device: &str, event: &MonitorEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)?;
        self.client
            .publish(self.topic_for(device), QoS::AtMostOnce, false, payload)
            .await?;
        Ok(())
    }

    /// Publishes every monitor event until the monitor goes away.
    pub async fn forward(&self, device: String, mut rx: broadcast::Receiver<MonitorEvent>) {
        info!("Publishing monitor events to {}", self.topic_for(&device));
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(err) = self.announce(&device, &event).await {
                        error!("Error publishing monitor event: {:?}", err);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Monitor event channel closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Dropped {skipped} monitor events");
                }
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
