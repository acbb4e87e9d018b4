use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{LastWill, MqttOptions, QoS};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config;
use crate::messages::{Availability, PresenceReport, Telemetry};
use crate::supervisor::LinkEvent;

/// Outbound side of the broker connection used by the scan loop.
pub trait Uplink {
    fn publish_presence(&self, report: &PresenceReport) -> Result<(), rumqttc::ClientError>;
    fn publish_telemetry(&self, telemetry: &Telemetry) -> Result<(), rumqttc::ClientError>;
    fn publish_availability(&self, availability: Availability)
    -> Result<(), rumqttc::ClientError>;
    fn publish_debug(&self, message: &str) -> Result<(), rumqttc::ClientError>;
    fn publish_error(&self, message: &str) -> Result<(), rumqttc::ClientError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub presence: String,
    pub availability: String,
    pub telemetry: String,
    pub debug: String,
    pub error: String,
}

impl Topics {
    pub fn new(config: &config::AppConfig) -> Self {
        let room = sanitize_name(&config.node.room);
        let node = format!("{}/{}", config.mqtt.node_topic_prefix(), room);
        Topics {
            presence: format!("{}/{}", config.mqtt.channel(), room),
            availability: node.clone(),
            telemetry: format!("{}/telemetry", node),
            debug: format!("{}/debug", node),
            error: format!("{}/error", node),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    topics: Topics,
}

impl MqttClient {
    pub fn new(config: &config::AppConfig) -> (Self, rumqttc::EventLoop) {
        let mqtt = &config.mqtt;
        let topics = Topics::new(config);

        let mut mqttoptions = MqttOptions::new(
            config.node.hostname.clone(),
            mqtt.host.clone(),
            mqtt.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(mqtt.keep_alive_seconds.unwrap_or(60)));
        mqttoptions.set_last_will(LastWill::new(
            topics.availability.clone(),
            Availability::Disconnected.as_str(),
            QoS::AtMostOnce,
            true,
        ));

        if let (Some(username), Some(password)) = (mqtt.username.as_ref(), mqtt.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (MqttClient { client, topics }, eventloop)
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        message: &T,
    ) -> Result<(), rumqttc::ClientError> {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Error serializing message for {}: {:?}", topic, err);
                return Ok(());
            }
        };
        self.client.try_publish(topic, qos, retain, payload)
    }

    /// Drives the broker connection on behalf of the supervisor: the event loop
    /// is only polled between a `Connect` command and the end of that session.
    pub async fn drive_session(
        mut eventloop: rumqttc::EventLoop,
        mut commands: mpsc::Receiver<SessionCommand>,
        events: mpsc::Sender<LinkEvent>,
    ) {
        while let Some(command) = commands.recv().await {
            if command != SessionCommand::Connect {
                continue;
            }
            debug!("Connecting to MQTT broker");

            loop {
                tokio::select! {
                    command = commands.recv() => match command {
                        Some(SessionCommand::Connect) => {}
                        Some(SessionCommand::Disconnect) => {
                            info!("Dropping MQTT session");
                            eventloop.clean();
                            announce(&events, LinkEvent::SessionLost).await;
                            break;
                        }
                        None => return,
                    },
                    notification = eventloop.poll() => match notification {
                        Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                            debug!("Connection acknowledged");
                            announce(&events, LinkEvent::SessionEstablished).await;
                        }
                        Ok(rumqttc::Event::Incoming(rumqttc::Packet::Disconnect)) => {
                            warn!("Broker closed the MQTT session");
                            eventloop.clean();
                            announce(&events, LinkEvent::SessionLost).await;
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("Error polling MQTT event loop: {:?}", e);
                            announce(&events, LinkEvent::SessionLost).await;
                            break;
                        }
                    },
                }
            }
        }
    }
}

async fn announce(events: &mpsc::Sender<LinkEvent>, event: LinkEvent) {
    if let Err(err) = events.send(event).await {
        error!("Error announcing session change: {:?}", err);
    }
}

impl Uplink for MqttClient {
    fn publish_presence(&self, report: &PresenceReport) -> Result<(), rumqttc::ClientError> {
        debug!(
            "Reporting {} (rssi {}, distance {:.2})",
            report.id, report.rssi, report.distance
        );
        self.publish_json(&self.topics.presence, QoS::AtMostOnce, false, report)
    }

    fn publish_telemetry(&self, telemetry: &Telemetry) -> Result<(), rumqttc::ClientError> {
        self.publish_json(&self.topics.telemetry, QoS::AtMostOnce, true, telemetry)
    }

    fn publish_availability(
        &self,
        availability: Availability,
    ) -> Result<(), rumqttc::ClientError> {
        info!("Announcing {} on MQTT", availability.as_str());
        self.client.try_publish(
            &self.topics.availability,
            QoS::AtLeastOnce,
            true,
            availability.as_str(),
        )
    }

    fn publish_debug(&self, message: &str) -> Result<(), rumqttc::ClientError> {
        self.client
            .try_publish(&self.topics.debug, QoS::AtMostOnce, false, message)
    }

    fn publish_error(&self, message: &str) -> Result<(), rumqttc::ClientError> {
        self.client
            .try_publish(&self.topics.error, QoS::AtMostOnce, false, message)
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
