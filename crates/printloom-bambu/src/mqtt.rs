//! MQTT status channel for Bambu printers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use printloom_core::ConnectionConfig;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use rustls::ClientConfig;
use tokio::sync::mpsc;

use crate::error::{BambuError, Result};
use crate::transport::{BusConnection, BusEvent, CommandSink, MessageBus};

/// Default MQTT port (TLS).
pub const MQTT_PORT: u16 = 8883;

/// LAN-mode user name for both MQTT and FTPS.
pub const LAN_USER: &str = "bblp";

// Full reports with AMS data exceed rumqttc's 10 KiB default.
const MAX_PACKET_SIZE: usize = 512 * 1024;

/// Topic the printer publishes reports on.
pub fn report_topic(serial: &str) -> String {
    format!("device/{serial}/report")
}

/// Topic the printer reads commands from.
pub fn request_topic(serial: &str) -> String {
    format!("device/{serial}/request")
}

/// MQTT-over-TLS status channel.
#[derive(Clone)]
pub struct MqttBus {
    tls: Arc<ClientConfig>,
    connect_timeout: Duration,
}

impl MqttBus {
    /// Create a bus using `tls` for encrypted connections.
    pub fn new(tls: Arc<ClientConfig>, connect_timeout: Duration) -> Self {
        Self {
            tls,
            connect_timeout,
        }
    }

    fn options(&self, config: &ConnectionConfig) -> MqttOptions {
        let client_id = format!("printloom_{}", uuid::Uuid::new_v4().simple());
        let port = config.port.unwrap_or(MQTT_PORT);

        let mut options = MqttOptions::new(client_id, config.host.clone(), port);
        options.set_credentials(LAN_USER, config.access_code.clone());
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if config.use_tls {
            let tls = TlsConfiguration::Rustls(self.tls.clone());
            options.set_transport(Transport::tls_with_config(tls));
        }
        options
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn open(&self, config: &ConnectionConfig) -> Result<BusConnection> {
        let (client, mut event_loop) = AsyncClient::new(self.options(config), 64);

        wait_for_connection(&mut event_loop, self.connect_timeout).await?;

        let report = report_topic(&config.serial);
        client
            .subscribe(&report, QoS::AtMostOnce)
            .await
            .map_err(|e| BambuError::MqttError(e.to_string()))?;

        let (tx, events) = mpsc::channel(64);
        tokio::spawn(pump(event_loop, report, tx));

        let sink = MqttSink {
            client,
            topic: request_topic(&config.serial),
        };
        Ok(BusConnection {
            sink: Arc::new(sink),
            events,
        })
    }
}

async fn wait_for_connection(event_loop: &mut EventLoop, timeout: Duration) -> Result<()> {
    let handshake = async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return match ack.code {
                        ConnectReturnCode::Success => Ok(()),
                        code => Err(BambuError::ConnectionFailed(format!("broker refused: {code:?}"))),
                    };
                }
                Ok(_) => continue,
                Err(e) => return Err(BambuError::ConnectionFailed(e.to_string())),
            }
        }
    };

    tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| BambuError::Timeout("MQTT connection".into()))?
}

/// Drives the event loop and forwards reports until the channel dies or the
/// receiver goes away.
async fn pump(mut event_loop: EventLoop, topic: String, tx: mpsc::Sender<BusEvent>) {
    loop {
        let event = tokio::select! {
            _ = tx.closed() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == topic => {
                if tx.send(BusEvent::Report(publish.payload.to_vec())).await.is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "MQTT status channel failed");
                let _ = tx.send(BusEvent::Closed(e.to_string())).await;
                break;
            }
        }
    }
}

struct MqttSink {
    client: AsyncClient,
    topic: String,
}

#[async_trait]
impl CommandSink for MqttSink {
    async fn publish(&self, payload: String) -> Result<()> {
        self.client
            .publish(&self.topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| BambuError::MqttError(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "MQTT disconnect request not queued");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::device_client_config;

    #[test]
    fn test_topics() {
        assert_eq!(report_topic("01P00A123"), "device/01P00A123/report");
        assert_eq!(request_topic("01P00A123"), "device/01P00A123/request");
    }

    #[test]
    fn test_options() {
        let bus = MqttBus::new(device_client_config(), Duration::from_secs(5));
        let config = ConnectionConfig::new("192.168.1.20", "01P00A123", "12345678");
        let options = bus.options(&config);

        assert_eq!(options.broker_address(), ("192.168.1.20".to_string(), MQTT_PORT));
        assert_eq!(
            options.credentials(),
            Some((LAN_USER.to_string(), "12345678".to_string()))
        );
        assert!(options.client_id().starts_with("printloom_"));
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails() {
        let bus = MqttBus::new(device_client_config(), Duration::from_secs(2));
        let mut config = ConnectionConfig::new("127.0.0.1", "01P00A123", "12345678");
        config.port = Some(1);
        config.use_tls = false;

        assert!(bus.open(&config).await.is_err());
    }
}
