//! Thin MQTT transport (§4.10): subscribes to
//! `autopinned/<hostname>/AddProcess` and forwards each message's payload
//! as a process-config string for the Watchdog to attach.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;

use crate::error::{errors, AutopinError};

const ADD_PROCESS_COMMAND: &str = "AddProcess";
const DEFAULT_PORT: u16 = 1883;
const KEEP_ALIVE_SECS: u64 = 60;

pub struct MqttClient {
    client: AsyncClient,
}

impl MqttClient {
    /// Connects, subscribes to the single `AddProcess` command topic, and
    /// returns the client plus a channel fed by the event-loop task.
    pub async fn connect(
        hostname_cfg: Option<&str>,
        port_cfg: Option<u16>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<String>), AutopinError> {
        let broker_host = hostname_cfg.filter(|h| !h.is_empty()).unwrap_or("localhost");
        let port = port_cfg.filter(|&p| p != 0).unwrap_or(DEFAULT_PORT);

        let client_id = format!("autopinned_{}", std::process::id());
        let mut options = MqttOptions::new(client_id, broker_host, port);
        options.set_keep_alive(std::time::Duration::from_secs(KEEP_ALIVE_SECS));

        let (client, mut eventloop) = AsyncClient::new(options, 16);

        let this_host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let topic = format!("autopinned/{this_host}/{ADD_PROCESS_COMMAND}");

        client
            .subscribe(&topic, QoS::ExactlyOnce)
            .await
            .map_err(|e| errors::comm("connect", format!("cannot subscribe to {topic}: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Ok(payload) = String::from_utf8(publish.payload.to_vec()) {
                            if tx.send(payload).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Comm/connect: mqtt event loop error: {e}");
                    }
                }
            }
        });

        Ok((Self { client }, rx))
    }

    pub async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_name_follows_the_add_process_convention() {
        let host = "myhost";
        let topic = format!("autopinned/{host}/{ADD_PROCESS_COMMAND}");
        assert_eq!(topic, "autopinned/myhost/AddProcess");
    }

    #[test]
    fn zero_port_falls_back_to_the_default_mqtt_port() {
        let port = Some(0u16).filter(|&p| p != 0).unwrap_or(DEFAULT_PORT);
        assert_eq!(port, DEFAULT_PORT);
    }
}
