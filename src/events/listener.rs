//! Controller update socket listener
//!
//! Owns the websocket connection to the controller's realtime update
//! endpoint, decodes each binary message with the update protocol codec and
//! publishes decoded device changes on the event bus. Decode failures drop
//! the offending packet only; the connection keeps reading.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use rand::Rng;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LivestreamConfig;
use crate::error::Result;
use crate::events::{BridgeEvent, EventBus};
use crate::protocol::{decode_packet, UpdatePayload};

/// Listener for the controller's realtime update socket
pub struct UpdateListener {
    url: String,
    api_key: String,
    bus: Arc<EventBus>,
    backoff: LivestreamConfig,
    shutdown: CancellationToken,
}

impl UpdateListener {
    pub fn new(
        url: String,
        api_key: String,
        bus: Arc<EventBus>,
        backoff: LivestreamConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            url,
            api_key,
            bus,
            backoff,
            shutdown,
        }
    }

    /// Run the listener until shutdown
    ///
    /// Reconnects with the shared backoff discipline: the delay grows by half
    /// the base per consecutive failure, caps at three times the base, and
    /// resets once a connection survives the reset window.
    pub async fn run(self) {
        let base = self.backoff.restart_base_secs;
        let mut delay_secs = base;

        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let connected_at = Instant::now();
            match self.read_socket().await {
                Ok(()) => return, // shutdown requested mid-read
                Err(e) => {
                    self.bus.publish(BridgeEvent::ControllerDisconnected {
                        reason: e.to_string(),
                    });
                    warn!("Update socket dropped: {}", e);
                }
            }

            if connected_at.elapsed() > Duration::from_secs(self.backoff.backoff_reset_secs) {
                delay_secs = base;
            }

            let jitter: u64 = rand::thread_rng().gen_range(0..=self.backoff.restart_jitter_secs);
            let wait = Duration::from_secs(delay_secs + jitter);
            debug!("Reconnecting update socket in {:?}", wait);

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            delay_secs = (delay_secs + self.backoff.backoff_step_secs())
                .min(self.backoff.backoff_cap_secs());
        }
    }

    /// Connect and pump messages until the socket drops or shutdown fires
    async fn read_socket(&self) -> Result<()> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Ok(value) = HeaderValue::from_str(&self.api_key) {
            request.headers_mut().insert("X-API-KEY", value);
        }

        let (mut ws, _) = connect_async(request).await?;
        info!("Update socket connected to {}", self.url);
        self.bus.publish(BridgeEvent::ControllerConnected {
            address: self.url.clone(),
        });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                msg = ws.next() => {
                    match msg {
                        Some(Ok(Message::Binary(buf))) => self.dispatch(&buf),
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Text(text))) => {
                            debug!("Ignoring text message on update socket: {} bytes", text.len());
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(crate::BridgeError::Stream(
                                "update socket closed by controller".to_string(),
                            ));
                        }
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Decode one binary message and publish the result
    ///
    /// Malformed packets are logged and dropped; the connection continues.
    fn dispatch(&self, buf: &[u8]) {
        let packet = match decode_packet(buf) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping malformed update packet ({} bytes): {}", buf.len(), e);
                return;
            }
        };

        let payload = match packet.payload {
            UpdatePayload::Json(value) => value,
            UpdatePayload::Text(text) => serde_json::Value::String(text),
            UpdatePayload::Raw(raw) => {
                debug!(
                    "Ignoring raw update payload for {} {} ({} bytes)",
                    packet.action.model_key,
                    packet.action.id,
                    raw.len()
                );
                return;
            }
        };

        self.bus.publish(BridgeEvent::DeviceUpdated {
            model_key: packet.action.model_key,
            id: packet.action.id,
            new_update_id: packet.action.new_update_id,
            payload,
            received_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_packet, ActionFrame, UpdatePacket};

    fn listener_with_bus() -> (UpdateListener, tokio::sync::broadcast::Receiver<BridgeEvent>) {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe();
        let listener = UpdateListener::new(
            "wss://nvr.local/ws/updates".to_string(),
            "key".to_string(),
            bus,
            LivestreamConfig::default(),
            CancellationToken::new(),
        );
        (listener, rx)
    }

    #[tokio::test]
    async fn test_dispatch_publishes_device_update() {
        let (listener, mut rx) = listener_with_bus();
        let packet = UpdatePacket {
            action: ActionFrame {
                action: "update".to_string(),
                id: "cam1".to_string(),
                model_key: "camera".to_string(),
                new_update_id: "u9".to_string(),
            },
            payload: UpdatePayload::Json(serde_json::json!({"isMotionDetected": true})),
        };
        let wire = encode_packet(&packet, true).unwrap();

        listener.dispatch(&wire);

        match rx.recv().await.unwrap() {
            BridgeEvent::DeviceUpdated {
                model_key,
                id,
                payload,
                ..
            } => {
                assert_eq!(model_key, "camera");
                assert_eq!(id, "cam1");
                assert_eq!(payload["isMotionDetected"], true);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_drops_malformed_silently() {
        let (listener, mut rx) = listener_with_bus();
        listener.dispatch(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(rx.try_recv().is_err());
    }
}
