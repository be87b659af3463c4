//! The bridge's own MQTT session against the local broker.

use super::{CommandBridge, Publisher, BRIDGE_CLIENT_ID, BRIDGE_SUBSCRIPTIONS};
use async_trait::async_trait;
use bumper_core::{BumperError, BumperResult};
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Publishing half of the link; cheap to clone.
#[derive(Clone)]
pub struct MqttLink {
    client: AsyncClient,
}

impl MqttLink {
    /// Create the link. Nothing connects until the returned event loop is
    /// driven by [`MqttLink::spawn`].
    pub fn new(host: &str, port: u16) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(BRIDGE_CLIENT_ID, host, port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        let (client, eventloop) = AsyncClient::new(options, 64);
        (Self { client }, eventloop)
    }

    /// Drive the event loop, handing every publish to `bridge`. Connection
    /// errors are retried every few seconds until shutdown.
    pub fn spawn(
        &self,
        mut eventloop: EventLoop,
        bridge: Arc<CommandBridge>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        let _ = client.try_disconnect();
                        break;
                    }
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("bridge connected to broker");
                            for filter in BRIDGE_SUBSCRIPTIONS {
                                if let Err(e) = client.try_subscribe(filter, QoS::AtMostOnce) {
                                    warn!(filter, error = %e, "bridge subscribe failed");
                                }
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            bridge.on_message(&publish.topic, publish.payload);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "bridge link lost, retrying in {}s", RECONNECT_DELAY.as_secs());
                            tokio::select! {
                                _ = shutdown.recv() => break,
                                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                            }
                        }
                    }
                }
            }
            debug!("bridge link stopped");
        })
    }
}

#[async_trait]
impl Publisher for MqttLink {
    async fn publish(&self, topic: &str, payload: Bytes) -> BumperResult<()> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| BumperError::Mqtt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::broker::{self, tests::RecordingPlugin, Broker};
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn free_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    /// Device side of scenario B: a plain rumqttc client that answers every
    /// command addressed to it.
    fn spawn_device(addr: SocketAddr) -> JoinHandle<()> {
        tokio::spawn(async move {
            let options = MqttOptions::new("E0001@ls1ok3/wC3g", addr.ip().to_string(), addr.port());
            let (client, mut eventloop) = AsyncClient::new(options, 16);
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        client
                            .try_subscribe("iot/p2p/+/+/+/+/E0001/ls1ok3/wC3g/q/+/+", QoS::AtMostOnce)
                            .unwrap();
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let seg: Vec<&str> = p.topic.split('/').collect();
                        let reply = format!(
                            "iot/p2p/{}/E0001/ls1ok3/wC3g/{}/{}/{}/p/{}/j",
                            seg[2], seg[3], seg[4], seg[5], seg[10]
                        );
                        client
                            .try_publish(reply, QoS::AtMostOnce, false, br#"{"ret":"ok","ver":"0.13.0"}"#.to_vec())
                            .unwrap();
                    }
                    Ok(_) => {}
                    Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
                }
            }
        })
    }

    #[tokio::test]
    async fn command_reaches_device_and_reply_returns() {
        let addr = free_port().await;
        let broker = Broker::new(Arc::new(RecordingPlugin::default()));
        let (shutdown, _) = broadcast::channel(1);
        broker::start_listener(broker.clone(), addr, None, shutdown.clone())
            .await
            .unwrap();

        let (link, eventloop) = MqttLink::new(&addr.ip().to_string(), addr.port());
        let bridge = Arc::new(CommandBridge::new(Arc::new(link.clone()), Duration::from_secs(5)));
        link.spawn(eventloop, bridge.clone(), shutdown.subscribe());
        let device = spawn_device(addr);

        // Wait until both clients have subscribed.
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker
                .publish("iot/p2p/hello/x/y/z/E0001/ls1ok3/wC3g/q/none/j", Bytes::new())
                .await
                == 0
                || broker
                    .publish("iot/p2p/hello/x/y/z/bridge/bumper/bridge/p/none/j", Bytes::new())
                    .await
                    == 0
            {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let envelope = bridge
            .send_command("GetWKVer", "E0001", "ls1ok3", "wC3g", "j", &json!({}), Some("iCmu".into()))
            .await;
        assert_eq!(
            envelope,
            json!({ "id": "iCmu", "ret": "ok", "resp": { "ret": "ok", "ver": "0.13.0" } })
        );

        device.abort();
        shutdown.send(()).unwrap();
    }
}
