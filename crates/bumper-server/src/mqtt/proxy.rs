//! Live mirror of a device's MQTT session on the vendor broker.
//!
//! Commands the vendor sends to a device arrive on the upstream session,
//! get their sender swapped for [`PROXY_SENTINEL`] and are published
//! locally. The device's reply is addressed to the sentinel, so the plugin
//! can restore the real sender from the request id and forward it upstream.

use super::broker::{Delivery, Injector};
use crate::resolver::UpstreamResolver;
use async_trait::async_trait;
use bumper_core::topic::{replace_segment, segment, SEG_RECIPIENT, SEG_REQUEST_ID, SEG_SENDER};
use bumper_core::{BumperError, BumperResult, ExpiringMap};
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Stand-in sender for messages relayed from the vendor broker.
pub const PROXY_SENTINEL: &str = "proxyhelper";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Request id to vendor-side sender.
pub struct ProxyMapper {
    inner: Mutex<ExpiringMap<String>>,
}

impl ProxyMapper {
    /// Holds `timeout²` entries, each living `timeout × 1.1`.
    pub fn new(timeout: Duration) -> Self {
        let secs = timeout.as_secs().max(1) as usize;
        Self {
            inner: Mutex::new(ExpiringMap::new(secs * secs, timeout.mul_f64(1.1))),
        }
    }

    pub fn record(&self, request_id: &str, sender: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for (key, _) in map.upsert(request_id, sender.to_string()) {
            debug!(request_id = %key, "proxy mapping evicted");
        }
    }

    pub fn take(&self, request_id: &str) -> Option<String> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).remove(request_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Topic to publish locally for a message from the vendor broker, or `None`
/// when it must be dropped.
pub fn rewrite_inbound(mapper: &ProxyMapper, topic: &str) -> Option<String> {
    if segment(topic, 1) != Some("p2p") {
        return Some(topic.to_string());
    }
    let sender = segment(topic, SEG_SENDER)?;
    if sender == PROXY_SENTINEL {
        error!(topic, "vendor message already carries the proxy sentinel");
        return None;
    }
    let request_id = segment(topic, SEG_REQUEST_ID)?;
    mapper.record(request_id, sender);
    let local = replace_segment(topic, SEG_SENDER, PROXY_SENTINEL).ok()?;
    info!(from = topic, to = %local, "converted vendor topic");
    Some(local)
}

/// What to do with a device publish in proxy mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Relayed from the vendor; do not send it back.
    Drop,
    /// A reply to the sentinel whose request id is no longer known.
    Unmapped(String),
    Forward(String),
}

pub fn rewrite_outbound(mapper: &ProxyMapper, topic: &str) -> Outbound {
    if segment(topic, SEG_SENDER) == Some(PROXY_SENTINEL) {
        return Outbound::Drop;
    }
    if segment(topic, SEG_RECIPIENT) != Some(PROXY_SENTINEL) {
        return Outbound::Forward(topic.to_string());
    }
    let request_id = segment(topic, SEG_REQUEST_ID).unwrap_or_default();
    match mapper.take(request_id) {
        Some(sender) => match replace_segment(topic, SEG_RECIPIENT, &sender) {
            Ok(restored) => Outbound::Forward(restored),
            Err(_) => Outbound::Unmapped(request_id.to_string()),
        },
        None => Outbound::Unmapped(request_id.to_string()),
    }
}

/// A device's session on the vendor broker.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn subscribe(&self, filter: &str) -> BumperResult<()>;
    async fn publish(&self, topic: &str, payload: Bytes) -> BumperResult<()>;
    async fn disconnect(&self);
    fn mapper(&self) -> &ProxyMapper;
}

/// Opens upstream sessions on behalf of devices.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, client_id: &str, username: &str, password: &str) -> BumperResult<Arc<dyn Upstream>>;
}

/// Connects to the vendor broker over TLS.
pub struct VendorConnector {
    resolver: UpstreamResolver,
    domain: String,
    port: u16,
    timeout: Duration,
    injector: Injector,
}

impl VendorConnector {
    pub fn new(resolver: UpstreamResolver, domain: String, port: u16, timeout: Duration, injector: Injector) -> Self {
        Self {
            resolver,
            domain,
            port,
            timeout,
            injector,
        }
    }
}

#[async_trait]
impl UpstreamConnector for VendorConnector {
    async fn connect(&self, client_id: &str, username: &str, password: &str) -> BumperResult<Arc<dyn Upstream>> {
        let addr = self.resolver.resolve(&self.domain, self.port).await?;
        info!(client_id, server = %addr, "opening upstream mirror");

        let tls = crate::tls::upstream_client_config()?;
        let mut options = MqttOptions::new(client_id, addr.ip().to_string(), addr.port());
        options.set_credentials(username, password);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(tls))));

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        wait_for_connack(&mut eventloop, client_id).await?;

        let mapper = Arc::new(ProxyMapper::new(self.timeout));
        let alive = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(pump(
            eventloop,
            client_id.to_string(),
            mapper.clone(),
            alive.clone(),
            self.injector.clone(),
        ));
        Ok(Arc::new(ProxyClient {
            client_id: client_id.to_string(),
            client,
            mapper,
            alive,
            task,
        }))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop, client_id: &str) -> BumperResult<()> {
    let handshake = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(BumperError::Mqtt(format!("upstream connect for {client_id}: {e}"))),
            }
        }
    };
    tokio::time::timeout(CONNECT_TIMEOUT, handshake)
        .await
        .map_err(|_| BumperError::Timeout)?
}

/// Drive the upstream event loop, relaying vendor publishes locally. The
/// first connection error ends the mirror.
async fn pump(
    mut eventloop: EventLoop,
    client_id: String,
    mapper: Arc<ProxyMapper>,
    alive: Arc<AtomicBool>,
    injector: Injector,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(client_id = %client_id, topic = %publish.topic, "message from vendor");
                let Some(topic) = rewrite_inbound(&mapper, &publish.topic) else {
                    continue;
                };
                let delivery = Delivery {
                    topic,
                    payload: publish.payload,
                };
                if injector.send(delivery).is_err() {
                    warn!(client_id = %client_id, "broker gone, stopping upstream mirror");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "upstream mirror lost");
                break;
            }
        }
    }
    alive.store(false, Ordering::Release);
}

pub struct ProxyClient {
    client_id: String,
    client: AsyncClient,
    mapper: Arc<ProxyMapper>,
    alive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ProxyClient {
    fn ensure_alive(&self) -> BumperResult<()> {
        if self.alive.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BumperError::Mqtt(format!("upstream mirror for {} is down", self.client_id)))
        }
    }
}

#[async_trait]
impl Upstream for ProxyClient {
    async fn subscribe(&self, filter: &str) -> BumperResult<()> {
        self.ensure_alive()?;
        self.client
            .subscribe(filter, QoS::AtMostOnce)
            .await
            .map_err(|e| BumperError::Mqtt(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BumperResult<()> {
        self.ensure_alive()?;
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| BumperError::Mqtt(e.to_string()))
    }

    async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(client_id = %self.client_id, error = %e, "upstream disconnect");
        }
        self.task.abort();
        self.alive.store(false, Ordering::Release);
    }

    fn mapper(&self) -> &ProxyMapper {
        &self.mapper
    }
}
