//! Embedded MQTT 3.1.1 broker.
//!
//! Just enough broker for the device fleet: CONNECT with a plugin-driven
//! authentication step, PUBLISH at QoS 0/1, SUBSCRIBE/UNSUBSCRIBE with `+`/`#`
//! filters, PINGREQ and DISCONNECT. Subscribers always receive QoS 0.
//! Nothing is retained or persisted.

use async_trait::async_trait;
use bumper_core::topic::filter_matches;
use bumper_core::{BumperError, BumperResult};
use bytes::{Bytes, BytesMut};
use rumqttc::mqttbytes::v4::{
    ConnAck, ConnectReturnCode, Packet, PubAck, Publish, SubAck, SubscribeReasonCode, UnsubAck,
};
use rumqttc::mqttbytes::{self, QoS};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace, warn};

const MAX_PACKET_SIZE: usize = 256 * 1024;
const OUTBOUND_QUEUE: usize = 256;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle hooks the broker runs for every client.
#[async_trait]
pub trait BrokerPlugin: Send + Sync {
    /// Decide whether a CONNECT is accepted.
    async fn authenticate(&self, client_id: &str, username: Option<&str>, password: Option<&str>) -> bool;

    async fn on_connected(&self, client_id: &str);

    async fn on_subscribe(&self, client_id: &str, filter: &str);

    /// Inspect a publish from a client. Returning `false` keeps it from
    /// being delivered to local subscribers.
    async fn on_message_received(&self, client_id: &str, topic: &str, payload: &Bytes) -> bool;

    async fn on_disconnected(&self, client_id: &str);
}

/// A publish injected from inside the process, bypassing the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
}

/// Sender half used by components that publish into the broker.
pub type Injector = mpsc::UnboundedSender<Delivery>;

struct ClientEntry {
    conn_id: u64,
    tx: mpsc::Sender<Delivery>,
    filters: Vec<String>,
}

pub struct Broker {
    plugin: Arc<dyn BrokerPlugin>,
    clients: RwLock<HashMap<String, ClientEntry>>,
    next_conn_id: AtomicU64,
}

impl Broker {
    pub fn new(plugin: Arc<dyn BrokerPlugin>) -> Arc<Self> {
        Arc::new(Self {
            plugin,
            clients: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Deliver a message to every subscriber whose filter matches.
    pub async fn publish(&self, topic: &str, payload: Bytes) -> usize {
        let clients = self.clients.read().await;
        let mut delivered = 0;
        for (client_id, entry) in clients.iter() {
            if !entry.filters.iter().any(|f| filter_matches(f, topic)) {
                continue;
            }
            let delivery = Delivery {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            match entry.tx.try_send(delivery) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(client_id = %client_id, topic, "subscriber queue full, message dropped"),
            }
        }
        trace!(topic, delivered, "routed");
        delivered
    }

    /// Drain injected messages into [`Broker::publish`] until shutdown.
    pub fn spawn_injector(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Delivery>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    delivery = rx.recv() => match delivery {
                        Some(d) => {
                            broker.publish(&d.topic, d.payload).await;
                        }
                        None => break,
                    },
                }
            }
        })
    }

    /// Serve one client from CONNECT to disconnect.
    pub async fn handle_connection<S>(
        self: Arc<Self>,
        stream: S,
        peer: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) -> BumperResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(4096);

        let connect = match tokio::time::timeout(CONNECT_TIMEOUT, read_packet(&mut reader, &mut read_buf)).await {
            Ok(Ok(Packet::Connect(connect))) => connect,
            Ok(Ok(other)) => {
                return Err(BumperError::Mqtt(format!("expected CONNECT, got {other:?}")));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(BumperError::Timeout),
        };

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let client_id = if connect.client_id.is_empty() {
            format!("anonymous-{conn_id}")
        } else {
            connect.client_id.clone()
        };
        let username = connect.login.as_ref().map(|l| l.username.as_str());
        let password = connect.login.as_ref().map(|l| l.password.as_str());

        if !self.plugin.authenticate(&client_id, username, password).await {
            warn!(client_id = %client_id, peer = %peer, "mqtt connection refused");
            write_packet(&mut writer, Packet::ConnAck(connack(ConnectReturnCode::NotAuthorized))).await?;
            return Err(BumperError::AuthFailed(client_id));
        }
        write_packet(&mut writer, Packet::ConnAck(connack(ConnectReturnCode::Success))).await?;

        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);
        // Dropping the replaced entry closes the old connection's queue.
        let replaced = self
            .clients
            .write()
            .await
            .insert(
                client_id.clone(),
                ClientEntry {
                    conn_id,
                    tx,
                    filters: Vec::new(),
                },
            )
            .is_some();
        if replaced {
            info!(client_id = %client_id, "client id taken over by new connection");
        }
        info!(client_id = %client_id, peer = %peer, keep_alive = connect.keep_alive, "mqtt client connected");
        self.plugin.on_connected(&client_id).await;

        // 1.5x the negotiated keep-alive; zero disables the check.
        let idle_limit = (connect.keep_alive > 0)
            .then(|| Duration::from_millis(u64::from(connect.keep_alive) * 1500));

        let result = loop {
            let idle = async {
                match idle_limit {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = shutdown.recv() => break Ok(()),
                delivery = rx.recv() => match delivery {
                    Some(d) => {
                        let publish = Publish::new(d.topic, QoS::AtMostOnce, d.payload.to_vec());
                        if let Err(e) = write_packet(&mut writer, Packet::Publish(publish)).await {
                            break Err(e);
                        }
                    }
                    // Replaced by a newer connection with the same id.
                    None => break Ok(()),
                },
                packet = read_packet(&mut reader, &mut read_buf) => match packet {
                    Ok(Packet::Disconnect) => break Ok(()),
                    Ok(packet) => {
                        if let Err(e) = self.handle_packet(&client_id, conn_id, packet, &mut writer).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e),
                },
                _ = idle => {
                    warn!(client_id = %client_id, "keep-alive expired");
                    break Err(BumperError::Timeout);
                }
            }
        };

        let removed = self.cleanup(&client_id, conn_id).await;
        if removed {
            self.plugin.on_disconnected(&client_id).await;
        }
        info!(client_id = %client_id, "mqtt client disconnected");
        result
    }

    async fn handle_packet<W>(&self, client_id: &str, conn_id: u64, packet: Packet, writer: &mut W) -> BumperResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        match packet {
            Packet::Publish(publish) => {
                if publish.qos == QoS::AtLeastOnce {
                    write_packet(writer, Packet::PubAck(PubAck::new(publish.pkid))).await?;
                } else if publish.qos == QoS::ExactlyOnce {
                    warn!(client_id, topic = %publish.topic, "QoS 2 publish not supported, dropped");
                    return Ok(());
                }
                if self
                    .plugin
                    .on_message_received(client_id, &publish.topic, &publish.payload)
                    .await
                {
                    self.publish(&publish.topic, publish.payload).await;
                }
            }
            Packet::Subscribe(subscribe) => {
                let mut return_codes = Vec::with_capacity(subscribe.filters.len());
                for filter in &subscribe.filters {
                    let granted = match filter.qos {
                        QoS::AtMostOnce => QoS::AtMostOnce,
                        _ => QoS::AtLeastOnce,
                    };
                    return_codes.push(SubscribeReasonCode::Success(granted));
                    self.add_filter(client_id, conn_id, &filter.path).await;
                    debug!(client_id, filter = %filter.path, "subscribed");
                    self.plugin.on_subscribe(client_id, &filter.path).await;
                }
                write_packet(writer, Packet::SubAck(SubAck::new(subscribe.pkid, return_codes))).await?;
            }
            Packet::Unsubscribe(unsubscribe) => {
                {
                    let mut clients = self.clients.write().await;
                    if let Some(entry) = clients.get_mut(client_id).filter(|e| e.conn_id == conn_id) {
                        entry.filters.retain(|f| !unsubscribe.topics.contains(f));
                    }
                }
                write_packet(writer, Packet::UnsubAck(UnsubAck::new(unsubscribe.pkid))).await?;
            }
            Packet::PingReq => write_packet(writer, Packet::PingResp).await?,
            Packet::PubAck(_) => {}
            other => debug!(client_id, packet = ?other, "unhandled packet"),
        }
        Ok(())
    }

    async fn add_filter(&self, client_id: &str, conn_id: u64, filter: &str) {
        let mut clients = self.clients.write().await;
        if let Some(entry) = clients.get_mut(client_id).filter(|e| e.conn_id == conn_id) {
            if !entry.filters.iter().any(|f| f == filter) {
                entry.filters.push(filter.to_string());
            }
        }
    }

    /// Remove the client unless a newer connection already took its id.
    async fn cleanup(&self, client_id: &str, conn_id: u64) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get(client_id) {
            Some(entry) if entry.conn_id == conn_id => {
                clients.remove(client_id);
                true
            }
            _ => false,
        }
    }
}

fn connack(code: ConnectReturnCode) -> ConnAck {
    ConnAck {
        session_present: false,
        code,
    }
}

async fn read_packet<R>(reader: &mut R, buf: &mut BytesMut) -> BumperResult<Packet>
where
    R: AsyncRead + Unpin,
{
    loop {
        match Packet::read(buf, MAX_PACKET_SIZE) {
            Ok(packet) => return Ok(packet),
            Err(mqttbytes::Error::InsufficientBytes(_)) => {}
            Err(e) => return Err(BumperError::Mqtt(e.to_string())),
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(BumperError::Transport("connection closed".into()));
        }
    }
}

async fn write_packet<W>(writer: &mut W, packet: Packet) -> BumperResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    packet
        .write(&mut out, MAX_PACKET_SIZE)
        .map_err(|e| BumperError::Mqtt(e.to_string()))?;
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

/// Bind a listener and serve clients until shutdown. With an acceptor every
/// connection is wrapped in TLS first.
pub async fn start_listener(
    broker: Arc<Broker>,
    bind_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    shutdown: broadcast::Sender<()>,
) -> BumperResult<JoinHandle<()>> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| BumperError::Transport(format!("mqtt bind {bind_addr} failed: {e}")))?;
    info!(addr = %bind_addr, tls = tls.is_some(), "mqtt listener started");

    let mut stop = shutdown.subscribe();
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let broker = broker.clone();
                        let tls = tls.clone();
                        let conn_shutdown = shutdown.subscribe();
                        tokio::spawn(async move {
                            let result = match tls {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(stream) => broker.handle_connection(stream, peer, conn_shutdown).await,
                                    Err(e) => Err(BumperError::Transport(format!("tls handshake: {e}"))),
                                },
                                None => broker.handle_connection(stream, peer, conn_shutdown).await,
                            };
                            if let Err(e) = result {
                                debug!(peer = %peer, error = %e, "mqtt connection ended");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "TCP accept failed"),
                }
            }
        }
        info!(addr = %bind_addr, "mqtt listener stopped");
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rumqttc::mqttbytes::v4::{Connect, Login, Subscribe, SubscribeFilter};
    use std::sync::Mutex;
    use tokio::io::{duplex, DuplexStream};

    /// Plugin that records hook calls and rejects one client id.
    #[derive(Default)]
    pub(crate) struct RecordingPlugin {
        pub events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BrokerPlugin for RecordingPlugin {
        async fn authenticate(&self, client_id: &str, _: Option<&str>, _: Option<&str>) -> bool {
            client_id != "intruder"
        }
        async fn on_connected(&self, client_id: &str) {
            self.events.lock().unwrap().push(format!("connected {client_id}"));
        }
        async fn on_subscribe(&self, client_id: &str, filter: &str) {
            self.events.lock().unwrap().push(format!("subscribe {client_id} {filter}"));
        }
        async fn on_message_received(&self, client_id: &str, topic: &str, _: &Bytes) -> bool {
            self.events.lock().unwrap().push(format!("message {client_id} {topic}"));
            !topic.starts_with("blocked")
        }
        async fn on_disconnected(&self, client_id: &str) {
            self.events.lock().unwrap().push(format!("disconnected {client_id}"));
        }
    }

    struct Client {
        io: DuplexStream,
        buf: BytesMut,
    }

    impl Client {
        async fn send(&mut self, packet: Packet) {
            write_packet(&mut self.io, packet).await.unwrap();
        }

        async fn recv(&mut self) -> Packet {
            tokio::time::timeout(Duration::from_secs(5), read_packet(&mut self.io, &mut self.buf))
                .await
                .expect("timed out waiting for packet")
                .unwrap()
        }
    }

    fn connect_packet(client_id: &str) -> Packet {
        let mut connect = Connect::new(client_id);
        connect.keep_alive = 30;
        connect.login = Some(Login::new("user", "pass"));
        Packet::Connect(connect)
    }

    async fn open(broker: &Arc<Broker>, shutdown: &broadcast::Sender<()>, client_id: &str) -> (Client, JoinHandle<BumperResult<()>>) {
        let (server_io, client_io) = duplex(64 * 1024);
        let task = tokio::spawn(broker.clone().handle_connection(
            server_io,
            "127.0.0.1:40000".parse().unwrap(),
            shutdown.subscribe(),
        ));
        let mut client = Client {
            io: client_io,
            buf: BytesMut::new(),
        };
        client.send(connect_packet(client_id)).await;
        (client, task)
    }

    async fn subscribe(client: &mut Client, filter: &str) {
        client
            .send(Packet::Subscribe(Subscribe {
                pkid: 1,
                filters: vec![SubscribeFilter::new(filter.to_string(), QoS::AtLeastOnce)],
            }))
            .await;
        match client.recv().await {
            Packet::SubAck(ack) => assert_eq!(ack.return_codes, vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]),
            other => panic!("expected SUBACK, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_client_gets_not_authorized() {
        let plugin = Arc::new(RecordingPlugin::default());
        let broker = Broker::new(plugin.clone());
        let (shutdown, _) = broadcast::channel(1);
        let (mut client, task) = open(&broker, &shutdown, "intruder").await;
        match client.recv().await {
            Packet::ConnAck(ack) => assert_eq!(ack.code, ConnectReturnCode::NotAuthorized),
            other => panic!("expected CONNACK, got {other:?}"),
        }
        assert!(matches!(task.await.unwrap(), Err(BumperError::AuthFailed(_))));
        assert!(plugin.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_fans_out_to_matching_filters() {
        let plugin = Arc::new(RecordingPlugin::default());
        let broker = Broker::new(plugin.clone());
        let (shutdown, _) = broadcast::channel(1);

        let (mut sub, _sub_task) = open(&broker, &shutdown, "bridge@bumper/bridge").await;
        assert!(matches!(sub.recv().await, Packet::ConnAck(_)));
        subscribe(&mut sub, "iot/atr/+/+/+/+/+").await;

        let (mut device, device_task) = open(&broker, &shutdown, "E0001@ls1ok3/wC3g").await;
        assert!(matches!(device.recv().await, Packet::ConnAck(_)));

        let topic = "iot/atr/onStats/E0001/ls1ok3/wC3g/j";
        let mut publish = Publish::new(topic, QoS::AtLeastOnce, b"{\"a\":1}".to_vec());
        publish.pkid = 7;
        device.send(Packet::Publish(publish)).await;
        match device.recv().await {
            Packet::PubAck(ack) => assert_eq!(ack.pkid, 7),
            other => panic!("expected PUBACK, got {other:?}"),
        }
        match sub.recv().await {
            Packet::Publish(p) => {
                assert_eq!(p.topic, topic);
                assert_eq!(&p.payload[..], b"{\"a\":1}");
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }

        // Vetoed by the plugin: acknowledged but not routed.
        device
            .send(Packet::Publish(Publish::new("blocked/x", QoS::AtMostOnce, b"x".to_vec())))
            .await;
        device.send(Packet::PingReq).await;
        assert!(matches!(device.recv().await, Packet::PingResp));

        device.send(Packet::Disconnect).await;
        device_task.await.unwrap().unwrap();
        assert_eq!(broker.client_count().await, 1);

        let events = plugin.events.lock().unwrap().clone();
        assert!(events.contains(&"subscribe bridge@bumper/bridge iot/atr/+/+/+/+/+".to_string()));
        assert!(events.contains(&format!("message E0001@ls1ok3/wC3g {topic}")));
        assert!(events.contains(&"disconnected E0001@ls1ok3/wC3g".to_string()));
    }

    #[tokio::test]
    async fn injected_messages_reach_subscribers() {
        let broker = Broker::new(Arc::new(RecordingPlugin::default()));
        let (shutdown, _) = broadcast::channel(1);
        let (inject, rx) = mpsc::unbounded_channel();
        broker.spawn_injector(rx, shutdown.subscribe());

        let (mut device, _task) = open(&broker, &shutdown, "E0001@ls1ok3/wC3g").await;
        assert!(matches!(device.recv().await, Packet::ConnAck(_)));
        subscribe(&mut device, "iot/p2p/+/+/+/+/E0001/ls1ok3/wC3g/#").await;

        let topic = "iot/p2p/GetWKVer/proxyhelper/ecouser/res/E0001/ls1ok3/wC3g/q/iCmu/j";
        inject
            .send(Delivery {
                topic: topic.into(),
                payload: Bytes::from_static(b"{}"),
            })
            .unwrap();
        match device.recv().await {
            Packet::Publish(p) => assert_eq!(p.topic, topic),
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsubscribe_and_shutdown() {
        let plugin = Arc::new(RecordingPlugin::default());
        let broker = Broker::new(plugin.clone());
        let (shutdown, _) = broadcast::channel(1);
        let (mut client, task) = open(&broker, &shutdown, "fuid_1@ecouser/IOS1").await;
        assert!(matches!(client.recv().await, Packet::ConnAck(_)));
        subscribe(&mut client, "iot/atr/#").await;

        client
            .send(Packet::Unsubscribe(rumqttc::mqttbytes::v4::Unsubscribe {
                pkid: 2,
                topics: vec!["iot/atr/#".into()],
            }))
            .await;
        assert!(matches!(client.recv().await, Packet::UnsubAck(_)));
        assert_eq!(broker.publish("iot/atr/onStats/E0001/ls1ok3/wC3g/j", Bytes::new()).await, 0);

        shutdown.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(broker.client_count().await, 0);
        assert!(plugin
            .events
            .lock()
            .unwrap()
            .contains(&"disconnected fuid_1@ecouser/IOS1".to_string()));
    }

    #[tokio::test]
    async fn takeover_keeps_the_newer_connection() {
        let plugin = Arc::new(RecordingPlugin::default());
        let broker = Broker::new(plugin.clone());
        let (shutdown, _) = broadcast::channel(1);

        let (mut first, first_task) = open(&broker, &shutdown, "E0001@ls1ok3/wC3g").await;
        assert!(matches!(first.recv().await, Packet::ConnAck(_)));
        subscribe(&mut first, "t/#").await;
        let (mut second, _second_task) = open(&broker, &shutdown, "E0001@ls1ok3/wC3g").await;
        assert!(matches!(second.recv().await, Packet::ConnAck(_)));

        // The old connection ends straight away, well before its keep-alive.
        tokio::time::timeout(Duration::from_secs(2), first_task)
            .await
            .expect("replaced connection kept running")
            .unwrap()
            .unwrap();
        assert!(read_packet(&mut first.io, &mut first.buf).await.is_err());
        assert_eq!(broker.client_count().await, 1);

        subscribe(&mut second, "t/#").await;
        assert_eq!(broker.publish("t/x", Bytes::from_static(b"hi")).await, 1);
        match second.recv().await {
            Packet::Publish(p) => assert_eq!(p.topic, "t/x"),
            other => panic!("expected PUBLISH, got {other:?}"),
        }
        assert!(!plugin
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.starts_with("disconnected")));
    }
}
