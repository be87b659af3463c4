//! One legacy client connection: read loop, handshake and teardown.

use super::handshake::{
    auth_features, bind_features, bind_result, empty_result, generate_stream_id, keepalive_ping,
    sasl_failure, sasl_success, stream_header, tls_failure, tls_proceed, STREAM_CLOSE,
};
use super::routing::{Action, Origin, Router};
use super::session::{SessionState, StanzaSession};
use super::transport::Transport;
use crate::connections::{ConnectionManager, PeerHandle};
use bumper_core::identity::{
    app_address, device_address, device_class_from_host, AppIdentity, DeviceIdentity,
    COMPANY_LEGACY, DEVICE_RESOURCE,
};
use bumper_core::sasl::decode_plain;
use bumper_core::stanza::{NS_CLIENT, NS_SASL};
use bumper_core::{
    AuthCodeVerifier, BumperError, BumperResult, ConnectionRegistry, Decoded, Element, LinkKind,
    PrincipalKind, StanzaDecoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, trace, warn};

const READ_BUFFER: usize = 8192;
/// Realm recorded for apps on the legacy protocol.
const LEGACY_APP_REALM: &str = "ecouser";

/// Shared by every legacy connection.
pub struct XmppContext {
    pub registry: Arc<dyn ConnectionRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub auth_codes: Arc<dyn AuthCodeVerifier>,
    pub router: Router,
    pub tls: Option<TlsAcceptor>,
    pub use_auth: bool,
    pub keepalive: Duration,
}

pub struct XmppConnection<S> {
    ctx: Arc<XmppContext>,
    conn_id: u64,
    peer: SocketAddr,
    session: StanzaSession,
    transport: Transport<S>,
    decoder: StanzaDecoder,
    /// Bytes of a UTF-8 sequence split across reads.
    inbound: Vec<u8>,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    keepalive: Option<JoinHandle<()>>,
    torn_down: bool,
}

impl<S> XmppConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ctx: Arc<XmppContext>, stream: S, peer: SocketAddr) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            conn_id: ctx.connections.next_conn_id(),
            ctx,
            peer,
            session: StanzaSession::accepted(),
            transport: Transport::Plain(stream),
            decoder: StanzaDecoder::new(),
            inbound: Vec::new(),
            outbound_tx,
            outbound_rx,
            keepalive: None,
            torn_down: false,
        }
    }

    /// Serve the connection until the peer leaves, the session ends or the
    /// server shuts down.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(conn_id = self.conn_id, peer = %self.peer, "xmpp connection accepted");
        let mut buf = vec![0u8; READ_BUFFER];

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let _ = self.write(STREAM_CLOSE).await;
                    break;
                }
                Some(out) = self.outbound_rx.recv() => {
                    if let Err(e) = self.write(&out).await {
                        debug!(conn_id = self.conn_id, error = %e, "write failed");
                        break;
                    }
                }
                read = self.transport.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(conn_id = self.conn_id, "peer closed connection");
                        break;
                    }
                    Ok(n) => {
                        let chunk = self.take_text(&buf[..n]);
                        self.handle_chunk(&chunk).await;
                        if self.session.state() == SessionState::Disconnect {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(conn_id = self.conn_id, error = %e, "read failed");
                        break;
                    }
                }
            }
        }

        self.teardown().await;
    }

    /// Append bytes and return the longest complete UTF-8 prefix.
    fn take_text(&mut self, bytes: &[u8]) -> String {
        self.inbound.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.inbound) {
            Ok(s) => s.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.inbound.len(),
        };
        let text = String::from_utf8_lossy(&self.inbound[..valid]).into_owned();
        self.inbound.drain(..valid);
        text
    }

    async fn handle_chunk(&mut self, chunk: &str) {
        trace!(conn_id = self.conn_id, data = chunk, "received");
        match self.decoder.feed(chunk) {
            Err(e) => {
                warn!(conn_id = self.conn_id, error = %e, fragment = chunk, "dropping unparseable data");
            }
            Ok(Decoded::Pending) => {
                debug!(conn_id = self.conn_id, pending = self.decoder.pending(), "partial stanza buffered");
            }
            Ok(Decoded::StreamClosed) => {
                debug!(conn_id = self.conn_id, "stream closed by peer");
                let _ = self.write(STREAM_CLOSE).await;
                self.disconnect();
            }
            Ok(Decoded::Stanzas(stanzas)) => {
                for stanza in &stanzas {
                    if let Err(e) = self.handle_element(stanza).await {
                        match e {
                            BumperError::ProtocolViolation { .. }
                            | BumperError::Transport(_)
                            | BumperError::Io(_) => {
                                warn!(conn_id = self.conn_id, error = %e, "closing connection");
                                self.disconnect();
                            }
                            _ => warn!(conn_id = self.conn_id, error = %e, "stanza rejected"),
                        }
                    }
                    // Anything after starttls in the same read predates the upgrade.
                    if self.session.state() == SessionState::Disconnect || stanza.name == "starttls" {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_element(&mut self, el: &Element) -> BumperResult<()> {
        match el.name.as_str() {
            "stream" if el.prefix.as_deref() == Some("stream") => self.stream_open(el).await,
            "starttls" => self.starttls().await,
            "auth" if el.is("auth", Some(NS_SASL)) => self.auth(el).await,
            "iq" => match el.first_element().map(|c| c.name.as_str()) {
                Some("bind") => self.bind(el).await,
                Some("session") => self.start_session(el).await,
                _ => self.route(el).await,
            },
            "presence" => self.route(el).await,
            other => {
                debug!(conn_id = self.conn_id, element = other, "unhandled element");
                Ok(())
            }
        }
    }

    async fn stream_open(&mut self, el: &Element) -> BumperResult<()> {
        let state = self.session.state();
        if !matches!(state, SessionState::Connect | SessionState::Init) {
            debug!(conn_id = self.conn_id, %state, "ignoring stream restart");
            return Ok(());
        }
        if el.default_ns.as_deref() != Some(NS_CLIENT) {
            warn!(conn_id = self.conn_id, ns = ?el.default_ns, "stream is not jabber:client");
            self.write(STREAM_CLOSE).await?;
            self.disconnect();
            return Ok(());
        }

        let header = stream_header(&generate_stream_id());
        if state == SessionState::Connect {
            if let Some(class) = el.attr("to").and_then(device_class_from_host) {
                self.session.device_class = Some(class.to_string());
            }
            // Without an acceptor there is nothing to upgrade to.
            let upgraded = self.session.tls_upgraded() || self.ctx.tls.is_none();
            self.write(&format!("{header}{}", auth_features(upgraded))).await
        } else {
            self.write(&format!("{header}{}", bind_features())).await
        }
    }

    async fn starttls(&mut self) -> BumperResult<()> {
        if self.session.tls_upgraded() {
            warn!(conn_id = self.conn_id, "repeated starttls ignored");
            return Ok(());
        }
        let Some(acceptor) = self.ctx.tls.clone() else {
            warn!(conn_id = self.conn_id, "starttls requested but no certificate is configured");
            self.write(&tls_failure()).await?;
            self.disconnect();
            return Ok(());
        };

        self.write(&tls_proceed()).await?;
        self.session.mark_tls_upgraded();
        self.decoder.reset();
        self.inbound.clear();
        self.transport.upgrade(&acceptor).await?;
        info!(conn_id = self.conn_id, peer = %self.peer, "connection upgraded to tls");
        Ok(())
    }

    async fn auth(&mut self, el: &Element) -> BumperResult<()> {
        let creds = match decode_plain(&el.text()) {
            Ok(creds) => creds,
            Err(e) => {
                warn!(conn_id = self.conn_id, error = %e, "invalid sasl payload");
                return self.write(&sasl_failure()).await;
            }
        };

        match self.session.device_class.clone() {
            Some(class) => {
                self.session.transition(SessionState::Init)?;
                self.ctx.registry.register_device(
                    DeviceIdentity {
                        did: creds.user.clone(),
                        class,
                        resource: DEVICE_RESOURCE.to_string(),
                        company: COMPANY_LEGACY.to_string(),
                    },
                    None,
                );
                self.session.authenticate(PrincipalKind::Device, &creds.user, DEVICE_RESOURCE);
            }
            None => {
                let code_ok = !self.ctx.use_auth
                    || self.ctx.auth_codes.verify_auth_code(&creds.user, &creds.auth_code);
                if !code_ok || creds.resource.is_empty() {
                    warn!(
                        conn_id = self.conn_id,
                        user = %creds.user,
                        has_resource = !creds.resource.is_empty(),
                        "app authentication failed"
                    );
                    return self.write(&sasl_failure()).await;
                }
                self.session.transition(SessionState::Init)?;
                self.ctx.registry.register_app(AppIdentity {
                    user_id: creds.user.clone(),
                    realm: LEGACY_APP_REALM.to_string(),
                    resource: creds.resource.clone(),
                });
                self.session.authenticate(PrincipalKind::App, &creds.user, &creds.resource);
            }
        }

        info!(
            conn_id = self.conn_id,
            kind = %self.session.kind,
            principal = %self.session.principal_id,
            "authenticated"
        );
        self.write(&sasl_success()).await
    }

    async fn bind(&mut self, iq: &Element) -> BumperResult<()> {
        if !self.session.is_authenticated() {
            let from = self.session.state().to_string();
            self.disconnect();
            return Err(BumperError::ProtocolViolation {
                from,
                to: SessionState::Bind.to_string(),
            });
        }
        self.session.transition(SessionState::Bind)?;

        let principal = self.session.principal_id.clone();
        let address = match self.session.kind {
            PrincipalKind::Device => {
                device_address(&principal, self.session.device_class.as_deref().unwrap_or_default())
            }
            _ => {
                let requested = iq
                    .first_element()
                    .and_then(|b| b.find("resource"))
                    .map(Element::text)
                    .filter(|r| !r.is_empty());
                let resource = match requested {
                    Some(r) => r,
                    None if !self.session.resource.is_empty() => self.session.resource.clone(),
                    None => self.peer.to_string(),
                };
                app_address(&principal, &resource)
            }
        };
        self.session.assign_address(address.clone())?;

        match self.session.kind {
            PrincipalKind::Device => {
                self.ctx.registry.set_device_connected(&principal, LinkKind::Legacy, true)
            }
            _ => self
                .ctx
                .registry
                .set_app_connected(&self.session.resource, LinkKind::Legacy, true),
        }
        self.ctx
            .connections
            .add(PeerHandle::new(
                self.conn_id,
                self.session.kind,
                principal,
                address.clone(),
                self.outbound_tx.clone(),
            ))
            .await;

        self.write(&bind_result(iq.attr("id").unwrap_or_default(), &address)).await
    }

    async fn start_session(&mut self, iq: &Element) -> BumperResult<()> {
        if self.session.state() < SessionState::Bind {
            let from = self.session.state().to_string();
            self.disconnect();
            return Err(BumperError::ProtocolViolation {
                from,
                to: SessionState::Ready.to_string(),
            });
        }
        self.session.transition(SessionState::Ready)?;
        self.ctx.connections.mark_ready(self.conn_id).await;
        self.write(&empty_result(iq.attr("id").unwrap_or_default())).await?;

        if self.keepalive.is_none() {
            if let Some(address) = self.session.address() {
                self.keepalive = Some(spawn_keepalive(
                    self.outbound_tx.clone(),
                    address.to_string(),
                    self.ctx.keepalive,
                ));
            }
        }
        Ok(())
    }

    async fn route(&mut self, el: &Element) -> BumperResult<()> {
        if self.session.state() != SessionState::Ready {
            debug!(conn_id = self.conn_id, element = %el.name, "dropping stanza before session start");
            return Ok(());
        }
        let address = self.session.address().unwrap_or_default().to_string();
        let origin = Origin {
            conn_id: self.conn_id,
            kind: self.session.kind,
            principal_id: &self.session.principal_id,
            resource: &self.session.resource,
            address: &address,
        };
        let actions = self.ctx.router.route(&origin, el).await;
        self.apply(actions).await
    }

    async fn apply(&mut self, actions: Vec<Action>) -> BumperResult<()> {
        for action in actions {
            match action {
                Action::Reply(stanza) => self.write(&stanza).await?,
                Action::Deliver(peer, stanza) => {
                    if !peer.send(stanza) {
                        debug!(conn_id = self.conn_id, to = %peer.address, "peer went away before delivery");
                    }
                }
                Action::Disconnect => self.disconnect(),
            }
        }
        Ok(())
    }

    async fn write(&mut self, data: &str) -> BumperResult<()> {
        trace!(conn_id = self.conn_id, data, "sending");
        self.transport.write_all(data.as_bytes()).await?;
        self.transport.flush().await?;
        Ok(())
    }

    fn disconnect(&mut self) {
        // Disconnect is reachable from every state.
        let _ = self.session.transition(SessionState::Disconnect);
    }

    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.disconnect();

        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
        match self.session.kind {
            PrincipalKind::Device => self.ctx.registry.set_device_connected(
                &self.session.principal_id,
                LinkKind::Legacy,
                false,
            ),
            PrincipalKind::App if !self.session.resource.is_empty() => self
                .ctx
                .registry
                .set_app_connected(&self.session.resource, LinkKind::Legacy, false),
            _ => {}
        }
        self.ctx.connections.remove(self.conn_id).await;
        let _ = self.transport.shutdown().await;

        info!(
            conn_id = self.conn_id,
            peer = %self.peer,
            address = self.session.address().unwrap_or("-"),
            "xmpp connection closed"
        );
    }
}

fn spawn_keepalive(
    tx: mpsc::UnboundedSender<String>,
    address: String,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // First tick fires at once; the device is pinged as soon as it is ready.
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tx.send(keepalive_ping(&address)).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp::routing::ProvisionPolicy;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bumper_core::{HmacAuthCodes, MemoryRegistry};
    use tokio::io::{duplex, DuplexStream};

    const BOT_STREAM: &str = "<?xml version='1.0'?><stream:stream to='ls1ok3.ecorobot.net' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>";
    const APP_STREAM: &str = "<stream:stream to='ecouser.net' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>";

    struct Harness {
        ctx: Arc<XmppContext>,
        registry: Arc<MemoryRegistry>,
        shutdown: broadcast::Sender<()>,
    }

    impl Harness {
        fn new(use_auth: bool, keepalive: Duration) -> Self {
            let registry = Arc::new(MemoryRegistry::new());
            let connections = Arc::new(ConnectionManager::new());
            let ctx = Arc::new(XmppContext {
                registry: registry.clone(),
                connections: connections.clone(),
                auth_codes: Arc::new(HmacAuthCodes::new(b"test-secret")),
                router: Router::new(
                    connections,
                    ProvisionPolicy {
                        enabled: true,
                        use_auth,
                    },
                ),
                tls: None,
                use_auth,
                keepalive,
            });
            let (shutdown, _) = broadcast::channel(1);
            Self {
                ctx,
                registry,
                shutdown,
            }
        }

        fn connect(&self) -> (DuplexStream, JoinHandle<()>) {
            let (server_io, client_io) = duplex(64 * 1024);
            let conn = XmppConnection::new(self.ctx.clone(), server_io, "127.0.0.1:50000".parse().unwrap());
            let task = tokio::spawn(conn.run(self.shutdown.subscribe()));
            (client_io, task)
        }
    }

    async fn send(client: &mut DuplexStream, data: &str) {
        client.write_all(data.as_bytes()).await.unwrap();
    }

    async fn expect(client: &mut DuplexStream, needle: &str) -> String {
        let mut seen = String::new();
        let mut buf = [0u8; 4096];
        tokio::time::timeout(Duration::from_secs(5), async {
            while !seen.contains(needle) {
                let n = client.read(&mut buf).await.unwrap();
                assert!(n > 0, "closed while waiting for {needle}; got {seen}");
                seen.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {needle}"));
        seen
    }

    fn plain(payload: &str) -> String {
        format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            STANDARD.encode(payload)
        )
    }

    async fn login_device(client: &mut DuplexStream, did: &str) {
        send(client, BOT_STREAM).await;
        let features = expect(client, "</stream:features>").await;
        assert!(features.contains("<mechanism>PLAIN</mechanism>"));
        assert!(!features.contains("starttls"));
        send(client, &plain(&format!("\0{did}\0atom"))).await;
        expect(client, "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").await;
        send(client, BOT_STREAM).await;
        expect(client, "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>").await;
        send(client, "<iq type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>").await;
        expect(client, &format!("<jid>{did}@ls1ok3.ecorobot.net/atom</jid>")).await;
    }

    async fn login_app(client: &mut DuplexStream, user: &str, resource: &str, code: &str) {
        send(client, APP_STREAM).await;
        expect(client, "</stream:features>").await;
        send(client, &plain(&format!("\0{user}\0{resource}/{code}"))).await;
        expect(client, "<success").await;
        send(client, APP_STREAM).await;
        expect(client, "</stream:features>").await;
        send(
            client,
            &format!("<iq type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>{resource}</resource></bind></iq>"),
        )
        .await;
        expect(client, &format!("<jid>{user}@ecouser.net/{resource}</jid>")).await;
    }

    async fn start_session(client: &mut DuplexStream) {
        send(client, "<iq type='set' id='s1'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>").await;
        expect(client, "<iq type='result' id='s1'/>").await;
    }

    #[tokio::test]
    async fn device_bind_marks_registry_connected() {
        let h = Harness::new(false, Duration::from_secs(30));
        let (mut client, task) = h.connect();

        login_device(&mut client, "E0001").await;
        let rec = h.registry.lookup_device_by_id("E0001").unwrap();
        assert!(rec.legacy_connected);
        assert_eq!(rec.company, "eco-legacy");
        assert_eq!(rec.class, "ls1ok3");

        drop(client);
        task.await.unwrap();
        assert!(!h.registry.lookup_device_by_id("E0001").unwrap().legacy_connected);
        assert_eq!(h.ctx.connections.count().await, 0);
    }

    #[tokio::test]
    async fn app_query_reaches_device_with_rewritten_sender() {
        let h = Harness::new(false, Duration::from_secs(30));
        let (mut bot, _bot_task) = h.connect();
        let (mut app, _app_task) = h.connect();

        login_device(&mut bot, "E0001").await;
        start_session(&mut bot).await;
        login_app(&mut app, "fuid_1", "IOS1", "anything").await;
        start_session(&mut app).await;

        send(
            &mut app,
            "<iq type='set' id='c1' to='E0001@ls1ok3.ecorobot.net/atom'><query xmlns='com:ctl'><ctl td='GetCleanState'/></query></iq>",
        )
        .await;
        let relayed = expect(&mut bot, "</iq>").await;
        assert!(relayed.contains("from='fuid_1@ecouser.net/IOS1'"));
        assert!(relayed.contains("<query xmlns='com:ctl'><ctl td='GetCleanState'/></query>"));
        assert!(!relayed.contains("ns0"));

        send(
            &mut bot,
            "<iq type='result' id='c1' to='fuid_1@ecouser.net/IOS1'><query xmlns='com:ctl'><ctl ret='ok'/></query></iq>",
        )
        .await;
        let answer = expect(&mut app, "ret='ok'").await;
        assert!(answer.contains("from='E0001@ls1ok3.ecorobot.net/atom'"));
        assert!(h.registry.lookup_app_by_resource("IOS1").unwrap().legacy_connected);
    }

    #[tokio::test]
    async fn bind_before_auth_disconnects() {
        let h = Harness::new(false, Duration::from_secs(30));
        let (mut client, task) = h.connect();
        send(&mut client, APP_STREAM).await;
        expect(&mut client, "</stream:features>").await;
        send(&mut client, "<iq type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>").await;
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(!String::from_utf8_lossy(&rest).contains("<jid>"));
    }

    #[tokio::test]
    async fn bad_auth_code_keeps_connection_open() {
        let h = Harness::new(true, Duration::from_secs(30));
        let (mut client, _task) = h.connect();
        send(&mut client, APP_STREAM).await;
        expect(&mut client, "</stream:features>").await;
        send(&mut client, &plain("\0fuid_1\0IOS1/not-a-code")).await;
        expect(&mut client, "<not-authorized/>").await;

        let codes = HmacAuthCodes::new(b"test-secret");
        let code = codes.issue("fuid_1", 60);
        send(&mut client, &plain(&format!("\0fuid_1\0IOS1/{code}"))).await;
        expect(&mut client, "<success").await;
    }

    #[tokio::test]
    async fn presence_unavailable_tears_down_once() {
        let h = Harness::new(false, Duration::from_secs(30));
        let (mut client, task) = h.connect();
        login_app(&mut client, "fuid_1", "IOS1", "x").await;
        start_session(&mut client).await;
        assert_eq!(h.ctx.connections.count().await, 1);

        send(&mut client, "<presence type='unavailable'/>").await;
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(h.ctx.connections.count().await, 0);
        assert!(!h.registry.lookup_app_by_resource("IOS1").unwrap().legacy_connected);
    }

    const E0002_PING: &str =
        "<iq from='ecouser.net' to='E0002@ls1ok3.ecorobot.net/atom' id='s2c1' type='get'><ping xmlns='urn:xmpp:ping'/></iq>";

    #[tokio::test]
    async fn keepalive_pings_ready_sessions() {
        let h = Harness::new(false, Duration::from_millis(50));
        let (mut client, _task) = h.connect();
        login_device(&mut client, "E0002").await;
        start_session(&mut client).await;
        expect(&mut client, E0002_PING).await;
        expect(&mut client, E0002_PING).await;
    }

    #[tokio::test]
    async fn first_keepalive_ping_is_immediate() {
        let h = Harness::new(false, Duration::from_secs(30));
        let (mut client, _task) = h.connect();
        login_device(&mut client, "E0002").await;
        let started = tokio::time::Instant::now();
        send(&mut client, "<iq type='set' id='s1'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>").await;
        let seen = expect(&mut client, E0002_PING).await;
        assert!(seen.contains("<iq type='result' id='s1'/>"));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn split_stanzas_and_stream_close() {
        let h = Harness::new(false, Duration::from_secs(30));
        let (mut client, task) = h.connect();
        login_device(&mut client, "E0003").await;
        start_session(&mut client).await;

        send(&mut client, "<iq type='get' id='p1' to='ecouser.net'><ping xmlns=").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        send(&mut client, "'urn:xmpp:ping'/></iq>").await;
        expect(&mut client, "<iq type='result' id='p1' from='ecouser.net'/>").await;

        send(&mut client, "</stream:stream>").await;
        expect(&mut client, "</stream:stream>").await;
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_stream() {
        let h = Harness::new(false, Duration::from_secs(30));
        let (mut client, task) = h.connect();
        send(&mut client, APP_STREAM).await;
        expect(&mut client, "</stream:features>").await;
        h.shutdown.send(()).unwrap();
        expect(&mut client, "</stream:stream>").await;
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn foreign_stream_namespace_is_refused() {
        let h = Harness::new(false, Duration::from_secs(30));
        let (mut client, task) = h.connect();
        send(
            &mut client,
            "<stream:stream to='ecouser.net' xmlns='jabber:server' xmlns:stream='http://etherx.jabber.org/streams'>",
        )
        .await;
        expect(&mut client, "</stream:stream>").await;
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
