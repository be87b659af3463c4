//! Process-level wiring: builds the shared state, starts every listener and
//! the bridge link, and stops them together.

use crate::bridge::{CommandBridge, MqttLink};
use crate::config::ServerConfig;
use crate::connections::ConnectionManager;
use crate::mqtt::passwd::PasswordFile;
use crate::mqtt::{broker, Broker, BumperPlugin, PluginConfig, UpstreamConnector, VendorConnector};
use crate::resolver::UpstreamResolver;
use crate::xmpp::routing::{ProvisionPolicy, Router};
use crate::xmpp::{self, XmppContext};
use bumper_core::authcode::generate_secret;
use bumper_core::{BumperResult, ConnectionRegistry, HmacAuthCodes, MemoryRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

pub struct BumperServer {
    config: ServerConfig,
    registry: Arc<MemoryRegistry>,
    auth_codes: Arc<HmacAuthCodes>,
    connections: Arc<ConnectionManager>,
    bridge: Option<Arc<CommandBridge>>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl BumperServer {
    pub fn new(config: ServerConfig) -> Self {
        let secret = match &config.auth_secret {
            Some(secret) => secret.clone(),
            None => {
                if config.use_auth {
                    warn!("no auth secret configured, auth codes from earlier runs will not verify");
                }
                generate_secret()
            }
        };

        let registry = Arc::new(MemoryRegistry::new());
        registry.reset_all_connections();

        Self {
            config,
            registry,
            auth_codes: Arc::new(HmacAuthCodes::new(&secret)),
            connections: Arc::new(ConnectionManager::new()),
            bridge: None,
            handles: Vec::new(),
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    pub fn registry(&self) -> Arc<MemoryRegistry> {
        self.registry.clone()
    }

    pub fn auth_codes(&self) -> Arc<HmacAuthCodes> {
        self.auth_codes.clone()
    }

    /// Entry point for HTTP handlers; present once the bridge link runs.
    pub fn bridge(&self) -> Option<Arc<CommandBridge>> {
        self.bridge.clone()
    }

    fn addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.config.listen, port)
    }

    /// Start every enabled listener. Without TLS material the XMPP engine
    /// offers no STARTTLS and the MQTT TLS listener stays off.
    pub async fn start(&mut self, tls: Option<Arc<rustls::ServerConfig>>) -> BumperResult<()> {
        let acceptor = tls.map(TlsAcceptor::from);
        if acceptor.is_none() {
            warn!("no TLS material, STARTTLS and MQTT over TLS disabled");
        }

        if self.config.xmpp_enabled {
            self.start_xmpp(acceptor.clone()).await?;
        }
        if self.config.mqtt_enabled {
            self.start_mqtt(acceptor).await?;
            if self.config.bridge_enabled {
                self.start_bridge();
            }
        }

        info!(
            listen = %self.config.listen,
            xmpp = self.config.xmpp_enabled,
            mqtt = self.config.mqtt_enabled,
            proxy = self.config.proxy_enabled,
            "bumper server started"
        );
        Ok(())
    }

    fn xmpp_context(&self, tls: Option<TlsAcceptor>) -> Arc<XmppContext> {
        let registry: Arc<dyn ConnectionRegistry> = self.registry.clone();
        Arc::new(XmppContext {
            registry,
            connections: self.connections.clone(),
            auth_codes: self.auth_codes.clone(),
            router: Router::new(
                self.connections.clone(),
                ProvisionPolicy {
                    enabled: self.config.auto_provision_admin,
                    use_auth: self.config.use_auth,
                },
            ),
            tls,
            use_auth: self.config.use_auth,
            keepalive: self.config.keepalive,
        })
    }

    async fn start_xmpp(&mut self, tls: Option<TlsAcceptor>) -> BumperResult<()> {
        let main = self.xmpp_context(tls);
        let handle = xmpp::start_listener(self.addr(self.config.xmpp_port), main, self.shutdown_tx.clone()).await?;
        self.handles.push(handle);

        let plain = self.xmpp_context(None);
        let handle =
            xmpp::start_listener(self.addr(self.config.xmpp_plain_port), plain, self.shutdown_tx.clone()).await?;
        self.handles.push(handle);
        Ok(())
    }

    async fn start_mqtt(&mut self, tls: Option<TlsAcceptor>) -> BumperResult<()> {
        let (injector, injected) = mpsc::unbounded_channel();

        let connector: Option<Arc<dyn UpstreamConnector>> = self.config.proxy_enabled.then(|| {
            info!(domain = %self.config.proxy_domain, port = self.config.proxy_port, "mqtt proxy mode enabled");
            Arc::new(VendorConnector::new(
                UpstreamResolver::new(&self.config.nameservers),
                self.config.proxy_domain.clone(),
                self.config.proxy_port,
                self.config.proxy_timeout,
                injector,
            )) as Arc<dyn UpstreamConnector>
        });

        let passwords = PasswordFile::load(&self.config.password_file).unwrap_or_else(|e| {
            warn!(path = %self.config.password_file.display(), error = %e, "password file unreadable");
            PasswordFile::default()
        });

        let plugin = BumperPlugin::new(
            PluginConfig {
                app_realms: self.config.app_realms.clone(),
                use_auth: self.config.use_auth,
                allow_anonymous: self.config.allow_anonymous,
                proxy_enabled: self.config.proxy_enabled,
            },
            self.registry.clone(),
            self.auth_codes.clone(),
            passwords,
            connector,
        );
        let broker = Broker::new(Arc::new(plugin));
        self.handles.push(broker.spawn_injector(injected, self.shutdown_tx.subscribe()));

        let handle = broker::start_listener(
            broker.clone(),
            self.addr(self.config.mqtt_port),
            None,
            self.shutdown_tx.clone(),
        )
        .await?;
        self.handles.push(handle);

        if let Some(acceptor) = tls {
            let handle = broker::start_listener(
                broker,
                self.addr(self.config.mqtt_tls_port),
                Some(acceptor),
                self.shutdown_tx.clone(),
            )
            .await?;
            self.handles.push(handle);
        }
        Ok(())
    }

    fn start_bridge(&mut self) {
        let (link, eventloop) = MqttLink::new(&self.config.bridge_host, self.config.mqtt_port);
        let bridge = Arc::new(CommandBridge::new(Arc::new(link.clone()), self.config.bridge_timeout));
        let handle = link.spawn(eventloop, bridge.clone(), self.shutdown_tx.subscribe());
        self.handles.push(handle);
        self.bridge = Some(bridge);
    }

    /// Signal every task and wait for the listeners to finish.
    pub async fn shutdown(self) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("task did not stop within the grace period");
            }
        }
        info!(connections = self.connections.count().await, "shutdown complete");
    }
}
