//! Authentication and routing hooks for the embedded broker.

use super::broker::BrokerPlugin;
use super::passwd::{FileAuth, PasswordFile};
use super::proxy::{rewrite_outbound, Outbound, Upstream, UpstreamConnector};
use crate::bridge::BRIDGE_CLIENT_ID;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bumper_core::identity::{AppIdentity, DeviceIdentity, COMPANY_PUBSUB};
use bumper_core::topic::{segment, MIN_SEGMENTS, SEG_RECIPIENT, SEG_SENDER};
use bumper_core::{AuthCodeVerifier, ClientId, ConnectionRegistry, LinkKind, PrincipalKind};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Marker id the bridge uses in topics.
const BRIDGE_MARKER: &str = "bridge";

pub struct PluginConfig {
    pub app_realms: Vec<String>,
    pub use_auth: bool,
    pub allow_anonymous: bool,
    pub proxy_enabled: bool,
}

pub struct BumperPlugin {
    config: PluginConfig,
    registry: Arc<dyn ConnectionRegistry>,
    auth_codes: Arc<dyn AuthCodeVerifier>,
    passwords: PasswordFile,
    connector: Option<Arc<dyn UpstreamConnector>>,
    proxies: RwLock<HashMap<String, Arc<dyn Upstream>>>,
}

/// How a message is labelled in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    /// Reply addressed to the bridge.
    Response,
    /// Sent by the bridge.
    Command,
    /// Status broadcast on `iot/atr`.
    Broadcast,
    Message,
}

pub fn categorize(topic: &str) -> MessageCategory {
    if segment(topic, SEG_RECIPIENT) == Some(BRIDGE_MARKER) {
        MessageCategory::Response
    } else if segment(topic, SEG_SENDER) == Some(BRIDGE_MARKER) {
        MessageCategory::Command
    } else if segment(topic, 1) == Some("atr") {
        MessageCategory::Broadcast
    } else {
        MessageCategory::Message
    }
}

/// Split a ``name`b64header`b64body`` username, returning the name and the
/// decoded parts. Other usernames yield `None`.
fn decode_user_info(username: &str) -> Option<(&str, String, String)> {
    let mut parts = username.split('`');
    let name = parts.next()?;
    let header = parts.next()?;
    let body = parts.next()?;
    let decode = |s: &str| {
        let cleaned: String = s.chars().filter(|c| *c != '\n').collect();
        STANDARD
            .decode(cleaned)
            .ok()
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
    };
    Some((name, decode(header)?, decode(body)?))
}

impl BumperPlugin {
    pub fn new(
        config: PluginConfig,
        registry: Arc<dyn ConnectionRegistry>,
        auth_codes: Arc<dyn AuthCodeVerifier>,
        passwords: PasswordFile,
        connector: Option<Arc<dyn UpstreamConnector>>,
    ) -> Self {
        Self {
            config,
            registry,
            auth_codes,
            passwords,
            connector,
            proxies: RwLock::new(HashMap::new()),
        }
    }

    fn proxy_mode(&self) -> bool {
        self.config.proxy_enabled && self.connector.is_some()
    }

    pub async fn has_upstream(&self, client_id: &str) -> bool {
        self.proxies.read().await.contains_key(client_id)
    }

    async fn accept_device(&self, raw: &str, client: &ClientId, username: Option<&str>, password: Option<&str>) {
        self.registry.register_device(
            DeviceIdentity {
                did: client.id.clone(),
                class: client.class.clone(),
                resource: client.resource.clone(),
                company: COMPANY_PUBSUB.to_string(),
            },
            None,
        );
        info!(client_id = raw, username = username.unwrap_or(""), "device authenticated");

        let (Some(connector), Some(username), Some(password)) = (self.connector.as_ref(), username, password) else {
            return;
        };
        if !self.config.proxy_enabled {
            return;
        }
        match connector.connect(raw, username, password).await {
            Ok(upstream) => {
                self.proxies.write().await.insert(raw.to_string(), upstream);
                self.registry.set_upstream_principal(&client.id, username);
                info!(client_id = raw, "upstream mirror established");
            }
            Err(e) => warn!(client_id = raw, error = %e, "upstream mirror failed, device served locally only"),
        }
    }

    fn accept_app(&self, client: &ClientId, username: Option<&str>, password: Option<&str>) -> bool {
        let mut username = username.map(str::to_string);
        if client.class == "USER" {
            if let Some((name, header, body)) = username.as_deref().and_then(decode_user_info) {
                debug!(header = %header, body = %body, "app user info");
                username = Some(name.to_string());
            }
        }

        if self.config.use_auth {
            let Some(password) = password else {
                warn!(client_id = %client, "app sent no password");
                return false;
            };
            if !self.auth_codes.verify_auth_code(&client.id, password) {
                warn!(client_id = %client, "app auth code rejected");
                return false;
            }
        }

        self.registry.register_app(AppIdentity {
            user_id: client.id.clone(),
            realm: client.class.clone(),
            resource: client.resource.clone(),
        });
        info!(client_id = %client, username = username.as_deref().unwrap_or(""), "app authenticated");
        true
    }

    fn file_auth(&self, client_id: &str, username: Option<&str>, password: Option<&str>) -> bool {
        let (Some(username), Some(password)) = (username, password) else {
            return false;
        };
        match self.passwords.verify(username, password) {
            FileAuth::Accepted => {
                info!(client_id, username, "password file authentication succeeded");
                true
            }
            FileAuth::NoEntry => {
                info!(client_id, username, "password file authentication failed: no entry");
                false
            }
            FileAuth::Mismatch => {
                info!(client_id, username, "password file authentication failed: hash mismatch");
                false
            }
        }
    }

    fn set_connected(&self, client_id: &str, connected: bool) {
        if client_id == BRIDGE_CLIENT_ID {
            return;
        }
        let Ok(client) = ClientId::parse(client_id) else {
            return;
        };
        match client.kind(&self.config.app_realms) {
            PrincipalKind::Device => self.registry.set_device_connected(&client.id, LinkKind::PubSub, connected),
            PrincipalKind::App => self.registry.set_app_connected(&client.resource, LinkKind::PubSub, connected),
            PrincipalKind::Unknown => {}
        }
    }
}

#[async_trait]
impl BrokerPlugin for BumperPlugin {
    async fn authenticate(&self, client_id: &str, username: Option<&str>, password: Option<&str>) -> bool {
        if client_id == BRIDGE_CLIENT_ID {
            info!(client_id, "bridge authenticated");
            return true;
        }

        match ClientId::parse(client_id) {
            Ok(client) if client.id != BRIDGE_MARKER => match client.kind(&self.config.app_realms) {
                PrincipalKind::App => {
                    if self.accept_app(&client, username, password) {
                        return true;
                    }
                }
                _ => {
                    self.accept_device(client_id, &client, username, password).await;
                    return true;
                }
            },
            _ => {}
        }

        // Apps without a valid auth code get the password file too.
        if self.file_auth(client_id, username, password) {
            return true;
        }

        if self.config.allow_anonymous {
            info!(client_id, username = username.unwrap_or(""), "anonymous authentication allowed");
            return true;
        }
        warn!(client_id, "authentication rejected");
        false
    }

    async fn on_connected(&self, client_id: &str) {
        self.set_connected(client_id, true);
    }

    async fn on_subscribe(&self, client_id: &str, filter: &str) {
        if !self.proxy_mode() {
            return;
        }
        let upstream = self.proxies.read().await.get(client_id).cloned();
        match upstream {
            Some(upstream) => match upstream.subscribe(filter).await {
                Ok(()) => info!(client_id, filter, "subscription mirrored upstream"),
                Err(e) => warn!(client_id, filter, error = %e, "upstream subscribe failed"),
            },
            None if client_id != BRIDGE_CLIENT_ID => {
                warn!(client_id, filter, "no upstream mirror for subscriber");
            }
            None => {}
        }
    }

    async fn on_message_received(&self, client_id: &str, topic: &str, payload: &Bytes) -> bool {
        if topic.split('/').count() < MIN_SEGMENTS {
            warn!(client_id, topic, "rejected message with short topic");
            return false;
        }

        let text = String::from_utf8_lossy(payload);
        match categorize(topic) {
            MessageCategory::Response => info!(topic, payload = %text, "response"),
            MessageCategory::Command => info!(topic, payload = %text, "command"),
            MessageCategory::Broadcast => debug!(topic, payload = %text, "broadcast"),
            MessageCategory::Message => debug!(topic, payload = %text, "message"),
        }

        if !self.proxy_mode() {
            return true;
        }
        let Some(upstream) = self.proxies.read().await.get(client_id).cloned() else {
            return true;
        };
        let target = match rewrite_outbound(upstream.mapper(), topic) {
            Outbound::Drop => return true,
            Outbound::Unmapped(request_id) => {
                warn!(client_id, request_id = %request_id, "no proxy mapping for reply, request probably timed out");
                return true;
            }
            Outbound::Forward(target) => target,
        };
        info!(client_id, topic = %target, "forwarding to vendor");
        if let Err(e) = upstream.publish(&target, payload.clone()).await {
            warn!(client_id, error = %e, "forwarding to vendor failed");
        }
        true
    }

    async fn on_disconnected(&self, client_id: &str) {
        let upstream = self.proxies.write().await.remove(client_id);
        if let Some(upstream) = upstream {
            upstream.disconnect().await;
            info!(client_id, "upstream mirror closed");
        }
        self.set_connected(client_id, false);
    }
}
