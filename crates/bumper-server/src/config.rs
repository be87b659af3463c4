//! Server configuration: TOML file + CLI overrides.

use bumper_core::identity::DEFAULT_APP_REALMS;
use bumper_core::{BumperError, BumperResult};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub xmpp: XmppSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub bridge: BridgeSection,
}

/// `[server]` section: bind address and TLS material.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_cert_path")]
    pub cert: String,
    #[serde(default = "default_key_path")]
    pub key: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cert: default_cert_path(),
            key: default_key_path(),
        }
    }
}

/// `[xmpp]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct XmppSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_xmpp_port")]
    pub port: u16,
    #[serde(default = "default_xmpp_plain_port")]
    pub plain_port: u16,
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
}

impl Default for XmppSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_xmpp_port(),
            plain_port: default_xmpp_plain_port(),
            keepalive: default_keepalive(),
        }
    }
}

/// `[mqtt]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_mqtt_tls_port")]
    pub tls_port: u16,
    #[serde(default = "default_app_realms")]
    pub app_realms: Vec<String>,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_mqtt_port(),
            tls_port: default_mqtt_tls_port(),
            app_realms: default_app_realms(),
        }
    }
}

/// `[auth]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Require valid auth codes from apps.
    #[serde(default)]
    pub use_auth: bool,
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    #[serde(default = "default_password_file")]
    pub password_file: String,
    /// Hex-encoded HMAC secret; a random one is generated when absent.
    #[serde(default)]
    pub secret: Option<String>,
    /// Grant apps admin rights on devices that report errno 103.
    #[serde(default = "default_true")]
    pub auto_provision_admin: bool,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            use_auth: false,
            allow_anonymous: true,
            password_file: default_password_file(),
            secret: None,
            auto_provision_admin: true,
        }
    }
}

/// `[proxy]` section: mirroring device traffic to the vendor broker.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_proxy_domain")]
    pub domain: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default = "default_nameservers")]
    pub nameservers: Vec<String>,
    #[serde(default = "default_proxy_timeout")]
    pub timeout: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            enabled: false,
            domain: default_proxy_domain(),
            port: default_proxy_port(),
            nameservers: default_nameservers(),
            timeout: default_proxy_timeout(),
        }
    }
}

/// `[bridge]` section: the internal command client.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bridge_host")]
    pub host: String,
    #[serde(default = "default_bridge_timeout")]
    pub timeout: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_bridge_host(),
            timeout: default_bridge_timeout(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}
fn default_cert_path() -> String {
    "~/.bumper/cert.pem".to_string()
}
fn default_key_path() -> String {
    "~/.bumper/key.pem".to_string()
}
fn default_xmpp_port() -> u16 {
    5223
}
fn default_xmpp_plain_port() -> u16 {
    1223
}
fn default_keepalive() -> u64 {
    30
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_mqtt_tls_port() -> u16 {
    8883
}
fn default_app_realms() -> Vec<String> {
    DEFAULT_APP_REALMS.iter().map(|r| r.to_string()).collect()
}
fn default_password_file() -> String {
    "~/.bumper/passwd".to_string()
}
fn default_proxy_domain() -> String {
    "mq-ww.ecouser.net".to_string()
}
fn default_proxy_port() -> u16 {
    443
}
fn default_nameservers() -> Vec<String> {
    vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()]
}
fn default_proxy_timeout() -> u64 {
    180
}
fn default_bridge_host() -> String {
    "127.0.0.1".to_string()
}
fn default_bridge_timeout() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

/// Values given on the command line; `None`/`false` leaves the file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub xmpp_port: Option<u16>,
    pub mqtt_port: Option<u16>,
    pub mqtt_tls_port: Option<u16>,
    pub use_auth: bool,
    pub proxy: bool,
    pub bridge_timeout: Option<u64>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: IpAddr,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,

    pub xmpp_enabled: bool,
    pub xmpp_port: u16,
    pub xmpp_plain_port: u16,
    pub keepalive: Duration,

    pub mqtt_enabled: bool,
    pub mqtt_port: u16,
    pub mqtt_tls_port: u16,
    pub app_realms: Vec<String>,

    pub use_auth: bool,
    pub allow_anonymous: bool,
    pub password_file: PathBuf,
    pub auth_secret: Option<Vec<u8>>,
    pub auto_provision_admin: bool,

    pub proxy_enabled: bool,
    pub proxy_domain: String,
    pub proxy_port: u16,
    pub nameservers: Vec<IpAddr>,
    pub proxy_timeout: Duration,

    pub bridge_enabled: bool,
    pub bridge_host: String,
    pub bridge_timeout: Duration,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> BumperResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    fn resolve(file: ConfigFile, cli: CliOverrides) -> BumperResult<Self> {
        let listen_str = cli.listen.unwrap_or(file.server.listen);
        let listen = listen_str
            .parse()
            .map_err(|e| BumperError::Other(format!("invalid listen address '{listen_str}': {e}")))?;
        let cert_str = cli.cert.unwrap_or(file.server.cert);
        let key_str = cli.key.unwrap_or(file.server.key);

        let auth_secret = file
            .auth
            .secret
            .as_deref()
            .map(|s| hex::decode(s.trim()))
            .transpose()
            .map_err(|e| BumperError::Other(format!("invalid auth secret: {e}")))?;

        let nameservers = file
            .proxy
            .nameservers
            .iter()
            .map(|ns| {
                ns.parse()
                    .map_err(|e| BumperError::Other(format!("invalid nameserver '{ns}': {e}")))
            })
            .collect::<BumperResult<Vec<IpAddr>>>()?;

        Ok(Self {
            listen,
            cert_path: expand_tilde_str(&cert_str),
            key_path: expand_tilde_str(&key_str),

            xmpp_enabled: file.xmpp.enabled,
            xmpp_port: cli.xmpp_port.unwrap_or(file.xmpp.port),
            xmpp_plain_port: file.xmpp.plain_port,
            keepalive: Duration::from_secs(file.xmpp.keepalive),

            mqtt_enabled: file.mqtt.enabled,
            mqtt_port: cli.mqtt_port.unwrap_or(file.mqtt.port),
            mqtt_tls_port: cli.mqtt_tls_port.unwrap_or(file.mqtt.tls_port),
            app_realms: file.mqtt.app_realms,

            use_auth: cli.use_auth || file.auth.use_auth,
            allow_anonymous: file.auth.allow_anonymous,
            password_file: expand_tilde_str(&file.auth.password_file),
            auth_secret,
            auto_provision_admin: file.auth.auto_provision_admin,

            proxy_enabled: cli.proxy || file.proxy.enabled,
            proxy_domain: file.proxy.domain,
            proxy_port: file.proxy.port,
            nameservers,
            proxy_timeout: Duration::from_secs(file.proxy.timeout),

            bridge_enabled: file.bridge.enabled,
            bridge_host: file.bridge.host,
            bridge_timeout: Duration::from_secs(cli.bridge_timeout.unwrap_or(file.bridge.timeout)),
        })
    }
}

fn parse_config(content: &str) -> BumperResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| BumperError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

pub fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
