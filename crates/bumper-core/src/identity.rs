//! Device and app identities, and the address formats both protocols use.

use crate::error::{BumperError, BumperResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain the server answers for on the legacy protocol.
pub const SERVER_DOMAIN: &str = "ecouser.net";
/// Suffix of device addresses: `{did}@{class}.ecorobot.net/atom`.
pub const DEVICE_DOMAIN: &str = "ecorobot.net";
/// Resource every legacy device binds to.
pub const DEVICE_RESOURCE: &str = "atom";

/// Company recorded for devices on the legacy stanza protocol.
pub const COMPANY_LEGACY: &str = "eco-legacy";
/// Company recorded for devices on MQTT.
pub const COMPANY_PUBSUB: &str = "eco-ng";

/// Client-id realms that mark a companion app rather than a device.
pub const DEFAULT_APP_REALMS: [&str; 3] = ["ecouser", "bumper", "USER"];

/// What kind of principal is on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrincipalKind {
    Unknown,
    Device,
    App,
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrincipalKind::Unknown => write!(f, "unknown"),
            PrincipalKind::Device => write!(f, "device"),
            PrincipalKind::App => write!(f, "app"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub did: String,
    pub class: String,
    pub resource: String,
    pub company: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentity {
    pub user_id: String,
    pub realm: String,
    pub resource: String,
}

/// Address assigned to a bound legacy device.
pub fn device_address(did: &str, class: &str) -> String {
    format!("{did}@{class}.{DEVICE_DOMAIN}/{DEVICE_RESOURCE}")
}

/// Address assigned to a bound app; `resource` may be empty.
pub fn app_address(user_id: &str, resource: &str) -> String {
    if resource.is_empty() {
        format!("{user_id}@{SERVER_DOMAIN}")
    } else {
        format!("{user_id}@{SERVER_DOMAIN}/{resource}")
    }
}

/// Device class from a stream `to` attribute like `ls1ok3.ecorobot.net`.
pub fn device_class_from_host(host: &str) -> Option<&str> {
    host.strip_suffix(DEVICE_DOMAIN)
        .and_then(|rest| rest.strip_suffix('.'))
        .filter(|class| !class.is_empty())
}

/// Address without its resource.
pub fn bare_address(addr: &str) -> &str {
    addr.split_once('/').map_or(addr, |(bare, _)| bare)
}

/// Rewrite `user@any.domain/res` to `user@ecouser.net`; addresses without a
/// local part are returned unchanged.
pub fn canonical_user_address(addr: &str) -> String {
    match addr.split_once('@') {
        Some((local, _)) => format!("{local}@{SERVER_DOMAIN}"),
        None => addr.to_string(),
    }
}

/// A pub/sub client id of the form `{id}@{class}/{resource}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId {
    pub id: String,
    pub class: String,
    pub resource: String,
}

impl ClientId {
    pub fn parse(raw: &str) -> BumperResult<Self> {
        let (id, rest) = raw
            .split_once('@')
            .ok_or_else(|| BumperError::InvalidClientId(raw.to_string()))?;
        let (class, resource) = rest
            .split_once('/')
            .ok_or_else(|| BumperError::InvalidClientId(raw.to_string()))?;
        if id.is_empty() || class.is_empty() {
            return Err(BumperError::InvalidClientId(raw.to_string()));
        }
        Ok(Self {
            id: id.to_string(),
            class: class.to_string(),
            resource: resource.to_string(),
        })
    }

    /// Devices are every client whose class is not an app realm.
    pub fn kind<S: AsRef<str>>(&self, app_realms: &[S]) -> PrincipalKind {
        if app_realms.iter().any(|r| r.as_ref() == self.class) {
            PrincipalKind::App
        } else {
            PrincipalKind::Device
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.id, self.class, self.resource)
    }
}
