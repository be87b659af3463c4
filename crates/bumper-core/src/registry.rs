//! Connection registry: which devices and apps are reachable over which link.
//!
//! The persistent store behind it belongs to the HTTP side; the bridge only
//! needs synchronous key-value access, expressed by [`ConnectionRegistry`].

use crate::identity::{AppIdentity, DeviceIdentity};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

/// Transport a principal is connected through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkKind {
    /// Legacy XMPP stanza protocol.
    Legacy,
    /// MQTT.
    PubSub,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub did: String,
    pub class: String,
    pub resource: String,
    pub company: String,
    pub name: Option<String>,
    pub legacy_connected: bool,
    pub pubsub_connected: bool,
    /// Vendor account the device's mirrored upstream session logs in with.
    pub upstream_principal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppRecord {
    pub user_id: String,
    pub realm: String,
    pub resource: String,
    pub legacy_connected: bool,
    pub pubsub_connected: bool,
}

/// Connection flags per identity, shared by every protocol handler.
pub trait ConnectionRegistry: Send + Sync {
    /// Add a device if it is not known yet; existing records are kept.
    fn register_device(&self, device: DeviceIdentity, name: Option<String>);
    /// Add an app session keyed by its resource if it is not known yet.
    fn register_app(&self, app: AppIdentity);
    fn set_device_connected(&self, did: &str, link: LinkKind, connected: bool);
    fn set_app_connected(&self, resource: &str, link: LinkKind, connected: bool);
    fn set_upstream_principal(&self, did: &str, principal: &str);
    fn lookup_device_by_id(&self, did: &str) -> Option<DeviceRecord>;
    fn lookup_app_by_resource(&self, resource: &str) -> Option<AppRecord>;
    fn lookup_device_by_upstream_principal(&self, principal: &str) -> Option<DeviceRecord>;
    /// Clear every connection flag, used at startup.
    fn reset_all_connections(&self);
}

/// In-memory registry backed by one `DashMap` per table.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    devices: DashMap<String, DeviceRecord>,
    apps: DashMap<String, AppRecord>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn app_count(&self) -> usize {
        self.apps.len()
    }
}

fn apply(link: LinkKind, connected: bool, legacy: &mut bool, pubsub: &mut bool) {
    match link {
        LinkKind::Legacy => *legacy = connected,
        LinkKind::PubSub => *pubsub = connected,
    }
}

impl ConnectionRegistry for MemoryRegistry {
    fn register_device(&self, device: DeviceIdentity, name: Option<String>) {
        self.devices.entry(device.did.clone()).or_insert_with(|| {
            info!(did = %device.did, class = %device.class, company = %device.company, "device registered");
            DeviceRecord {
                did: device.did,
                class: device.class,
                resource: device.resource,
                company: device.company,
                name,
                legacy_connected: false,
                pubsub_connected: false,
                upstream_principal: None,
            }
        });
    }

    fn register_app(&self, app: AppIdentity) {
        self.apps.entry(app.resource.clone()).or_insert_with(|| {
            info!(user_id = %app.user_id, realm = %app.realm, resource = %app.resource, "app registered");
            AppRecord {
                user_id: app.user_id,
                realm: app.realm,
                resource: app.resource,
                legacy_connected: false,
                pubsub_connected: false,
            }
        });
    }

    fn set_device_connected(&self, did: &str, link: LinkKind, connected: bool) {
        match self.devices.get_mut(did) {
            Some(mut rec) => {
                let rec = &mut *rec;
                apply(link, connected, &mut rec.legacy_connected, &mut rec.pubsub_connected);
                debug!(did, ?link, connected, "device link updated");
            }
            None => debug!(did, ?link, "link update for unknown device"),
        }
    }

    fn set_app_connected(&self, resource: &str, link: LinkKind, connected: bool) {
        match self.apps.get_mut(resource) {
            Some(mut rec) => {
                let rec = &mut *rec;
                apply(link, connected, &mut rec.legacy_connected, &mut rec.pubsub_connected);
                debug!(resource, ?link, connected, "app link updated");
            }
            None => debug!(resource, ?link, "link update for unknown app"),
        }
    }

    fn set_upstream_principal(&self, did: &str, principal: &str) {
        if let Some(mut rec) = self.devices.get_mut(did) {
            rec.upstream_principal = Some(principal.to_string());
        }
    }

    fn lookup_device_by_id(&self, did: &str) -> Option<DeviceRecord> {
        self.devices.get(did).map(|r| r.clone())
    }

    fn lookup_app_by_resource(&self, resource: &str) -> Option<AppRecord> {
        self.apps.get(resource).map(|r| r.clone())
    }

    fn lookup_device_by_upstream_principal(&self, principal: &str) -> Option<DeviceRecord> {
        self.devices
            .iter()
            .find(|r| r.upstream_principal.as_deref() == Some(principal))
            .map(|r| r.clone())
    }

    fn reset_all_connections(&self) {
        for mut rec in self.devices.iter_mut() {
            rec.legacy_connected = false;
            rec.pubsub_connected = false;
        }
        for mut rec in self.apps.iter_mut() {
            rec.legacy_connected = false;
            rec.pubsub_connected = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(did: &str) -> DeviceIdentity {
        DeviceIdentity {
            did: did.into(),
            class: "ls1ok3".into(),
            resource: "atom".into(),
            company: "eco-legacy".into(),
        }
    }

    #[test]
    fn flags_are_independent_per_link() {
        let reg = MemoryRegistry::new();
        reg.register_device(device("E1"), None);
        reg.set_device_connected("E1", LinkKind::Legacy, true);
        let rec = reg.lookup_device_by_id("E1").unwrap();
        assert!(rec.legacy_connected);
        assert!(!rec.pubsub_connected);

        reg.set_device_connected("E1", LinkKind::PubSub, true);
        reg.set_device_connected("E1", LinkKind::Legacy, false);
        let rec = reg.lookup_device_by_id("E1").unwrap();
        assert!(!rec.legacy_connected);
        assert!(rec.pubsub_connected);
    }

    #[test]
    fn register_keeps_existing_record() {
        let reg = MemoryRegistry::new();
        reg.register_device(device("E1"), Some("first".into()));
        reg.set_device_connected("E1", LinkKind::Legacy, true);
        reg.register_device(device("E1"), Some("second".into()));
        let rec = reg.lookup_device_by_id("E1").unwrap();
        assert_eq!(rec.name.as_deref(), Some("first"));
        assert!(rec.legacy_connected);
        assert_eq!(reg.device_count(), 1);
    }

    #[test]
    fn apps_are_keyed_by_resource() {
        let reg = MemoryRegistry::new();
        reg.register_app(AppIdentity {
            user_id: "fuid_1".into(),
            realm: "ecouser".into(),
            resource: "IOS1".into(),
        });
        reg.set_app_connected("IOS1", LinkKind::PubSub, true);
        assert!(reg.lookup_app_by_resource("IOS1").unwrap().pubsub_connected);
        assert!(reg.lookup_app_by_resource("fuid_1").is_none());
        assert_eq!(reg.app_count(), 1);
    }

    #[test]
    fn upstream_principal_lookup_and_reset() {
        let reg = MemoryRegistry::new();
        reg.register_device(device("E1"), None);
        reg.register_device(device("E2"), None);
        reg.set_upstream_principal("E2", "vendor-user");
        reg.set_device_connected("E2", LinkKind::PubSub, true);
        assert_eq!(reg.lookup_device_by_upstream_principal("vendor-user").unwrap().did, "E2");
        assert!(reg.lookup_device_by_upstream_principal("nobody").is_none());

        reg.reset_all_connections();
        assert!(!reg.lookup_device_by_id("E2").unwrap().pubsub_connected);
    }
}
