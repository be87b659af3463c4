//! MQTT side: embedded broker, its auth/routing plugin, and the vendor mirror.

pub mod broker;
pub mod passwd;
pub mod plugin;
pub mod proxy;

pub use broker::{Broker, BrokerPlugin, Delivery, Injector};
pub use plugin::{BumperPlugin, PluginConfig};
pub use proxy::{UpstreamConnector, VendorConnector, PROXY_SENTINEL};
