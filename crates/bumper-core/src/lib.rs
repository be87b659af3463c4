//! bumper-core: protocol library for the bumper device bridge.
//!
//! Provides the namespace-aware stanza model and chunk decoder for the legacy
//! XMPP protocol, SASL PLAIN decoding, device/app identities, the connection
//! registry, p2p topic handling, auth codes, commands and the expiring map
//! used for request correlation.

pub mod authcode;
pub mod codec;
pub mod command;
pub mod error;
pub mod expiring;
pub mod identity;
pub mod registry;
pub mod sasl;
pub mod stanza;
pub mod topic;

// Re-export commonly used items at crate root.
pub use authcode::{AuthCodeVerifier, HmacAuthCodes};
pub use codec::{Decoded, StanzaDecoder};
pub use command::{decode_response, failure_envelope, success_envelope, Command, CommandVersion, Reply};
pub use error::{BumperError, BumperResult};
pub use expiring::{Eviction, EvictionReason, ExpiringMap};
pub use identity::{ClientId, PrincipalKind};
pub use registry::{ConnectionRegistry, LinkKind, MemoryRegistry};
pub use stanza::Element;
pub use topic::P2pTopic;
