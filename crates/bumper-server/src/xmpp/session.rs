//! Per-connection session state for the legacy stanza protocol.

use bumper_core::{BumperError, BumperResult, PrincipalKind};
use std::fmt;

/// Handshake progress. Ordered; a session only moves forward, except that
/// `Disconnect` is reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Idle = 0,
    Connect = 1,
    Init = 2,
    Bind = 3,
    Ready = 4,
    Disconnect = 5,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connect => "connect",
            SessionState::Init => "init",
            SessionState::Bind => "bind",
            SessionState::Ready => "ready",
            SessionState::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct StanzaSession {
    state: SessionState,
    pub kind: PrincipalKind,
    /// Device id or app user id, set by SASL.
    pub principal_id: String,
    /// Captured from the stream `to` host of a device.
    pub device_class: Option<String>,
    /// Resource from SASL.
    pub resource: String,
    address: Option<String>,
    tls_upgraded: bool,
}

impl Default for StanzaSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StanzaSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            kind: PrincipalKind::Unknown,
            principal_id: String::new(),
            device_class: None,
            resource: String::new(),
            address: None,
            tls_upgraded: false,
        }
    }

    /// Session for a freshly accepted TCP connection.
    pub fn accepted() -> Self {
        Self {
            state: SessionState::Connect,
            ..Self::new()
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. Going backwards is a violation: the session is forced
    /// to `Disconnect` and the error is returned.
    pub fn transition(&mut self, next: SessionState) -> BumperResult<()> {
        if next < self.state && next != SessionState::Disconnect {
            let from = self.state;
            self.state = SessionState::Disconnect;
            return Err(BumperError::ProtocolViolation {
                from: from.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.kind != PrincipalKind::Unknown
    }

    pub fn authenticate(&mut self, kind: PrincipalKind, principal_id: &str, resource: &str) {
        self.kind = kind;
        self.principal_id = principal_id.to_string();
        self.resource = resource.to_string();
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Assign the bound address; only the first assignment takes.
    pub fn assign_address(&mut self, address: String) -> BumperResult<()> {
        if let Some(existing) = &self.address {
            return Err(BumperError::InvalidStanza(format!(
                "address already bound to {existing}"
            )));
        }
        self.address = Some(address);
        Ok(())
    }

    pub fn tls_upgraded(&self) -> bool {
        self.tls_upgraded
    }

    /// One-way latch set once the transport is running TLS.
    pub fn mark_tls_upgraded(&mut self) {
        self.tls_upgraded = true;
    }
}
