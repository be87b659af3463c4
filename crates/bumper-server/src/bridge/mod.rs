//! Command correlation bridge.
//!
//! HTTP handlers call [`CommandBridge::send_command`] and get the device's
//! answer back as a plain value. Underneath, the command is published on a
//! p2p topic addressed from the bridge, and the reply is matched to the
//! waiting caller by its request id.

pub mod link;

pub use link::MqttLink;

use async_trait::async_trait;
use bumper_core::command::Command;
use bumper_core::topic::{segment, Endpoint, SEG_COMMAND, SEG_REQUEST_ID};
use bumper_core::{
    decode_response, failure_envelope, success_envelope, BumperError, BumperResult, Eviction, ExpiringMap, Reply,
};
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Client id the bridge connects to the broker with.
pub const BRIDGE_CLIENT_ID: &str = "bridge@bumper/bridge";

/// Replies addressed to the bridge, and status broadcasts.
pub const BRIDGE_SUBSCRIPTIONS: [&str; 2] = [
    "iot/p2p/+/+/+/+/bridge/bumper/bridge/+/+/+",
    "iot/atr/+/+/+/+/+",
];

const TIMED_OUT: &str = "wait for response timed out";

/// Broadcasts worth surfacing at info level.
const STATS_REPORTS: [&str; 2] = ["onStats", "reportStats"];

/// Where the bridge publishes commands.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> BumperResult<()>;
}

struct Pending {
    tx: oneshot::Sender<Bytes>,
    ticket: u64,
}

/// Drops the caller's pending entry however the wait ends, including when
/// the caller itself is cancelled.
struct PendingGuard<'a> {
    bridge: &'a CommandBridge,
    request_id: String,
    ticket: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let ticket = self.ticket;
        self.bridge
            .pending()
            .remove_if(&self.request_id, |pending| pending.ticket == ticket);
    }
}

pub struct CommandBridge {
    publisher: Arc<dyn Publisher>,
    pending: Mutex<ExpiringMap<Pending>>,
    next_ticket: AtomicU64,
    timeout: Duration,
    endpoint: Endpoint,
}

impl CommandBridge {
    /// Pending capacity is `timeout × 60`, entries live `timeout × 1.1`.
    pub fn new(publisher: Arc<dyn Publisher>, timeout: Duration) -> Self {
        let capacity = (timeout.as_secs().max(1) * 60) as usize;
        Self {
            publisher,
            pending: Mutex::new(ExpiringMap::new(capacity, timeout.mul_f64(1.1))),
            next_ticket: AtomicU64::new(0),
            timeout,
            endpoint: Endpoint::new("bridge", "bumper", "bridge"),
        }
    }

    fn pending(&self) -> MutexGuard<'_, ExpiringMap<Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Observe pending commands evicted before they were answered.
    pub fn subscribe_evictions(&self) -> broadcast::Receiver<Eviction> {
        self.pending().subscribe()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_command(
        &self,
        cmd_name: &str,
        to_id: &str,
        to_type: &str,
        to_res: &str,
        payload_type: &str,
        payload: &Value,
        request_id: Option<String>,
    ) -> Value {
        let command = Command::new(cmd_name, to_id, to_type, to_res, payload_type, payload, request_id);
        match self.exchange(&command).await {
            Ok(raw) => success_envelope(&command.request_id, &command.payload_type, &raw),
            Err(debug) => failure_envelope(&command.request_id, &debug),
        }
    }

    /// Publish `command` and wait for its reply, shaped for the endpoint the
    /// command came in through.
    pub async fn execute(&self, command: Command) -> Reply {
        match self.exchange(&command).await {
            Ok(raw) => command.reply(decode_response(&command.payload_type, &raw)),
            Err(debug) => Reply::failure(&command.request_id, &debug),
        }
    }

    /// Raw reply text, or the reason there is none.
    async fn exchange(&self, command: &Command) -> Result<String, String> {
        let request_id = &command.request_id;
        let topic = command.topic(&self.endpoint);

        let (tx, rx) = oneshot::channel();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        match self.pending().insert(request_id.clone(), Pending { tx, ticket }) {
            Ok(evicted) => {
                for (key, _) in evicted {
                    warn!(request_id = %key, "pending command evicted");
                }
            }
            Err(BumperError::Duplicate(_)) => {
                warn!(request_id = %request_id, "request id already pending");
                return Err("request id already pending".into());
            }
            Err(e) => return Err(e.to_string()),
        }
        let _guard = PendingGuard {
            bridge: self,
            request_id: request_id.clone(),
            ticket,
        };

        debug!(topic = %topic, payload = %command.payload, "sending command");
        if let Err(e) = self.publisher.publish(&topic, Bytes::from(command.payload.clone())).await {
            warn!(request_id = %request_id, error = %e, "command publish failed");
            return Err(e.to_string());
        }
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(raw)) => Ok(String::from_utf8_lossy(&raw).into_owned()),
            Ok(Err(_)) | Err(_) => {
                info!(request_id = %request_id, command = %command.cmd_name, "command timed out");
                Err(TIMED_OUT.into())
            }
        }
    }

    /// Handle a message from a bridge subscription. Returns whether it
    /// resolved a pending command.
    pub fn on_message(&self, topic: &str, payload: Bytes) -> bool {
        if segment(topic, 1) == Some("atr") {
            let report = segment(topic, SEG_COMMAND).unwrap_or_default();
            let text = String::from_utf8_lossy(&payload);
            if STATS_REPORTS.contains(&report) {
                info!(topic, payload = %text, "stats report");
            } else {
                debug!(topic, payload = %text, "broadcast");
            }
            return false;
        }

        let Some(request_id) = segment(topic, SEG_REQUEST_ID) else {
            debug!(topic, "message without request id");
            return false;
        };
        let pending = self.pending().remove(request_id);
        match pending {
            Some(pending) => {
                debug!(request_id, "response matched");
                pending.tx.send(payload).is_ok()
            }
            None => {
                debug!(request_id, topic, "response for unknown request");
                false
            }
        }
    }
}
