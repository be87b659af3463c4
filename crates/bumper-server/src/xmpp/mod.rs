//! Legacy XMPP engine: listener, per-connection state machine and routing.

pub mod connection;
pub mod handshake;
pub mod routing;
pub mod session;
pub mod transport;

pub use connection::{XmppConnection, XmppContext};

use bumper_core::{BumperError, BumperResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Bind a listener and spawn its accept loop.
pub async fn start_listener(
    bind_addr: SocketAddr,
    ctx: Arc<XmppContext>,
    shutdown: broadcast::Sender<()>,
) -> BumperResult<JoinHandle<()>> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| BumperError::Transport(format!("xmpp bind {bind_addr} failed: {e}")))?;
    info!(addr = %bind_addr, starttls = ctx.tls.is_some(), "xmpp listener started");

    let mut stop = shutdown.subscribe();
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            error!(remote = %addr, error = %e, "set_nodelay failed");
                        }
                        let conn = XmppConnection::new(ctx.clone(), stream, addr);
                        tokio::spawn(conn.run(shutdown.subscribe()));
                    }
                    Err(e) => {
                        error!(error = %e, "TCP accept failed");
                    }
                }
            }
        }
        info!(addr = %bind_addr, "xmpp listener stopped");
    }))
}
