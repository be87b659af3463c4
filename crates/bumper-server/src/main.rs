//! bumper-server: self-hosted device bridge.
//!
//! Serves legacy XMPP devices, MQTT devices and their companion apps, and
//! lets HTTP handlers call commands on devices through the correlation
//! bridge.

mod bridge;
mod config;
mod connections;
mod mqtt;
mod resolver;
mod server;
mod tls;
mod xmpp;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::BumperServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// bumper-server: self-hosted device bridge
#[derive(Parser, Debug)]
#[command(name = "bumper-server", version, about = "Self-hosted device bridge")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.bumper/config.toml")]
    config: String,

    /// Listen address
    #[arg(long)]
    listen: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// XMPP (STARTTLS) port
    #[arg(long)]
    xmpp_port: Option<u16>,

    /// MQTT plain port
    #[arg(long)]
    mqtt_port: Option<u16>,

    /// MQTT TLS port
    #[arg(long)]
    mqtt_tls_port: Option<u16>,

    /// Require auth codes from apps
    #[arg(long)]
    use_auth: bool,

    /// Mirror MQTT devices to the vendor broker
    #[arg(long)]
    proxy_mqtt: bool,

    /// Seconds a bridge command waits for its reply
    #[arg(long)]
    bridge_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting bumper-server");

    let (cert, key) = if cli.generate_cert {
        let dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")).join(".bumper");
        match tls::generate_self_signed_cert(&dir) {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                (Some(c.display().to_string()), Some(k.display().to_string()))
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (cli.cert.clone(), cli.key.clone())
    };

    let overrides = CliOverrides {
        listen: cli.listen.clone(),
        cert,
        key,
        xmpp_port: cli.xmpp_port,
        mqtt_port: cli.mqtt_port,
        mqtt_tls_port: cli.mqtt_tls_port,
        use_auth: cli.use_auth,
        proxy: cli.proxy_mqtt,
        bridge_timeout: cli.bridge_timeout,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let tls_config = match tls::load_tls_config(&server_config.cert_path, &server_config.key_path) {
        Ok(cfg) => Some(Arc::new(cfg)),
        Err(e) => {
            warn!(error = %e, "TLS material unavailable, run with --generate-cert for a dev certificate");
            None
        }
    };

    let mut server = BumperServer::new(server_config);
    if let Err(e) = server.start(tls_config).await {
        error!(error = %e, "failed to start server");
        std::process::exit(1);
    }

    shutdown_signal().await;
    info!("received shutdown signal");
    server.shutdown().await;
    info!("bumper-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
