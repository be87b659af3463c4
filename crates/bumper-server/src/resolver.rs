//! Name resolution for the vendor broker.
//!
//! The host running the bridge usually has the vendor domains pointed at
//! itself, so the system resolver cannot be trusted for them. Lookups go to
//! explicit public nameservers first and fall back to the system resolver.

use bumper_core::{BumperError, BumperResult};
use std::net::{IpAddr, SocketAddr};
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;
use tracing::{debug, info, warn};

pub struct UpstreamResolver {
    resolver: Option<TokioAsyncResolver>,
}

impl UpstreamResolver {
    /// Resolver using `nameservers`; an empty list means system only.
    pub fn new(nameservers: &[IpAddr]) -> Self {
        let resolver = (!nameservers.is_empty()).then(|| {
            let group = NameServerConfigGroup::from_ips_clear(nameservers, 53, true);
            TokioAsyncResolver::tokio(ResolverConfig::from_parts(None, vec![], group), ResolverOpts::default())
        });
        Self { resolver }
    }

    /// Resolve `host` to one address, preferring the configured nameservers.
    pub async fn resolve(&self, host: &str, port: u16) -> BumperResult<SocketAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        if let Some(resolver) = &self.resolver {
            match resolver.lookup_ip(host).await {
                Ok(lookup) => {
                    if let Some(ip) = lookup.iter().next() {
                        info!(host, ip = %ip, "resolved via configured nameservers");
                        return Ok(SocketAddr::new(ip, port));
                    }
                    debug!(host, "nameservers returned no records");
                }
                Err(e) => warn!(host, error = %e, "lookup via configured nameservers failed"),
            }
        }

        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| BumperError::Transport(format!("resolve {host}: {e}")))?;
        let addr = addrs
            .next()
            .ok_or_else(|| BumperError::Transport(format!("resolve {host}: no addresses")))?;
        info!(host, ip = %addr.ip(), "resolved via system resolver");
        Ok(addr)
    }
}
