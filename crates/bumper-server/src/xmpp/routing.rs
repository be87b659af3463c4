//! Stanza routing between bound devices and apps.
//!
//! Routing never writes to a socket itself. It returns [`Action`]s for the
//! connection to apply: replies go back on the sender's own stream,
//! deliveries go through the peers' outbound channels.

use crate::connections::{ConnectionManager, PeerHandle};
use bumper_core::identity::{bare_address, canonical_user_address, SERVER_DOMAIN};
use bumper_core::stanza::{NS_CTL, NS_DISCO_INFO, NS_DISCO_ITEMS, NS_ROSTER, NS_STANZAS};
use bumper_core::{Element, PrincipalKind};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Host devices address when reporting to every listener.
const BROADCAST_HOST: &str = "de.ecorobot.net";
const ANDROID_BIND_HOST: &str = "rl.ecorobot.net";
const NS_SF: &str = "com:sf";
const PERMISSION_DENIED_PREFIX: &str = "permission denied, please contact ";
const FIRST_PARTY_PREFIXES: [&str; 2] = ["fuid_", "fusername_"];

#[derive(Debug)]
pub enum Action {
    /// Write to the sender's own stream.
    Reply(String),
    /// Queue on another connection.
    Deliver(PeerHandle, String),
    /// Tear the sender's connection down.
    Disconnect,
}

/// The bound connection a stanza arrived on.
#[derive(Debug, Clone, Copy)]
pub struct Origin<'a> {
    pub conn_id: u64,
    pub kind: PrincipalKind,
    pub principal_id: &'a str,
    pub resource: &'a str,
    pub address: &'a str,
}

/// Settings for errno 103 admin provisioning.
#[derive(Debug, Clone, Copy)]
pub struct ProvisionPolicy {
    pub enabled: bool,
    pub use_auth: bool,
}

pub struct Router {
    connections: Arc<ConnectionManager>,
    provisioning: ProvisionPolicy,
}

impl Router {
    pub fn new(connections: Arc<ConnectionManager>, provisioning: ProvisionPolicy) -> Self {
        Self {
            connections,
            provisioning,
        }
    }

    /// Route one top-level stanza from a Ready connection.
    pub async fn route(&self, origin: &Origin<'_>, stanza: &Element) -> Vec<Action> {
        match stanza.name.as_str() {
            "iq" => self.route_iq(origin, stanza).await,
            "presence" => presence(origin, stanza),
            other => {
                debug!(element = other, from = origin.address, "unrouted element");
                Vec::new()
            }
        }
    }

    async fn route_iq(&self, origin: &Origin<'_>, iq: &Element) -> Vec<Action> {
        if reports_error(iq) {
            error!(from = origin.address, stanza = %iq.to_xml(), "device reported an error");
        }

        let Some(child) = iq.first_element() else {
            return if matches!(iq.attr("type"), Some("result" | "set")) {
                self.relay_result(origin, iq).await
            } else {
                Vec::new()
            };
        };

        match child.name.as_str() {
            "ping" => self.ping(origin, iq).await,
            "query" if origin.kind == PrincipalKind::Device => self.relay_result(origin, iq).await,
            "query" => self.app_query(origin, iq, child).await,
            _ if matches!(iq.attr("type"), Some("result" | "set")) => self.relay_result(origin, iq).await,
            other => {
                debug!(child = other, from = origin.address, "unhandled iq");
                Vec::new()
            }
        }
    }

    async fn ping(&self, origin: &Origin<'_>, iq: &Element) -> Vec<Action> {
        let to = iq.attr("to");
        match to {
            Some(to) if to.contains('@') => {
                let stanza = with_from(iq, origin.address);
                self.deliver(origin, stanza, |p| p.matches(to)).await
            }
            _ => {
                let reply = Element::new("iq")
                    .with_attr("type", "result")
                    .with_attr("id", iq.attr("id").unwrap_or_default())
                    .with_attr("from", to.unwrap_or(SERVER_DOMAIN));
                vec![Action::Reply(reply.to_xml())]
            }
        }
    }

    async fn app_query(&self, origin: &Origin<'_>, iq: &Element, query: &Element) -> Vec<Action> {
        let ns = query.ns.as_deref().unwrap_or_default();
        if [NS_ROSTER, NS_DISCO_ITEMS, NS_DISCO_INFO].contains(&ns) {
            return vec![Action::Reply(not_implemented(iq.attr("id").unwrap_or_default()))];
        }

        let to = iq.attr("to");
        if iq.attr("type") == Some("set") && ns == NS_SF && to == Some(ANDROID_BIND_HOST) {
            let reply = Element::new("iq")
                .with_attr("id", iq.attr("id").unwrap_or_default())
                .with_attr("to", format!("{}@{SERVER_DOMAIN}/{}", origin.principal_id, origin.resource))
                .with_attr("from", ANDROID_BIND_HOST)
                .with_attr("type", "result");
            return vec![Action::Reply(reply.to_xml())];
        }

        let Some(to) = to else {
            debug!(from = origin.address, "app query without destination");
            return Vec::new();
        };
        let stanza = with_from(iq, origin.address);
        self.deliver(origin, stanza, |p| p.kind == PrincipalKind::Device && p.matches(to))
            .await
    }

    async fn relay_result(&self, origin: &Origin<'_>, iq: &Element) -> Vec<Action> {
        let to = iq.attr("to");

        if let Some(ctl) = find_ctl(iq) {
            if ctl.attr("errno") == Some("103") {
                if origin.kind != PrincipalKind::Device {
                    return Vec::new();
                }
                let Some(replies) = provision_admin(ctl, to, origin.address, self.provisioning) else {
                    debug!(from = origin.address, "errno 103 without provisioning");
                    return Vec::new();
                };
                info!(
                    device = origin.address,
                    "device reports no permission for user, adding user to device"
                );
                return replies.into_iter().map(Action::Reply).collect();
            }
        }

        let stanza = with_from(iq, origin.address);
        match to {
            Some(to) if to.contains('@') && to != BROADCAST_HOST => {
                let canonical = canonical_user_address(to);
                // Device answers go to apps; anything else to whoever matches.
                let apps_only = origin.kind == PrincipalKind::Device;
                self.deliver(origin, stanza, |p| {
                    (!apps_only || p.kind == PrincipalKind::App) && p.matches(&canonical)
                })
                .await
            }
            _ => self.deliver(origin, stanza, |_| true).await,
        }
    }

    /// Deliver to every Ready peer except the sender that `pred` accepts.
    async fn deliver<F>(&self, origin: &Origin<'_>, stanza: String, pred: F) -> Vec<Action>
    where
        F: Fn(&PeerHandle) -> bool,
    {
        let sender = origin.conn_id;
        let peers = self
            .connections
            .for_each_ready(|p| p.conn_id != sender && pred(p))
            .await;
        debug!(from = origin.address, peers = peers.len(), "relaying stanza");
        peers
            .into_iter()
            .map(|peer| Action::Deliver(peer, stanza.clone()))
            .collect()
    }
}

fn presence(origin: &Origin<'_>, stanza: &Element) -> Vec<Action> {
    let dummy = Element::new("presence")
        .with_attr("to", origin.address)
        .with_text(" dummy ")
        .to_xml();

    if stanza.find("status").is_some() {
        let mut actions = vec![Action::Reply(dummy)];
        if origin.kind == PrincipalKind::Device {
            let info = Element::new("iq")
                .with_attr("type", "set")
                .with_attr("id", "14")
                .with_attr("to", origin.address)
                .with_attr("from", SERVER_DOMAIN)
                .with_child(
                    Element::new("query")
                        .with_ns(NS_CTL)
                        .with_child(Element::new("ctl").with_ns(NS_CTL).with_attr("td", "GetDeviceInfo")),
                );
            actions.push(Action::Reply(info.to_xml()));
        }
        return actions;
    }

    match stanza.attr("type") {
        Some("unavailable") => {
            debug!(from = origin.address, "presence unavailable");
            vec![Action::Disconnect]
        }
        _ => vec![Action::Reply(dummy)],
    }
}

fn with_from(stanza: &Element, from: &str) -> String {
    if stanza.attr("from").is_some() {
        return stanza.to_xml();
    }
    let mut stanza = stanza.clone();
    stanza.set_attr("from", from);
    stanza.to_xml()
}

fn not_implemented(id: &str) -> String {
    Element::new("iq")
        .with_attr("type", "error")
        .with_attr("id", id)
        .with_child(
            Element::new("error")
                .with_attr("type", "cancel")
                .with_attr("code", "501")
                .with_child(Element::new("feature-not-implemented").with_ns(NS_STANZAS)),
        )
        .to_xml()
}

fn find_ctl(iq: &Element) -> Option<&Element> {
    iq.find("query").and_then(|q| q.find("ctl"))
}

/// Whether a device stanza carries an error report worth surfacing.
fn reports_error(iq: &Element) -> bool {
    find_ctl(iq).is_some_and(|ctl| {
        ctl.attr("errno").is_some()
            || ctl.attr("errs").is_some()
            || ctl.attr("td") == Some("error")
            || ctl.attr("td") == Some("DeviceAlert")
    })
}

fn random_iq_id() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

/// The three iqs that make the reported admin grant the addressed user full
/// access, or `None` when provisioning does not apply.
pub fn provision_admin(
    ctl: &Element,
    to: Option<&str>,
    device_address: &str,
    policy: ProvisionPolicy,
) -> Option<Vec<String>> {
    if !policy.enabled || policy.use_auth {
        return None;
    }
    let to = to?;
    let admin: String = match ctl.attr("error") {
        Some(err) => err.replace(PERMISSION_DENIED_PREFIX, "").replace(' ', ""),
        None => ctl.attr("admin")?.to_string(),
    };
    if admin.is_empty() || FIRST_PARTY_PREFIXES.iter().any(|p| admin.starts_with(p)) {
        return None;
    }
    let user = bare_address(to);

    let command = |ctl: Element| {
        Element::new("iq")
            .with_attr("type", "set")
            .with_attr("id", random_iq_id())
            .with_attr("from", admin.as_str())
            .with_attr("to", device_address)
            .with_child(Element::new("query").with_ns(NS_CTL).with_child(ctl))
            .to_xml()
    };

    let add_user = Element::new("ctl")
        .with_ns(NS_CTL)
        .with_attr("td", "AddUser")
        .with_attr("id", "0000")
        .with_attr("jid", user);

    let mut acs = Element::new("acs").with_ns(NS_CTL);
    for name in ["userman", "setting", "clean"] {
        acs = acs.with_child(
            Element::new("ac")
                .with_ns(NS_CTL)
                .with_attr("name", name)
                .with_attr("allow", "1"),
        );
    }
    let set_acs = Element::new("ctl")
        .with_ns(NS_CTL)
        .with_attr("td", "SetAC")
        .with_attr("id", "1111")
        .with_attr("jid", user)
        .with_child(acs);

    let user_info = Element::new("ctl")
        .with_ns(NS_CTL)
        .with_attr("td", "GetUserInfo")
        .with_attr("id", "4444");

    Some(vec![command(add_user), command(set_acs), command(user_info)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumper_core::stanza::parse_document;
    use tokio::sync::mpsc;

    const POLICY: ProvisionPolicy = ProvisionPolicy {
        enabled: true,
        use_auth: false,
    };

    fn parse(xml: &str) -> Element {
        parse_document(xml).unwrap()
    }

    fn origin<'a>(conn_id: u64, kind: PrincipalKind, id: &'a str, address: &'a str) -> Origin<'a> {
        Origin {
            conn_id,
            kind,
            principal_id: id,
            resource: "IOS1",
            address,
        }
    }

    async fn peer(
        mgr: &ConnectionManager,
        conn_id: u64,
        kind: PrincipalKind,
        id: &str,
    ) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        mgr.add(PeerHandle::new(conn_id, kind, id, format!("{id}@x"), tx)).await;
        mgr.mark_ready(conn_id).await;
        rx
    }

    fn delivered(actions: &[Action]) -> Vec<(u64, String)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Deliver(p, s) => Some((p.conn_id, s.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn server_ping_is_answered_locally() {
        let router = Router::new(Arc::new(ConnectionManager::new()), POLICY);
        let o = origin(1, PrincipalKind::Device, "E0001", "E0001@ls1ok3.ecorobot.net/atom");
        let actions = router
            .route(&o, &parse("<iq type='get' id='p1' to='ecouser.net'><ping xmlns='urn:xmpp:ping'/></iq>"))
            .await;
        assert!(matches!(&actions[..], [Action::Reply(r)] if r == "<iq type='result' id='p1' from='ecouser.net'/>"));
    }

    #[tokio::test]
    async fn app_ctl_goes_to_matching_devices_only() {
        let mgr = Arc::new(ConnectionManager::new());
        let _bot = peer(&mgr, 2, PrincipalKind::Device, "E0001").await;
        let _other_bot = peer(&mgr, 3, PrincipalKind::Device, "E0002").await;
        let _app = peer(&mgr, 4, PrincipalKind::App, "e0001").await;
        let router = Router::new(mgr, POLICY);

        let o = origin(1, PrincipalKind::App, "fuid_1", "fuid_1@ecouser.net/IOS1");
        let actions = router
            .route(
                &o,
                &parse("<iq type='set' id='5' to='E0001@ls1ok3.ecorobot.net/atom'><query xmlns='com:ctl'><ctl td='Clean'/></query></iq>"),
            )
            .await;
        let out = delivered(&actions);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 2);
        assert_eq!(
            out[0].1,
            "<iq type='set' id='5' to='E0001@ls1ok3.ecorobot.net/atom' from='fuid_1@ecouser.net/IOS1'><query xmlns='com:ctl'><ctl td='Clean'/></query></iq>"
        );
    }

    #[tokio::test]
    async fn unsupported_app_queries_get_501() {
        let router = Router::new(Arc::new(ConnectionManager::new()), POLICY);
        let o = origin(1, PrincipalKind::App, "fuid_1", "fuid_1@ecouser.net/IOS1");
        let actions = router
            .route(&o, &parse("<iq type='get' id='r1'><query xmlns='jabber:iq:roster'/></iq>"))
            .await;
        assert!(matches!(&actions[..], [Action::Reply(r)] if r.contains("code='501'") && r.contains("id='r1'")));
    }

    #[tokio::test]
    async fn android_bind_is_acknowledged() {
        let router = Router::new(Arc::new(ConnectionManager::new()), POLICY);
        let o = origin(1, PrincipalKind::App, "fuid_1", "fuid_1@ecouser.net/IOS1");
        let actions = router
            .route(&o, &parse("<iq type='set' id='a1' to='rl.ecorobot.net'><query xmlns='com:sf'/></iq>"))
            .await;
        assert!(matches!(
            &actions[..],
            [Action::Reply(r)] if r == "<iq id='a1' to='fuid_1@ecouser.net/IOS1' from='rl.ecorobot.net' type='result'/>"
        ));
    }

    #[tokio::test]
    async fn app_result_reaches_any_matching_peer() {
        let mgr = Arc::new(ConnectionManager::new());
        let _bot = peer(&mgr, 2, PrincipalKind::Device, "E0001").await;
        let _app = peer(&mgr, 3, PrincipalKind::App, "fuid_2").await;
        let router = Router::new(mgr, POLICY);

        let o = origin(1, PrincipalKind::App, "fuid_1", "fuid_1@ecouser.net/IOS1");
        let actions = router
            .route(
                &o,
                &parse("<iq type='result' id='7' to='E0001@ls1ok3.ecorobot.net/atom'><ctl td='GetUserInfo'/></iq>"),
            )
            .await;
        let out = delivered(&actions);
        assert_eq!(out.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![2]);
        assert!(out[0].1.contains("from='fuid_1@ecouser.net/IOS1'"));
    }

    #[tokio::test]
    async fn device_result_goes_to_canonical_app_address() {
        let mgr = Arc::new(ConnectionManager::new());
        let _app = peer(&mgr, 2, PrincipalKind::App, "fuid_1").await;
        let _other_app = peer(&mgr, 3, PrincipalKind::App, "fuid_2").await;
        let _bot = peer(&mgr, 4, PrincipalKind::Device, "fuid_1").await;
        let router = Router::new(mgr, POLICY);

        let o = origin(1, PrincipalKind::Device, "E0001", "E0001@ls1ok3.ecorobot.net/atom");
        let actions = router
            .route(
                &o,
                &parse("<iq type='result' id='5' to='fuid_1@bumper.ecorobot.net/IOS1'><query xmlns='com:ctl'><ctl ret='ok'/></query></iq>"),
            )
            .await;
        let out = delivered(&actions);
        assert_eq!(out.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![2]);
        assert!(out[0].1.contains("from='E0001@ls1ok3.ecorobot.net/atom'"));
    }

    #[tokio::test]
    async fn broadcast_reaches_each_other_peer_once() {
        let mgr = Arc::new(ConnectionManager::new());
        let _a = peer(&mgr, 1, PrincipalKind::Device, "E0001").await;
        let _b = peer(&mgr, 2, PrincipalKind::App, "fuid_1").await;
        let _c = peer(&mgr, 3, PrincipalKind::App, "fuid_2").await;
        let router = Router::new(mgr, POLICY);

        let o = origin(1, PrincipalKind::Device, "E0001", "E0001@ls1ok3.ecorobot.net/atom");
        let actions = router
            .route(
                &o,
                &parse("<iq type='set' id='9' to='de.ecorobot.net'><query xmlns='com:ctl'><ctl td='ChargeState'/></query></iq>"),
            )
            .await;
        let mut ids: Vec<u64> = delivered(&actions).into_iter().map(|(id, _)| id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn presence_variants() {
        let router = Router::new(Arc::new(ConnectionManager::new()), POLICY);
        let bot = origin(1, PrincipalKind::Device, "E0001", "E0001@ls1ok3.ecorobot.net/atom");
        let actions = router.route(&bot, &parse("<presence><status>hello world</status></presence>")).await;
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], Action::Reply(r) if r == "<presence to='E0001@ls1ok3.ecorobot.net/atom'> dummy </presence>"));
        assert!(matches!(&actions[1], Action::Reply(r) if r.contains("td='GetDeviceInfo'") && r.contains("id='14'")));

        let app = origin(2, PrincipalKind::App, "fuid_1", "fuid_1@ecouser.net/IOS1");
        let actions = router.route(&app, &parse("<presence type='unavailable'/>")).await;
        assert!(matches!(&actions[..], [Action::Disconnect]));
        let actions = router.route(&app, &parse("<presence type='available'/>")).await;
        assert!(matches!(&actions[..], [Action::Reply(_)]));
    }

    #[test]
    fn provisioning_builds_three_commands() {
        let ctl = parse("<ctl errno='103' error='permission denied, please contact vendor_admin '/>");
        let out = provision_admin(&ctl, Some("fuid_1@ecouser.net/IOS1"), "E0001@ls1ok3.ecorobot.net/atom", POLICY)
            .unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|s| s.contains("from='vendor_admin' to='E0001@ls1ok3.ecorobot.net/atom'")));
        assert!(out[0].contains("td='AddUser' id='0000' jid='fuid_1@ecouser.net'"));
        assert!(out[1].contains("td='SetAC' id='1111'"));
        assert!(out[1].contains("<ac name='userman' allow='1'/><ac name='setting' allow='1'/><ac name='clean' allow='1'/>"));
        assert!(out[2].contains("td='GetUserInfo' id='4444'"));
    }

    #[test]
    fn provisioning_gate() {
        let device = "E0001@ls1ok3.ecorobot.net/atom";
        let to = Some("fuid_1@ecouser.net/IOS1");
        let by_admin_attr = parse("<ctl errno='103' admin='vendor_admin'/>");
        assert!(provision_admin(&by_admin_attr, to, device, POLICY).is_some());

        let first_party = parse("<ctl errno='103' admin='fuid_9'/>");
        assert!(provision_admin(&first_party, to, device, POLICY).is_none());
        let first_party = parse("<ctl errno='103' error='permission denied, please contact fusername_x'/>");
        assert!(provision_admin(&first_party, to, device, POLICY).is_none());

        assert!(provision_admin(&by_admin_attr, None, device, POLICY).is_none());
        let with_auth = ProvisionPolicy { enabled: true, use_auth: true };
        assert!(provision_admin(&by_admin_attr, to, device, with_auth).is_none());
        let disabled = ProvisionPolicy { enabled: false, use_auth: false };
        assert!(provision_admin(&by_admin_attr, to, device, disabled).is_none());

        let no_admin = parse("<ctl errno='103'/>");
        assert!(provision_admin(&no_admin, to, device, POLICY).is_none());
    }

    #[tokio::test]
    async fn errno_103_from_device_is_not_relayed() {
        let mgr = Arc::new(ConnectionManager::new());
        let _app = peer(&mgr, 2, PrincipalKind::App, "fuid_1").await;
        let router = Router::new(mgr, POLICY);
        let o = origin(1, PrincipalKind::Device, "E0001", "E0001@ls1ok3.ecorobot.net/atom");
        let actions = router
            .route(
                &o,
                &parse("<iq type='result' id='7' to='fuid_1@ecouser.net/IOS1'><query xmlns='com:ctl'><ctl errno='103' admin='vendor_admin'/></query></iq>"),
            )
            .await;
        assert_eq!(actions.len(), 3);
        assert!(delivered(&actions).is_empty());
    }
}
