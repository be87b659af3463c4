//! Stream-level replies sent during the handshake.

use bumper_core::identity::SERVER_DOMAIN;
use bumper_core::stanza::{NS_BIND, NS_PING, NS_SASL, NS_SESSION, NS_TLS};
use bumper_core::Element;
use rand::Rng;

pub const STREAM_CLOSE: &str = "</stream:stream>";

pub fn stream_header(stream_id: &str) -> String {
    format!(
        "<stream:stream xmlns:stream='http://etherx.jabber.org/streams' xmlns='jabber:client' version='1.0' id='{stream_id}' from='{SERVER_DOMAIN}'>"
    )
}

pub fn generate_stream_id() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

fn features(children: Vec<Element>) -> String {
    let inner: String = children.iter().map(Element::to_xml).collect();
    format!("<stream:features>{inner}</stream:features>")
}

fn plain_mechanism() -> Element {
    Element::new("mechanisms")
        .with_ns(NS_SASL)
        .with_child(Element::new("mechanism").with_ns(NS_SASL).with_text("PLAIN"))
}

/// Features before authentication, depending on the TLS latch.
pub fn auth_features(tls_upgraded: bool) -> String {
    if tls_upgraded {
        features(vec![plain_mechanism()])
    } else {
        features(vec![
            Element::new("starttls")
                .with_ns(NS_TLS)
                .with_child(Element::new("required").with_ns(NS_TLS)),
            plain_mechanism(),
        ])
    }
}

/// Features after authentication.
pub fn bind_features() -> String {
    features(vec![
        Element::new("bind").with_ns(NS_BIND),
        Element::new("session").with_ns(NS_SESSION),
    ])
}

pub fn tls_proceed() -> String {
    Element::new("proceed").with_ns(NS_TLS).to_xml()
}

pub fn tls_failure() -> String {
    Element::new("failure").with_ns(NS_TLS).to_xml()
}

pub fn sasl_success() -> String {
    Element::new("success").with_ns(NS_SASL).to_xml()
}

pub fn sasl_failure() -> String {
    Element::new("failure")
        .with_ns(NS_SASL)
        .with_child(Element::new("not-authorized").with_ns(NS_SASL))
        .to_xml()
}

pub fn bind_result(id: &str, address: &str) -> String {
    Element::new("iq")
        .with_attr("type", "result")
        .with_attr("id", id)
        .with_child(
            Element::new("bind")
                .with_ns(NS_BIND)
                .with_child(Element::new("jid").with_ns(NS_BIND).with_text(address)),
        )
        .to_xml()
}

pub fn empty_result(id: &str) -> String {
    Element::new("iq")
        .with_attr("type", "result")
        .with_attr("id", id)
        .to_xml()
}

/// Server-to-client keepalive ping.
pub fn keepalive_ping(address: &str) -> String {
    Element::new("iq")
        .with_attr("from", SERVER_DOMAIN)
        .with_attr("to", address)
        .with_attr("id", "s2c1")
        .with_attr("type", "get")
        .with_child(Element::new("ping").with_ns(NS_PING))
        .to_xml()
}
