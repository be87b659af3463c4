//! Namespace-aware element tree for legacy XMPP stanzas.
//!
//! Elements carry their resolved namespace explicitly. Serialization emits an
//! `xmlns` declaration only where an element's namespace differs from the one
//! in scope, so relayed stanzas never pick up serializer-invented prefixes.

use crate::error::{BumperError, BumperResult};
use quick_xml::escape::{escape, partial_escape};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fmt::Write as _;

/// Default namespace of a client stream; stanzas in it serialize without `xmlns`.
pub const NS_CLIENT: &str = "jabber:client";
pub const NS_STREAM: &str = "http://etherx.jabber.org/streams";
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const NS_SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub const NS_PING: &str = "urn:xmpp:ping";
pub const NS_CTL: &str = "com:ctl";
pub const NS_ROSTER: &str = "jabber:iq:roster";
pub const NS_DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
pub const NS_DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";

/// Child node of an element.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// A parsed or constructed XML element.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    /// Local name, without prefix.
    pub name: String,
    /// Prefix as written on the wire (`stream` for `stream:features`).
    pub prefix: Option<String>,
    /// Resolved namespace URI, if any was in scope.
    pub ns: Option<String>,
    /// Default namespace in scope where the element was parsed. Not serialized.
    pub default_ns: Option<String>,
    /// Attributes in document order, excluding namespace declarations.
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_ns(mut self, ns: impl Into<String>) -> Self {
        self.ns = Some(ns.into());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set or replace an attribute, keeping its original position.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    /// True if the element has this local name and (when given) namespace.
    pub fn is(&self, name: &str, ns: Option<&str>) -> bool {
        self.name == name && ns.map_or(true, |ns| self.ns.as_deref() == Some(ns))
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn first_element(&self) -> Option<&Element> {
        self.elements().next()
    }

    pub fn find(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Serialize as a stanza inside a `jabber:client` stream.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out, Some(NS_CLIENT));
        out
    }

    fn write_into(&self, out: &mut String, scope_ns: Option<&str>) {
        out.push('<');
        if let Some(prefix) = &self.prefix {
            out.push_str(prefix);
            out.push(':');
        }
        out.push_str(&self.name);

        let own_ns = self.ns.as_deref();
        let mut child_scope = scope_ns;
        match (&self.prefix, own_ns) {
            (Some(prefix), Some(ns)) => {
                let _ = write!(out, " xmlns:{}='{}'", prefix, escape(ns));
            }
            (None, Some(ns)) if Some(ns) != scope_ns => {
                let _ = write!(out, " xmlns='{}'", escape(ns));
                child_scope = Some(ns);
            }
            _ => {}
        }

        for (k, v) in &self.attrs {
            let _ = write!(out, " {}='{}'", k, escape(v.as_str()));
        }

        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(e) => e.write_into(out, child_scope),
                Node::Text(t) => out.push_str(&partial_escape(t.as_str())),
            }
        }
        out.push_str("</");
        if let Some(prefix) = &self.prefix {
            out.push_str(prefix);
            out.push(':');
        }
        out.push_str(&self.name);
        out.push('>');
    }
}

/// Why a document failed to parse.
#[derive(Debug)]
pub enum ParseFailure {
    /// Input ended inside an element; more bytes may complete it.
    Incomplete,
    Malformed(BumperError),
}

impl From<BumperError> for ParseFailure {
    fn from(e: BumperError) -> Self {
        ParseFailure::Malformed(e)
    }
}

impl From<quick_xml::Error> for ParseFailure {
    fn from(e: quick_xml::Error) -> Self {
        ParseFailure::Malformed(e.into())
    }
}

/// Namespace declarations made by one open element.
type Scope = Vec<(Option<String>, String)>;

fn split_qname(raw: &[u8]) -> (Option<String>, String) {
    let s = String::from_utf8_lossy(raw);
    match s.split_once(':') {
        Some((p, l)) => (Some(p.to_string()), l.to_string()),
        None => (None, s.into_owned()),
    }
}

fn resolve(scopes: &[Scope], prefix: Option<&str>) -> Option<String> {
    scopes.iter().rev().find_map(|scope| {
        scope
            .iter()
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, ns)| ns.clone())
    })
}

fn open_element(start: &BytesStart<'_>, scopes: &mut Vec<Scope>) -> Result<Element, ParseFailure> {
    let (prefix, name) = split_qname(start.name().as_ref());
    let mut scope = Scope::new();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(BumperError::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        if key == "xmlns" {
            scope.push((None, value));
        } else if let Some(p) = key.strip_prefix("xmlns:") {
            scope.push((Some(p.to_string()), value));
        } else {
            attrs.push((key, value));
        }
    }
    scopes.push(scope);
    let ns = resolve(scopes, prefix.as_deref());
    let default_ns = resolve(scopes, None);
    Ok(Element {
        name,
        prefix,
        ns,
        default_ns,
        attrs,
        children: Vec::new(),
    })
}

/// Parse one complete document and return its root element.
pub fn parse_document(xml: &str) -> Result<Element, ParseFailure> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().check_end_names = false;

    let mut scopes: Vec<Scope> = Vec::new();
    let mut stack: Vec<Element> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                let el = open_element(&start, &mut scopes)?;
                stack.push(el);
            }
            Event::Empty(start) => {
                let el = open_element(&start, &mut scopes)?;
                scopes.pop();
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(el)),
                    None => return Ok(el),
                }
            }
            Event::End(end) => {
                let (_, name) = split_qname(end.name().as_ref());
                let Some(el) = stack.pop() else {
                    return Err(ParseFailure::Malformed(BumperError::Xml(format!(
                        "unexpected end tag </{name}>"
                    ))));
                };
                scopes.pop();
                if el.name != name {
                    // The outermost element closed over one still open.
                    if stack.first().is_some_and(|outer| outer.name == name) {
                        return Err(ParseFailure::Incomplete);
                    }
                    return Err(ParseFailure::Malformed(BumperError::Xml(format!(
                        "mismatched end tag: expected </{}>, found </{name}>",
                        el.name
                    ))));
                }
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(el)),
                    None => return Ok(el),
                }
            }
            Event::Text(text) => {
                let text = text.unescape()?;
                // Indentation between elements is not content.
                if text.trim().is_empty() {
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.children.push(Node::Text(text.into_owned()));
                }
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    let raw = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    top.children.push(Node::Text(raw));
                }
            }
            Event::Eof => {
                return Err(if stack.is_empty() {
                    ParseFailure::Malformed(BumperError::Xml("empty document".into()))
                } else {
                    ParseFailure::Incomplete
                });
            }
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
        }
    }
}
