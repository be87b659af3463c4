//! Chunk decoder for the legacy stanza stream.
//!
//! TCP reads do not line up with stanza boundaries, and device firmware sends
//! stream tags that never close. Each chunk is normalized, wrapped in a
//! synthetic root and parsed; a chunk cut mid-element is held until the rest
//! arrives.

use crate::error::{BumperError, BumperResult};
use crate::stanza::{parse_document, Element, ParseFailure};

const STREAM_OPEN: &str = "<stream:stream";
const STREAM_CLOSE: &str = "</stream:stream>";

/// Largest partial stanza kept between reads.
pub const MAX_PENDING: usize = 64 * 1024;

/// Result of feeding one chunk.
#[derive(Debug)]
pub enum Decoded {
    /// Top-level elements, in arrival order.
    Stanzas(Vec<Element>),
    /// The peer closed its stream; nothing else in the chunk was parsed.
    StreamClosed,
    /// The chunk ended mid-element and is buffered.
    Pending,
}

/// Streaming stanza decoder: accumulates text and yields complete elements.
#[derive(Debug)]
pub struct StanzaDecoder {
    buffer: String,
    limit: usize,
}

impl Default for StanzaDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StanzaDecoder {
    pub fn new() -> Self {
        Self::with_limit(MAX_PENDING)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: String::new(),
            limit,
        }
    }

    /// Feed a chunk and return whatever it completes.
    ///
    /// On a parse error the buffer is discarded so the next chunk starts clean.
    pub fn feed(&mut self, chunk: &str) -> BumperResult<Decoded> {
        self.buffer.push_str(chunk);
        let text = strip_declarations(&self.buffer);

        if text.contains(STREAM_CLOSE) && !text.contains(STREAM_OPEN) {
            self.buffer.clear();
            return Ok(Decoded::StreamClosed);
        }

        let text = if text.contains(STREAM_OPEN) && !text.contains(STREAM_CLOSE) {
            self_close_stream_tags(&text)
        } else {
            text
        };

        if ends_inside_tag(&text) {
            return self.hold();
        }

        match parse_document(&format!("<root>{text}</root>")) {
            Ok(root) => {
                self.buffer.clear();
                Ok(Decoded::Stanzas(
                    root.children
                        .into_iter()
                        .filter_map(|n| match n {
                            crate::stanza::Node::Element(e) => Some(e),
                            crate::stanza::Node::Text(_) => None,
                        })
                        .collect(),
                ))
            }
            Err(ParseFailure::Incomplete) => self.hold(),
            Err(ParseFailure::Malformed(e)) => {
                self.buffer.clear();
                Err(e)
            }
        }
    }

    fn hold(&mut self) -> BumperResult<Decoded> {
        if self.buffer.len() > self.limit {
            let len = self.buffer.len();
            self.buffer.clear();
            return Err(BumperError::InvalidStanza(format!(
                "partial stanza exceeds {} bytes ({len})",
                self.limit
            )));
        }
        Ok(Decoded::Pending)
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes held waiting for the rest of a stanza.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn strip_declarations(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<?xml") {
        out.push_str(&rest[..start]);
        match rest[start..].find("?>") {
            Some(end) => rest = &rest[start + end + 2..],
            None => {
                // Unterminated declaration; keep it so the tag check holds it back.
                rest = &rest[start..];
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Rewrite every `<stream:stream ...>` open tag as self-closing.
fn self_close_stream_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 4);
    let mut rest = text;
    while let Some(start) = rest.find(STREAM_OPEN) {
        let Some(close) = rest[start..].find('>') else {
            break;
        };
        let end = start + close;
        out.push_str(&rest[..end]);
        if !rest[..end].ends_with('/') {
            out.push('/');
        }
        out.push('>');
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}

fn ends_inside_tag(text: &str) -> bool {
    match (text.rfind('<'), text.rfind('>')) {
        (Some(open), Some(close)) => open > close,
        (Some(_), None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stanzas(decoded: Decoded) -> Vec<Element> {
        match decoded {
            Decoded::Stanzas(s) => s,
            other => panic!("expected stanzas, got {other:?}"),
        }
    }

    #[test]
    fn bare_stream_open_is_repaired() {
        let mut dec = StanzaDecoder::new();
        let out = stanzas(
            dec.feed("<?xml version='1.0'?><stream:stream to='ls1ok3.ecorobot.net' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>")
                .unwrap(),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "stream");
        assert_eq!(out[0].attr("to"), Some("ls1ok3.ecorobot.net"));
        assert_eq!(out[0].ns.as_deref(), Some(crate::stanza::NS_STREAM));
        assert_eq!(out[0].default_ns.as_deref(), Some(crate::stanza::NS_CLIENT));
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn lone_stream_close_short_circuits() {
        let mut dec = StanzaDecoder::new();
        assert!(matches!(dec.feed("</stream:stream>").unwrap(), Decoded::StreamClosed));
    }

    #[test]
    fn concatenated_fragments_yield_each_element() {
        let mut dec = StanzaDecoder::new();
        let out = stanzas(
            dec.feed("<iq type='get' id='1'><ping xmlns='urn:xmpp:ping'/></iq><presence><status>hello</status></presence>")
                .unwrap(),
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].name, "iq");
        assert_eq!(out[1].find("status").unwrap().text(), "hello");
    }

    #[test]
    fn split_stanza_is_held_until_complete() {
        let mut dec = StanzaDecoder::new();
        assert!(matches!(dec.feed("<iq type='set' id='2'><query xmlns='com:ctl'>").unwrap(), Decoded::Pending));
        assert!(matches!(dec.feed("<ctl td='Clean'/></query").unwrap(), Decoded::Pending));
        let out = stanzas(dec.feed("></iq>").unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].first_element().unwrap().first_element().unwrap().attr("td"), Some("Clean"));
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn malformed_chunk_is_dropped() {
        let mut dec = StanzaDecoder::new();
        assert!(dec.feed("<a></b>").is_err());
        assert_eq!(dec.pending(), 0);
        let out = stanzas(dec.feed("<presence type='available'/>").unwrap());
        assert_eq!(out[0].attr("type"), Some("available"));
    }

    #[test]
    fn oversized_partial_is_rejected() {
        let mut dec = StanzaDecoder::with_limit(16);
        assert!(dec.feed("<iq type='set' id='123456789'>").is_err());
        assert_eq!(dec.pending(), 0);
    }
}
