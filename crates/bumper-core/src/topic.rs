//! Peer-to-peer command topics.
//!
//! `iot/p2p/{cmd}/{sender}/{senderClass}/{senderRes}/{recipient}/{recipientClass}/{recipientRes}/{q|p}/{requestId}/{payloadType}`

use crate::error::{BumperError, BumperResult};
use std::fmt;

pub const SEG_KIND: usize = 1;
pub const SEG_COMMAND: usize = 2;
pub const SEG_SENDER: usize = 3;
pub const SEG_RECIPIENT: usize = 6;
pub const SEG_REQUEST_ID: usize = 10;
pub const SEG_PAYLOAD_TYPE: usize = 11;

/// Fewest segments a routable topic can have.
pub const MIN_SEGMENTS: usize = 7;
const P2P_SEGMENTS: usize = 12;

/// Payload-type marker for JSON bodies.
pub const PAYLOAD_JSON: &str = "j";

/// Whether a message is a request or its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Request => "q",
            Direction::Response => "p",
        }
    }
}

/// One end of a p2p exchange: `{id}/{class}/{resource}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    pub class: String,
    pub resource: String,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, class: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class: class.into(),
            resource: resource.into(),
        }
    }
}

/// Parsed p2p topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P2pTopic {
    pub command: String,
    pub sender: Endpoint,
    pub recipient: Endpoint,
    pub direction: Direction,
    pub request_id: String,
    pub payload_type: String,
}

impl P2pTopic {
    pub fn parse(topic: &str) -> BumperResult<Self> {
        let seg: Vec<&str> = topic.split('/').collect();
        if seg.len() != P2P_SEGMENTS || seg[0] != "iot" || seg[SEG_KIND] != "p2p" {
            return Err(BumperError::InvalidTopic(topic.to_string()));
        }
        let direction = match seg[9] {
            "q" => Direction::Request,
            "p" => Direction::Response,
            _ => return Err(BumperError::InvalidTopic(topic.to_string())),
        };
        Ok(Self {
            command: seg[SEG_COMMAND].to_string(),
            sender: Endpoint::new(seg[3], seg[4], seg[5]),
            recipient: Endpoint::new(seg[6], seg[7], seg[8]),
            direction,
            request_id: seg[SEG_REQUEST_ID].to_string(),
            payload_type: seg[SEG_PAYLOAD_TYPE].to_string(),
        })
    }
}

impl fmt::Display for P2pTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "iot/p2p/{}/{}/{}/{}/{}/{}/{}/{}/{}/{}",
            self.command,
            self.sender.id,
            self.sender.class,
            self.sender.resource,
            self.recipient.id,
            self.recipient.class,
            self.recipient.resource,
            self.direction.as_str(),
            self.request_id,
            self.payload_type
        )
    }
}

/// Segment `index` of a `/`-separated topic.
pub fn segment(topic: &str, index: usize) -> Option<&str> {
    topic.split('/').nth(index)
}

/// Copy of `topic` with segment `index` replaced.
pub fn replace_segment(topic: &str, index: usize, value: &str) -> BumperResult<String> {
    let mut seg: Vec<&str> = topic.split('/').collect();
    match seg.get_mut(index) {
        Some(slot) => *slot = value,
        None => {
            return Err(BumperError::InvalidTopic(format!(
                "{topic}: no segment {index}"
            )))
        }
    }
    Ok(seg.join("/"))
}

/// Exact or wildcard (`+`, `#`) topic filter match.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
