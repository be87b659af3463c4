use thiserror::Error;

/// Errors produced by the bumper protocol layer.
#[derive(Debug, Error)]
pub enum BumperError {
    #[error("xml error: {0}")]
    Xml(String),

    #[error("invalid stanza: {0}")]
    InvalidStanza(String),

    #[error("protocol violation: {from} -> {to}")]
    ProtocolViolation { from: String, to: String },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("invalid client id: {0}")]
    InvalidClientId(String),

    #[error("auth code error: {0}")]
    AuthCode(String),

    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("mqtt error: {0}")]
    Mqtt(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<quick_xml::Error> for BumperError {
    fn from(e: quick_xml::Error) -> Self {
        BumperError::Xml(e.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for BumperError {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        BumperError::Xml(e.to_string())
    }
}

pub type BumperResult<T> = Result<T, BumperError>;
