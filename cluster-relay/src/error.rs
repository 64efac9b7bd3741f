use std::fmt;
use thiserror::Error;

/// The local operation that failed to find a target site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingOp {
    Subscribe,
    Unsubscribe,
    Publish,
}

impl RoutingOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Publish => "publish",
        }
    }
}

impl fmt::Display for RoutingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Faults reported by a single broker connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("Ack timed out")]
    AckTimeout,

    #[error("Subscription rejected: {0}")]
    SubscribeRejected(String),

    #[error("Transport failure: {0}")]
    Failed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(
        "Could not find a matching {op} target broker for the {channel} channel - The broker may be down"
    )]
    Routing { op: RoutingOp, channel: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Publish to {channel} on {site} failed: {source}")]
    PublishFailure {
        site: String,
        channel: String,
        source: TransportError,
    },

    #[error("Coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    #[error("Invalid site URI: {0}")]
    InvalidSite(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn routing(op: RoutingOp, channel: impl Into<String>) -> Self {
        Self::Routing {
            op,
            channel: channel.into(),
        }
    }

    pub fn coordinator(msg: impl Into<String>) -> Self {
        Self::CoordinatorUnavailable(msg.into())
    }

    pub fn invalid_site(msg: impl Into<String>) -> Self {
        Self::InvalidSite(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
