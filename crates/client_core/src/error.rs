use thiserror::Error;

/// The transport could not establish or authenticate its channel. The
/// transport retries automatically; this surfaces only from an explicit
/// `connect` call.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),
    #[error("broker handshake failed: {0}")]
    Handshake(String),
    #[error("invalid broker endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

/// Device or permission failure while acquiring local media. Always aborts
/// the call attempt and resets the engine to idle.
#[derive(Debug, Error)]
pub enum MediaAccessError {
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
    #[error("no capture device available for {0}")]
    NoDevice(String),
}

/// A frame the codec could not classify. Dropped and logged, never
/// propagated past the dispatch layer.
#[derive(Debug, Error)]
#[error("unclassifiable frame on {topic}: {reason}")]
pub struct MalformedFrameError {
    pub topic: String,
    pub reason: String,
}

impl MalformedFrameError {
    pub fn new(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

/// REST history fetch failure. The conversation degrades to live-only.
#[derive(Debug, Error)]
#[error("history fetch failed for {conversation}: {source}")]
pub struct HistoryFetchError {
    pub conversation: String,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaAccessError),
    #[error("another call is already in progress")]
    Busy,
    #[error("no pending incoming call")]
    NoPendingCall,
    #[error("peer connection failure: {0}")]
    Peer(String),
}
