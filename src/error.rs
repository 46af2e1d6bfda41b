use crate::peer::PeerId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures scoped to a single peer or a single action. None of them are fatal
/// to the server; the connection loop logs them and keeps going.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),

    #[error("relay target {0:?} is not a peer id")]
    InvalidTarget(String),

    #[error("rate limit exceeded for peer {0}")]
    RateLimited(PeerId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
