//! Error taxonomy. Every inbound message is its own failure domain:
//! none of these propagate past the point where the message that triggered
//! them was handled, except the two fatal init-time variants.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("peer unreachable: {0}")]
    Transport(String),

    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("block references unknown parent")]
    InvalidParent,

    #[error("block length does not match parent.length + 1")]
    BadLength,

    #[error("digest {0} is not a known block")]
    Unknown(String),

    #[error("block does not reach genesis")]
    Orphan,

    #[error("proposal is stale: does not extend the longest notarized tip")]
    StaleProposal,

    #[error("voter already recorded for this block")]
    DuplicateVote,

    #[error("epoch ended before quorum was reached")]
    QuorumUnreached,

    #[error("recovery timed out after {0:?}")]
    RecoveryTimeout(std::time::Duration),

    // Ambient, process-fatal variants: these abort startup rather than
    // being handled per inbound message.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("persistence error: {0}")]
    Persistence(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Transport(e.to_string())
    }
}
