use thiserror::Error;

use crate::channels::{ChannelError, MessageTag};
use crate::runtime::shared_state::SharedStateError;
use crate::runtime::transport::TransportError;

/// Unified result type for the blockbus crate.
pub type Result<T> = std::result::Result<T, BlockError>;

/// Errors surfaced by blocks, the document and the host runtime.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("display mode `{0}` is not configured")]
    UnknownMode(String),
    #[error("block `{block}` requires element `{element}`")]
    MissingElement { block: String, element: String },
    #[error("region `{0}` not found")]
    RegionNotFound(String),
    #[error("region `{0}` already exists")]
    DuplicateRegion(String),
    #[error("unknown block `{0}`")]
    UnknownBlock(String),
    #[error("invalid declaration for `{block}`: {reason}")]
    Declaration { block: String, reason: String },
    #[error("{failures} handler(s) failed on `{channel}`/{tag}: {first}")]
    Delivery {
        channel: String,
        tag: MessageTag,
        failures: usize,
        first: String,
    },
    #[error("{failures} block(s) failed handling {event}: {first}")]
    Dispatch {
        event: String,
        failures: usize,
        first: Box<BlockError>,
    },
    #[error("document lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    SharedState(#[from] SharedStateError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BlockError {
    pub fn missing(block: &str, element: &str) -> Self {
        Self::MissingElement {
            block: block.to_string(),
            element: element.to_string(),
        }
    }

    pub fn declaration(block: &str, reason: impl Into<String>) -> Self {
        Self::Declaration {
            block: block.to_string(),
            reason: reason.into(),
        }
    }
}
