use thiserror::Error;

use crate::search::SearchError;

/// Errors raised by the protocol plumbing (transport, framing, dispatch).
///
/// Tool-level failures are carried in [`SearchError`] and folded into this
/// type at the handler seam; inside `tools/call` handling every variant is
/// recovered into a flagged text reply rather than surfaced as a JSON-RPC
/// error.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("JSON serialization error: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// The peer closed the stream (stdin reached EOF). Loop-exit signal,
    /// not a fault.
    #[error("transport closed by peer")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error(transparent)]
    Search(#[from] SearchError),
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Serialization(err.to_string())
    }
}
