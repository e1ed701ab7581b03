use std::time::Duration;

use crate::{error_chain_fmt, node_selector::FailedNodes};

#[derive(thiserror::Error)]
pub enum RequestExecutorError {
    #[error("All nodes failed to process the request:\n{failed_nodes}")]
    AllNodesFailed { failed_nodes: FailedNodes },
    #[error("Database `{0}` does not exist")]
    DatabaseDoesNotExist(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Invalid authorization, ensure valid certificate supplied: {0}")]
    BadAuthorization(String),
    #[error("Concurrency conflict: {0}")]
    Conflict(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Server responded with unexpected status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },
    #[error("A request executor needs at least one url")]
    MissingUrls,
    #[error("The request executor has been closed")]
    Closed,
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for RequestExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl RequestExecutorError {
    /// Nodes that failed before the call gave up. `None` for errors that were not retried.
    pub fn failed_nodes(&self) -> Option<&FailedNodes> {
        match self {
            RequestExecutorError::AllNodesFailed { failed_nodes } => Some(failed_nodes),
            _ => None,
        }
    }
}

/// Why a single node could not serve one attempt. These failures are retried on the next node.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeFailure {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server responded with {status}: {message}")]
    ServerError { status: u16, message: String },
}
