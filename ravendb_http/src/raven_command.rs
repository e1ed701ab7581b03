//! The raven commands are the only way to directly interact with the server.
//!
//! A command knows how to build its HTTP request for a given node and how to read the response
//! back. It knows nothing about which node it is sent to, retries, or caching; the
//! [`RequestExecutor`](crate::RequestExecutor) takes care of those and never looks at concrete
//! command types.
use async_trait::async_trait;
use bytes::Bytes;

use crate::{node_selector::FailedNodes, server_node::ServerNode};

/// How the executor should treat the body of a successful response.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    /// The body is buffered, possibly cached, and passed to [`RavenCommand::set_response`].
    #[default]
    Object,
    /// The body is ignored.
    Empty,
    /// The live response is handed to [`RawResponseCommand::set_response_raw`] unbuffered.
    Raw,
}

pub trait RavenCommand: Send {
    /// Builds the request to send to `node`.
    fn create_request(&self, node: &ServerNode) -> anyhow::Result<reqwest::Request>;

    /// Receives the response body, or `None` when the server sent no content (or answered
    /// `404`). `from_cache` is set when the body came out of the response cache.
    fn set_response(&mut self, response: Option<Bytes>, from_cache: bool) -> anyhow::Result<()>;

    fn response_type(&self) -> ResponseType {
        ResponseType::Object
    }

    fn can_cache(&self) -> bool {
        true
    }

    fn can_cache_aggressively(&self) -> bool {
        true
    }

    /// Reads may be served by the fastest node; writes always follow the topology order.
    fn is_read_request(&self) -> bool {
        false
    }

    /// Commands with [`ResponseType::Raw`] expose their raw-response handler here.
    fn as_raw_response(&mut self) -> Option<&mut dyn RawResponseCommand> {
        None
    }

    /// Called once per `execute` with the nodes that failed on the way, for diagnostics.
    fn set_failed_nodes(&mut self, _failed_nodes: FailedNodes) {}
}

/// Capability of commands that consume the response as a stream instead of a buffered body.
#[async_trait]
pub trait RawResponseCommand: Send {
    async fn set_response_raw(&mut self, response: reqwest::Response) -> anyhow::Result<()>;
}

/// Strips the quotes the server puts around change vectors in `ETag` headers.
pub(crate) fn etag_header(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

/// Reads a numeric header such as `Topology-Etag`.
pub(crate) fn numeric_header(response: &reqwest::Response, name: &str) -> Option<i64> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim_matches('"').parse().ok())
}
