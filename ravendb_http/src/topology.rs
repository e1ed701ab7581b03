use serde::Deserialize;

use crate::server_node::{ServerNode, ServerRole};

/// Cluster tag given to nodes that were made up from the configured urls because no real
/// topology could be fetched.
pub const UNKNOWN_CLUSTER_TAG: &str = "!";

/// The versioned, ordered list of nodes serving one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Represents the latest version of the topology
    pub etag: i64,
    /// Holds the nodes, in failover order.
    pub nodes: Vec<ServerNode>,
}

impl Topology {
    pub fn new(etag: i64, nodes: Vec<ServerNode>) -> Self {
        Self { etag, nodes }
    }

    /// A topology built from the configured urls rather than downloaded from the server.
    ///
    /// Its etag is lower than any etag a server hands out, so the first real topology always
    /// replaces it.
    pub fn from_initial_urls<T: AsRef<str>>(urls: &[T], database: &str) -> Self {
        let nodes = urls
            .iter()
            .map(|url| ServerNode::new(url, database).with_cluster_tag(UNKNOWN_CLUSTER_TAG))
            .collect();
        Self { etag: -1, nodes }
    }

    /// A fixed topology of one node, used when topology updates are disabled.
    pub fn single_node(node: ServerNode) -> Self {
        Self {
            etag: -1,
            nodes: vec![node],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Body of `GET /topology?name={database}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DatabaseTopologyResponse {
    pub nodes: Vec<ServerNodeResponse>,
    pub etag: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerNodeResponse {
    pub url: String,
    pub cluster_tag: Option<String>,
    pub database: String,
    #[serde(default)]
    pub server_role: ServerRole,
}

impl From<DatabaseTopologyResponse> for Topology {
    fn from(response: DatabaseTopologyResponse) -> Self {
        let nodes = response
            .nodes
            .into_iter()
            .map(|n| {
                let node = ServerNode::new(n.url, n.database).with_server_role(n.server_role);
                match n.cluster_tag {
                    Some(tag) => node.with_cluster_tag(tag),
                    None => node,
                }
            })
            .collect();
        Topology {
            etag: response.etag,
            nodes,
        }
    }
}
