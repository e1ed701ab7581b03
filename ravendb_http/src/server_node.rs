use std::hash::{Hash, Hasher};

use serde::Deserialize;

/// A single member of a database's topology.
///
/// Two nodes are the same node when their url and database match. The cluster tag and role
/// are descriptive only and do not take part in equality, so a node keeps its identity across
/// topology refreshes that promote or demote it.
#[derive(Debug, Clone)]
pub struct ServerNode {
    url: String,
    database: String,
    cluster_tag: Option<String>,
    server_role: ServerRole,
}

impl ServerNode {
    pub fn new(url: impl AsRef<str>, database: impl Into<String>) -> Self {
        Self {
            url: normalize_url(url.as_ref()),
            database: database.into(),
            cluster_tag: None,
            server_role: ServerRole::default(),
        }
    }

    pub fn with_cluster_tag(mut self, cluster_tag: impl Into<String>) -> Self {
        self.cluster_tag = Some(cluster_tag.into());
        self
    }

    pub fn with_server_role(mut self, server_role: ServerRole) -> Self {
        self.server_role = server_role;
        self
    }

    /// Base url of the node, never ending with a slash.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn cluster_tag(&self) -> Option<&str> {
        self.cluster_tag.as_deref()
    }

    pub fn server_role(&self) -> ServerRole {
        self.server_role
    }
}

impl PartialEq for ServerNode {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url && self.database == other.database
    }
}

impl Eq for ServerNode {}

impl Hash for ServerNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
        self.database.hash(state);
    }
}

impl std::fmt::Display for ServerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cluster_tag {
            Some(tag) => write!(f, "{} [{}] ({})", self.url, tag, self.database),
            None => write!(f, "{} ({})", self.url, self.database),
        }
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Deserialize)]
pub enum ServerRole {
    #[default]
    None,
    Promotable,
    Member,
    Rehab,
}
