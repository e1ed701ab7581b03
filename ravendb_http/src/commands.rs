//! Commands the request executor relies on itself, plus document loading as the canonical
//! cacheable read.
use anyhow::Context;
use bytes::Bytes;
use reqwest::{Method, Url};
use serde::Deserialize;

use crate::{
    raven_command::RavenCommand,
    server_node::ServerNode,
    topology::{DatabaseTopologyResponse, Topology},
};

/// Builds `{node}/{segments...}` with every segment percent-encoded.
fn node_url(node: &ServerNode, segments: &[&str]) -> anyhow::Result<Url> {
    let mut url = Url::parse(node.url())
        .with_context(|| format!("Node url `{}` is not a valid url", node.url()))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Node url `{}` cannot be a base", node.url()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn database_url(node: &ServerNode, segments: &[&str]) -> anyhow::Result<Url> {
    let mut all = vec!["databases", node.database()];
    all.extend_from_slice(segments);
    node_url(node, &all)
}

/// Downloads the topology of the node's database from `GET /topology?name={database}`.
#[derive(Debug, Default)]
pub struct GetDatabaseTopologyCommand {
    result: Option<Topology>,
}

impl GetDatabaseTopologyCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn result(&self) -> Option<&Topology> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Option<Topology> {
        self.result
    }
}

impl RavenCommand for GetDatabaseTopologyCommand {
    fn create_request(&self, node: &ServerNode) -> anyhow::Result<reqwest::Request> {
        let mut url = node_url(node, &["topology"])?;
        url.query_pairs_mut().append_pair("name", node.database());
        Ok(reqwest::Request::new(Method::GET, url))
    }

    fn set_response(&mut self, response: Option<Bytes>, _from_cache: bool) -> anyhow::Result<()> {
        // No body means the server does not know the database.
        self.result = match response {
            Some(body) => Some(
                serde_json::from_slice::<DatabaseTopologyResponse>(&body)
                    .context("Unable to deserialize database topology")?
                    .into(),
            ),
            None => None,
        };
        Ok(())
    }

    fn can_cache(&self) -> bool {
        false
    }

    fn is_read_request(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DatabaseStatistics {
    pub database_id: Option<String>,
    pub count_of_documents: i64,
    pub count_of_indexes: i64,
    pub last_doc_etag: Option<i64>,
}

/// `GET /databases/{database}/stats`. With `failure_check` set the server treats the call as a
/// health probe, which is how the speed test uses it.
#[derive(Debug, Default)]
pub struct GetStatisticsCommand {
    failure_check: bool,
    result: Option<DatabaseStatistics>,
}

impl GetStatisticsCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn health_check() -> Self {
        Self {
            failure_check: true,
            result: None,
        }
    }

    pub fn result(&self) -> Option<&DatabaseStatistics> {
        self.result.as_ref()
    }
}

impl RavenCommand for GetStatisticsCommand {
    fn create_request(&self, node: &ServerNode) -> anyhow::Result<reqwest::Request> {
        let mut url = database_url(node, &["stats"])?;
        if self.failure_check {
            url.query_pairs_mut().append_pair("failure", "check");
        }
        Ok(reqwest::Request::new(Method::GET, url))
    }

    fn set_response(&mut self, response: Option<Bytes>, _from_cache: bool) -> anyhow::Result<()> {
        let body = response.context("Statistics response had no body")?;
        self.result = Some(
            serde_json::from_slice(&body).context("Unable to deserialize database statistics")?,
        );
        Ok(())
    }

    fn can_cache(&self) -> bool {
        false
    }

    fn is_read_request(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
enum DocumentsQuery {
    ById(String),
    Paged {
        start: Option<i64>,
        page_size: Option<i64>,
    },
}

/// Loads one document by id, or a page of all documents, from `GET /databases/{db}/docs`.
///
/// The result is the raw JSON body (`{"Results": [...], "Includes": {...}}`). A missing
/// document leaves the result empty.
#[derive(Debug)]
pub struct GetDocumentsCommand {
    query: DocumentsQuery,
    result: Option<serde_json::Value>,
    from_cache: bool,
}

impl GetDocumentsCommand {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            query: DocumentsQuery::ById(id.into()),
            result: None,
            from_cache: false,
        }
    }

    pub fn paged(start: Option<i64>, page_size: Option<i64>) -> Self {
        Self {
            query: DocumentsQuery::Paged { start, page_size },
            result: None,
            from_cache: false,
        }
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    /// Whether the last response was served from the response cache.
    pub fn served_from_cache(&self) -> bool {
        self.from_cache
    }
}

impl RavenCommand for GetDocumentsCommand {
    fn create_request(&self, node: &ServerNode) -> anyhow::Result<reqwest::Request> {
        let mut url = database_url(node, &["docs"])?;
        match &self.query {
            DocumentsQuery::ById(id) => {
                url.query_pairs_mut().append_pair("id", id);
            }
            DocumentsQuery::Paged { start, page_size } => {
                let mut pairs = url.query_pairs_mut();
                if let Some(start) = start {
                    pairs.append_pair("start", &start.to_string());
                }
                if let Some(page_size) = page_size {
                    pairs.append_pair("pageSize", &page_size.to_string());
                }
            }
        }
        Ok(reqwest::Request::new(Method::GET, url))
    }

    fn set_response(&mut self, response: Option<Bytes>, from_cache: bool) -> anyhow::Result<()> {
        self.from_cache = from_cache;
        self.result = match response {
            Some(body) => Some(
                serde_json::from_slice(&body).context("Unable to deserialize documents")?,
            ),
            None => None,
        };
        Ok(())
    }

    fn is_read_request(&self) -> bool {
        true
    }
}
