use std::{collections::HashMap, net::IpAddr, sync::Arc};

use tokio::sync::oneshot;

use crate::{
    changes::DatabaseChangesConnector, document_conventions::DocumentConventions,
    request_executor::RequestExecutor, DocumentStoreError,
};

pub type DnsOverrides = HashMap<String, IpAddr>;

#[derive(Debug)]
pub enum DocumentStoreMessage {
    /// Returns the executor for the named database, or the default database when `None`,
    /// creating it on first use.
    GetRequestExecutor {
        database_name: Option<String>,
        respond_to: oneshot::Sender<Result<RequestExecutor, DocumentStoreError>>,
    },
    GetDatabase {
        respond_to: oneshot::Sender<Option<String>>,
    },
    /// Closes every executor and refuses new ones afterwards.
    Close { respond_to: oneshot::Sender<()> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentStoreState {
    /// [`DocumentStore`](crate::DocumentStore) is initialized.
    Initialized,

    /// [`DocumentStore`](crate::DocumentStore) was initialized but has since been closed.
    Closed,
}

/// Everything the builder hands to a new [`DocumentStoreActor`](crate::DocumentStoreActor).
#[derive(Debug)]
pub struct DocumentStoreInitialConfiguration {
    pub(crate) changes_connector: Option<Arc<dyn DatabaseChangesConnector>>,
    pub(crate) conventions: DocumentConventions,
    pub(crate) database_name: Option<String>,
    pub(crate) http_client: reqwest::Client,
    pub(crate) initial_urls: Vec<String>,
}
