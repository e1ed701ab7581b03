use std::{
    collections::{hash_map::Entry, HashMap},
    sync::Arc,
};

use tokio::sync::mpsc;
use tracing::{instrument, Span};
use uuid::Uuid;

use crate::{
    changes::DatabaseChangesConnector,
    document_conventions::DocumentConventions,
    request_executor::{RequestExecutor, RequestExecutorOptions},
    DocumentStoreError, DocumentStoreInitialConfiguration, DocumentStoreMessage,
    DocumentStoreState,
};

/// Owns the registry of request executors, one per database.
///
/// All registry access goes through this actor's mailbox, so creating an executor on first use
/// is naturally insert-if-absent: two callers asking for the same database always share one
/// executor.
pub struct DocumentStoreActor {
    changes_connector: Option<Arc<dyn DatabaseChangesConnector>>,
    conventions: DocumentConventions,
    database_name: Option<String>,
    http_client: reqwest::Client,
    initial_urls: Vec<String>,
    receiver: mpsc::Receiver<DocumentStoreMessage>,
    /// Keyed by lowercase database name.
    request_executors: HashMap<String, RequestExecutor>,
    state: DocumentStoreState,
}

impl DocumentStoreActor {
    pub fn new(
        receiver: mpsc::Receiver<DocumentStoreMessage>,
        initial_config: DocumentStoreInitialConfiguration,
    ) -> Self {
        Self {
            changes_connector: initial_config.changes_connector,
            conventions: initial_config.conventions,
            database_name: initial_config.database_name,
            http_client: initial_config.http_client,
            initial_urls: initial_config.initial_urls,
            receiver,
            request_executors: HashMap::default(),
            state: DocumentStoreState::Initialized,
        }
    }

    /// Message handler for the DocumentStoreActor
    #[instrument(
        level = "debug",
        name = "DocumentStore Actor - Handle Message",
        skip(self),
        fields(correlation_id)
    )]
    async fn handle_message(&mut self, msg: DocumentStoreMessage) {
        // Apply a correlation id to all child spans of this message handler
        Span::current().record("correlation_id", Uuid::new_v4().to_string().as_str());
        match msg {
            DocumentStoreMessage::GetDatabase { respond_to } => {
                let _ = respond_to.send(self.database_name.clone());
            }
            DocumentStoreMessage::GetRequestExecutor {
                database_name,
                respond_to,
            } => {
                let result = self.get_request_executor(database_name);
                let _ = respond_to.send(result);
            }
            DocumentStoreMessage::Close { respond_to } => {
                self.close().await;
                let _ = respond_to.send(());
            }
        }
    }

    /// See doc comments for [`DocumentStore`](crate::DocumentStore::get_request_executor)
    #[instrument(level = "debug", skip(self))]
    fn get_request_executor(
        &mut self,
        database: Option<String>,
    ) -> Result<RequestExecutor, DocumentStoreError> {
        if self.state == DocumentStoreState::Closed {
            return Err(DocumentStoreError::Closed);
        }

        // Get the database name that was passed in, or from the document store
        let database = database
            .or_else(|| self.database_name.clone())
            .ok_or(DocumentStoreError::NoDatabase)?;

        let initial_urls = &self.initial_urls;
        let options = RequestExecutorOptions {
            http_client: self.http_client.clone(),
            conventions: self.conventions.clone(),
            changes_connector: self.changes_connector.clone(),
        };
        let executor = match self.request_executors.entry(database.to_lowercase()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                tracing::debug!("Creating request executor for `{}`", &database);
                let executor = RequestExecutor::new(initial_urls, &database, options)?;
                entry.insert(executor).clone()
            }
        };

        Ok(executor)
    }

    #[instrument(level = "debug", name = "DocumentStore Actor - Close", skip(self))]
    async fn close(&mut self) {
        self.state = DocumentStoreState::Closed;
        for (database, executor) in self.request_executors.drain() {
            tracing::trace!("Closing request executor for `{}`", database);
            executor.close().await;
        }
    }
}

#[instrument(level = "debug", name = "Running Document Store Actor", skip(actor))]
pub async fn run_document_store_actor(mut actor: DocumentStoreActor) {
    while let Some(msg) = actor.receiver.recv().await {
        actor.handle_message(msg).await;
    }
    tracing::debug!("Document store actor stopped.");
}
