use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use tokio::sync::{mpsc, oneshot};
use tracing::instrument;

use crate::{
    events::{EventListeners, ListenerHandle, StoreEvents},
    request_executor::{AggressiveCachingGuard, RequestExecutor},
    run_document_store_actor, DocumentStoreActor, DocumentStoreBuilder, DocumentStoreError,
    DocumentStoreInitialConfiguration, DocumentStoreMessage,
};

/**
This a handle to the actor.

Only one DocumentStoreActor should exist per database cluster when possible to reduce resource
usage. Cloning this handle is very cheap and will not instantiate a new actor in the background.
It is recommended to clone this handle to each component that needs to talk to the
DocumentStoreActor.
When the last handle goes out of scope and it dropped, the backing actor will also be dropped.

```rust,no_run
# tokio_test::block_on(async {
use ravendb_http::DocumentStore;

let document_store: DocumentStore = DocumentStore::builder()
    .set_urls(&["http://localhost:8080"])
    .set_database_name("Northwind")
    .build()?;
let executor = document_store.get_request_executor(None).await?;
println!("DEBUG: {:?}", executor.topology());
# Ok::<(), anyhow::Error>(())
# });
```
*/
#[derive(Clone, Debug)]
pub struct DocumentStore {
    sender: mpsc::Sender<DocumentStoreMessage>,
    close_listeners: Arc<EventListeners<StoreEvents>>,
    closed: Arc<AtomicBool>,
}

impl DocumentStore {
    pub fn builder() -> DocumentStoreBuilder {
        DocumentStoreBuilder::default()
    }

    // This is pub(crate) so only the builder can crank it out
    pub(crate) fn new(initial_config: DocumentStoreInitialConfiguration) -> Self {
        let (sender, receiver) = mpsc::channel(8);
        let actor = DocumentStoreActor::new(receiver, initial_config);
        tokio::spawn(run_document_store_actor(actor));

        Self {
            sender,
            close_listeners: Arc::new(EventListeners::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The database used when an operation does not name one.
    pub async fn database(&self) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(DocumentStoreMessage::GetDatabase { respond_to: tx })
            .await;
        rx.await.ok().flatten()
    }

    /// Returns the executor for `database`, or for the store's default database when `None`.
    ///
    /// Database names are case-insensitive: `"Northwind"` and `"northwind"` share an executor.
    /// The executor is created on first request and lives until the store is closed.
    #[instrument(
        level = "debug",
        name = "Actor Handle - Get Request Executor",
        skip(self)
    )]
    pub async fn get_request_executor(
        &self,
        database: Option<&str>,
    ) -> Result<RequestExecutor, DocumentStoreError> {
        if self.is_closed() {
            return Err(DocumentStoreError::Closed);
        }

        tracing::trace!("Sending message to actor");
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DocumentStoreMessage::GetRequestExecutor {
                database_name: database.map(str::to_string),
                respond_to: tx,
            })
            .await
            .map_err(|_| DocumentStoreError::Closed)?;

        tracing::trace!("Waiting for oneshot to return");
        rx.await
            .context("DocumentStoreActor task has been killed")?
    }

    /// Aggressively caches responses of `database` for the duration configured in the
    /// conventions. See [`aggressively_cache_for`](Self::aggressively_cache_for).
    pub async fn aggressively_cache(
        &self,
        database: Option<&str>,
    ) -> Result<AggressiveCachingGuard, DocumentStoreError> {
        let executor = self.get_request_executor(database).await?;
        let duration = executor.conventions().aggressive_cache_duration();
        self.enable_aggressive_caching(executor, duration).await
    }

    /// Serves cached responses of `database` younger than `duration` without asking the server,
    /// until the returned guard is restored or dropped.
    ///
    /// When a change feed connector is configured, the feed is connected before caching starts
    /// so changes evict stale responses. If the connection fails, the error is returned and the
    /// caching setting is left as it was.
    #[instrument(
        level = "debug",
        name = "Actor Handle - Aggressively Cache",
        skip(self)
    )]
    pub async fn aggressively_cache_for(
        &self,
        duration: Duration,
        database: Option<&str>,
    ) -> Result<AggressiveCachingGuard, DocumentStoreError> {
        let executor = self.get_request_executor(database).await?;
        self.enable_aggressive_caching(executor, duration).await
    }

    async fn enable_aggressive_caching(
        &self,
        executor: RequestExecutor,
        duration: Duration,
    ) -> Result<AggressiveCachingGuard, DocumentStoreError> {
        if !executor.ensure_cache_evictor().await? {
            tracing::warn!(
                "No change feed connector configured for `{}`. Aggressively cached responses \
                 will only expire by age.",
                executor.database()
            );
        }
        Ok(executor.aggressively_cache_for(duration))
    }

    /// Turns aggressive caching off for `database` until the returned guard is restored or
    /// dropped.
    pub async fn disable_aggressive_caching(
        &self,
        database: Option<&str>,
    ) -> Result<AggressiveCachingGuard, DocumentStoreError> {
        let executor = self.get_request_executor(database).await?;
        Ok(executor.disable_aggressive_caching())
    }

    /// The last error reported by the change feed of `database`, if one was connected.
    pub async fn last_changes_error(
        &self,
        database: Option<&str>,
    ) -> Result<Option<String>, DocumentStoreError> {
        let executor = self.get_request_executor(database).await?;
        Ok(executor.last_changes_error())
    }

    pub fn add_before_close_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.close_listeners.add(move |event| {
            if *event == StoreEvents::BeforeClose {
                listener()
            }
        })
    }

    pub fn add_after_close_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.close_listeners.add(move |event| {
            if *event == StoreEvents::AfterClose {
                listener()
            }
        })
    }

    pub fn remove_close_listener(&self, handle: ListenerHandle) -> bool {
        self.close_listeners.remove(handle)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes every request executor and its change feed. Only the first call does anything.
    #[instrument(level = "debug", name = "Actor Handle - Close", skip(self))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.close_listeners.emit(&StoreEvents::BeforeClose);

        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(DocumentStoreMessage::Close { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }

        self.close_listeners.emit(&StoreEvents::AfterClose);
        tracing::debug!("Document store closed.");
    }
}
