//! Keeps aggressively cached responses honest by listening to the database's change feed.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::{task::JoinHandle, time::Duration};
use url::form_urlencoded;

use crate::{
    changes::{ChangeStream, ChangesError, DatabaseChange, DatabaseChangesConnector},
    document_conventions::DocumentConventions,
    http_cache::ResponseCache,
};

/// Listens to one database's change notifications and evicts the cached responses they make
/// stale.
///
/// Document changes drop every cached url that loads that document by id and then invalidate
/// the whole cache, since queries and pages may contain the document too. Any other change, or
/// a dropped connection, only invalidates the whole cache. Invalidated entries stay around as
/// validators for conditional requests.
pub struct ChangeFeedEvictor {
    database: String,
    last_error: Arc<Mutex<Option<String>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ChangeFeedEvictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeedEvictor")
            .field("database", &self.database)
            .field("last_error", &self.last_error())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChangeFeedEvictor {
    /// Opens the change feed and starts evicting. Fails if the first connection cannot be made;
    /// later drops are retried in the background.
    #[tracing::instrument(
        level = "debug",
        name = "ChangeFeedEvictor - Connect",
        skip(connector, cache, conventions)
    )]
    pub async fn connect(
        connector: Arc<dyn DatabaseChangesConnector>,
        database: &str,
        cache: ResponseCache,
        conventions: &DocumentConventions,
    ) -> Result<Self, ChangesError> {
        let stream = connector.connect(database).await?;
        tracing::debug!("Change feed connected, evicting cached responses on changes.");

        let last_error = Arc::new(Mutex::new(None));
        let listener = tokio::spawn(listen(
            connector,
            database.to_string(),
            cache,
            stream,
            last_error.clone(),
            Backoff::new(
                conventions.changes_reconnect_delay(),
                conventions.changes_max_reconnect_delay(),
            ),
        ));

        Ok(Self {
            database: database.to_string(),
            last_error,
            listener: Mutex::new(Some(listener)),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// The most recent connection problem, if any. Errors never leave the evictor otherwise.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn close(&self) {
        if let Some(listener) = self.listener.lock().take() {
            tracing::debug!(database = %self.database, "Closing change feed evictor");
            listener.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .map(|listener| listener.is_finished())
            .unwrap_or(true)
    }
}

impl Drop for ChangeFeedEvictor {
    fn drop(&mut self) {
        self.close();
    }
}

async fn listen(
    connector: Arc<dyn DatabaseChangesConnector>,
    database: String,
    cache: ResponseCache,
    mut stream: ChangeStream,
    last_error: Arc<Mutex<Option<String>>>,
    mut backoff: Backoff,
) {
    loop {
        while let Some(notification) = stream.recv().await {
            match notification {
                Ok(change) => evict_for_change(&cache, &change),
                Err(e) => {
                    tracing::warn!(database = %database, "Change feed reported an error: {}", e);
                    *last_error.lock() = Some(e.to_string());
                }
            }
        }

        // Changes may have been missed while disconnected.
        cache.invalidate();
        let lost = ChangesError::ConnectionLost(format!("change feed of `{}` closed", database));
        tracing::warn!("{}", &lost);
        *last_error.lock() = Some(lost.to_string());

        stream = loop {
            let delay = backoff.next_delay();
            tracing::debug!(database = %database, "Reconnecting change feed in {:?}", delay);
            tokio::time::sleep(delay).await;
            match connector.connect(&database).await {
                Ok(stream) => {
                    tracing::info!(database = %database, "Change feed reconnected");
                    backoff.reset();
                    cache.invalidate();
                    break stream;
                }
                Err(e) => {
                    tracing::warn!(database = %database, "Change feed reconnect failed: {}", e);
                    *last_error.lock() = Some(e.to_string());
                }
            }
        };
    }
}

fn evict_for_change(cache: &ResponseCache, change: &DatabaseChange) {
    if let DatabaseChange::Document { id, .. } = change {
        let id_parameter = format!(
            "id={}",
            form_urlencoded::byte_serialize(id.as_bytes()).collect::<String>()
        );
        let evicted = cache.evict_matching(|url| url_has_parameter(url, &id_parameter));
        tracing::trace!("Evicted {} cached responses for document `{}`", evicted, id);
    }
    cache.invalidate();
}

fn url_has_parameter(url: &str, parameter: &str) -> bool {
    url.split_once('?')
        .map(|(_, query)| query.split('&').any(|pair| pair == parameter))
        .unwrap_or(false)
}

/// Exponential reconnect delay with a little jitter.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = (base.as_millis() / 4) as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        base + Duration::from_millis(jitter)
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}
