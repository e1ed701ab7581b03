use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify, OnceCell};
use tracing::instrument;

use crate::{
    changes::{ChangesError, DatabaseChangesConnector},
    document_conventions::DocumentConventions,
    events::{EventListeners, ListenerHandle, RequestEvents},
    http_cache::ResponseCache,
    node_selector::{FailedNodes, NodeSelector},
    raven_command::RavenCommand,
    server_node::ServerNode,
    topology::Topology,
};

use super::{
    request_executor_actor::run_request_executor_actor,
    request_executor_shared::{AttemptError, ExecutorShared},
    AggressiveCacheOptions, AggressiveCachingGuard, ChangeFeedEvictor, RequestExecutorActor,
    RequestExecutorError, RequestExecutorMessage,
};

/// Everything a [`RequestExecutor`] needs besides its urls and database.
#[derive(Debug, Clone, Default)]
pub struct RequestExecutorOptions {
    /// Reqwest client maintains an internal connection pool. Share it between executors that
    /// talk to the same cluster.
    pub http_client: reqwest::Client,
    pub conventions: DocumentConventions,
    /// Source of change notifications for aggressive caching. Without one, aggressively cached
    /// responses are only bounded by their age.
    pub changes_connector: Option<Arc<dyn DatabaseChangesConnector>>,
}

/**
Executes commands against one database of a RavenDB cluster.

One executor exists per database and is shared by everyone working with that database.
Cloning this handle is very cheap; all clones drive the same node selector, response cache and
background topology refresher. The background work stops when [`close`](Self::close) is called
or the last handle is dropped.
*/
#[derive(Clone, Debug)]
pub struct RequestExecutor {
    shared: Arc<ExecutorShared>,
    sender: Option<mpsc::Sender<RequestExecutorMessage>>,
}

impl RequestExecutor {
    /// Creates an executor for a cluster. The topology is downloaded from the first reachable
    /// url on the first `execute` and refreshed in the background afterwards.
    ///
    /// Fails with [`RequestExecutorError::MissingUrls`] when `initial_urls` is empty.
    pub fn new<T: AsRef<str>>(
        initial_urls: &[T],
        database: &str,
        options: RequestExecutorOptions,
    ) -> Result<Self, RequestExecutorError> {
        let Some(first_url) = initial_urls.first() else {
            tracing::error!(database, "A request executor needs at least one url");
            return Err(RequestExecutorError::MissingUrls);
        };
        if options.conventions.disable_topology_updates() {
            return Ok(Self::new_for_single_node(
                first_url.as_ref(),
                database,
                options,
            ));
        }

        let initial_urls = initial_urls
            .iter()
            .map(|url| url.as_ref().trim_end_matches('/').to_string())
            .collect::<Vec<_>>();
        let selector = NodeSelector::new(Topology::from_initial_urls(&initial_urls, database));
        let shared = Arc::new(Self::shared_state(database, initial_urls, selector, options));

        let (sender, receiver) = mpsc::channel(8);
        let actor = RequestExecutorActor::new(receiver, shared.clone());
        tokio::spawn(run_request_executor_actor(actor));

        Ok(Self {
            shared,
            sender: Some(sender),
        })
    }

    /// Creates an executor that always talks to `url`: no topology download, no background
    /// refresh and no failover.
    pub fn new_for_single_node(url: &str, database: &str, options: RequestExecutorOptions) -> Self {
        let node = ServerNode::new(url, database);
        let selector = NodeSelector::new_single_node(node.clone());
        let shared = Self::shared_state(database, vec![node.url().to_string()], selector, options);
        Self {
            shared: Arc::new(shared),
            sender: None,
        }
    }

    fn shared_state(
        database: &str,
        initial_urls: Vec<String>,
        node_selector: NodeSelector,
        options: RequestExecutorOptions,
    ) -> ExecutorShared {
        ExecutorShared {
            database: database.to_string(),
            initial_urls,
            conventions: options.conventions,
            http_client: options.http_client,
            node_selector: RwLock::new(node_selector),
            cache: ResponseCache::new(),
            aggressive_caching: Mutex::new(None),
            first_topology_update: OnceCell::new(),
            cache_evictor: OnceCell::new(),
            changes_connector: options.changes_connector,
            events: EventListeners::new(),
            topology_refresh_requested: Notify::new(),
            closed: Default::default(),
        }
    }

    /// Sends `command` to the cluster, failing over between nodes until one of them answers.
    ///
    /// Node failures (transport errors, timeouts, `5xx`) move on to the next node. Errors that
    /// another node cannot fix, such as a missing database or a bad request, are returned right
    /// away. When every node failed, [`RequestExecutorError::AllNodesFailed`] lists each node's
    /// cause.
    #[instrument(
        level = "debug",
        name = "RequestExecutor - Execute",
        skip(self, command),
        fields(database = %self.shared.database)
    )]
    pub async fn execute<C>(&self, command: &mut C) -> Result<(), RequestExecutorError>
    where
        C: RavenCommand + ?Sized,
    {
        if self.shared.is_closed() {
            return Err(RequestExecutorError::Closed);
        }
        self.ensure_topology().await?;

        let single_node = self.shared.is_single_node();
        let read_request = command.is_read_request();
        let mut failed_nodes = FailedNodes::default();

        let result = loop {
            let node = self.shared.node_selector.read().pick(&failed_nodes, read_request);
            let Some(node) = node else {
                break Err(RequestExecutorError::AllNodesFailed {
                    failed_nodes: failed_nodes.clone(),
                });
            };

            match self.shared.send_to_node(&node, command).await {
                Ok(()) => {
                    self.shared.node_selector.write().mark_succeeded(&node);
                    break Ok(());
                }
                Err(AttemptError::Node(failure)) => {
                    tracing::warn!("Request to {} failed: {}", &node, &failure);
                    self.shared.node_selector.write().mark_failed(&node);
                    failed_nodes.insert(node, failure);
                    if single_node {
                        break Err(RequestExecutorError::AllNodesFailed {
                            failed_nodes: failed_nodes.clone(),
                        });
                    }
                }
                Err(AttemptError::Fatal(e)) => break Err(e),
            }
        };

        command.set_failed_nodes(failed_nodes);
        result
    }

    /// Runs the first topology update exactly once, however many callers arrive together.
    async fn ensure_topology(&self) -> Result<(), RequestExecutorError> {
        if self.shared.is_single_node() {
            return Ok(());
        }
        self.shared
            .first_topology_update
            .get_or_try_init(|| self.first_topology_update())
            .await?;
        Ok(())
    }

    /// Tries the configured urls in order until one of them hands out the topology.
    ///
    /// If none does, the executor keeps working from the configured urls and leaves it to the
    /// background refresh to find the real topology. A missing database is the exception: it
    /// fails the call, since no node can serve it.
    #[instrument(level = "debug", skip(self), fields(database = %self.shared.database))]
    async fn first_topology_update(&self) -> Result<(), RequestExecutorError> {
        let mut database_missing = false;
        for url in &self.shared.initial_urls {
            let node = ServerNode::new(url, &self.shared.database);
            match self.shared.fetch_topology(&node).await {
                Ok(topology) => {
                    tracing::info!("Initial topology update complete");
                    self.shared.apply_topology(topology);
                    self.send(RequestExecutorMessage::RunSpeedTest);
                    return Ok(());
                }
                Err(AttemptError::Fatal(RequestExecutorError::DatabaseDoesNotExist(_))) => {
                    database_missing = true;
                }
                Err(AttemptError::Fatal(e)) => {
                    tracing::warn!("Unable to fetch topology from {}: {}", &node, e);
                }
                Err(AttemptError::Node(failure)) => {
                    tracing::warn!("Unable to fetch topology from {}: {}", &node, failure);
                }
            }
        }

        if database_missing {
            return Err(RequestExecutorError::DatabaseDoesNotExist(
                self.shared.database.clone(),
            ));
        }

        tracing::warn!("No url provided a topology, falling back to the configured urls");
        self.send(RequestExecutorMessage::RunSpeedTest);
        Ok(())
    }

    fn send(&self, msg: RequestExecutorMessage) {
        if let Some(sender) = &self.sender {
            // A full queue already holds work that covers this message.
            let _ = sender.try_send(msg);
        }
    }

    /// Asks the background actor to refresh the topology now.
    pub fn request_topology_update(&self) {
        self.send(RequestExecutorMessage::UpdateTopology);
    }

    /// Refreshes the topology and waits for the result. Returns whether a newer topology was
    /// installed.
    pub async fn update_topology(&self) -> Result<bool, RequestExecutorError> {
        if self.shared.is_single_node() {
            return Ok(false);
        }
        self.shared.update_topology().await
    }

    pub fn database(&self) -> &str {
        &self.shared.database
    }

    pub fn conventions(&self) -> &DocumentConventions {
        &self.shared.conventions
    }

    pub fn topology(&self) -> Topology {
        self.shared.node_selector.read().topology().clone()
    }

    pub fn topology_etag(&self) -> i64 {
        self.shared.node_selector.read().etag()
    }

    /// Node preferred for reads after the speed test, if it ran.
    pub fn fastest_node(&self) -> Option<ServerNode> {
        self.shared.node_selector.read().fastest().cloned()
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.shared.cache
    }

    pub fn add_request_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&RequestEvents) + Send + Sync + 'static,
    {
        self.shared.events.add(listener)
    }

    pub fn remove_request_listener(&self, handle: ListenerHandle) -> bool {
        self.shared.events.remove(handle)
    }

    pub fn aggressive_caching(&self) -> Option<AggressiveCacheOptions> {
        *self.shared.aggressive_caching.lock()
    }

    /// Replaces the aggressive caching setting and returns the previous one.
    pub fn set_aggressive_caching(
        &self,
        options: Option<AggressiveCacheOptions>,
    ) -> Option<AggressiveCacheOptions> {
        std::mem::replace(&mut *self.shared.aggressive_caching.lock(), options)
    }

    /// Serves cached responses younger than `duration` without asking the server, until the
    /// returned guard is dropped.
    pub fn aggressively_cache_for(&self, duration: Duration) -> AggressiveCachingGuard {
        let previous = self.set_aggressive_caching(Some(AggressiveCacheOptions::new(duration)));
        AggressiveCachingGuard::new(self.clone(), previous)
    }

    /// Turns aggressive caching off until the returned guard is dropped.
    pub fn disable_aggressive_caching(&self) -> AggressiveCachingGuard {
        let previous = self.set_aggressive_caching(None);
        AggressiveCachingGuard::new(self.clone(), previous)
    }

    /// Starts the change feed evictor if it is not running yet.
    ///
    /// Concurrent first callers share a single connection attempt. If it fails, every one of
    /// them gets the error and the next call tries again. Returns `Ok(false)` when no change
    /// feed connector is configured.
    #[instrument(level = "debug", skip(self), fields(database = %self.shared.database))]
    pub async fn ensure_cache_evictor(&self) -> Result<bool, ChangesError> {
        let Some(connector) = self.shared.changes_connector.clone() else {
            return Ok(false);
        };
        self.shared
            .cache_evictor
            .get_or_try_init(|| {
                ChangeFeedEvictor::connect(
                    connector,
                    &self.shared.database,
                    self.shared.cache.clone(),
                    &self.shared.conventions,
                )
            })
            .await?;
        Ok(true)
    }

    pub fn cache_evictor(&self) -> Option<&ChangeFeedEvictor> {
        self.shared.cache_evictor.get()
    }

    /// Last error seen by the change feed evictor, if it was started.
    pub fn last_changes_error(&self) -> Option<String> {
        self.cache_evictor().and_then(|evictor| evictor.last_error())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stops background work and the change feed. Later calls to `execute` fail with
    /// [`RequestExecutorError::Closed`]. An evictor that was never started stays untouched.
    #[instrument(level = "debug", skip(self), fields(database = %self.shared.database))]
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sender) = &self.sender {
            let _ = sender.send(RequestExecutorMessage::Close).await;
        }
        if let Some(evictor) = self.shared.cache_evictor.get() {
            evictor.close();
        }
        self.shared.events.clear();
        tracing::debug!("Request executor closed.");
    }
}
