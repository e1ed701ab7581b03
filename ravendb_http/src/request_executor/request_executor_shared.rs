//! State shared by every clone of a [`RequestExecutor`](super::RequestExecutor) and its
//! background actor, plus the single-attempt request path.
//!
//! Locks here are held for a few field reads or writes at most and never across an `.await`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::{Mutex, RwLock};
use reqwest::{
    header::{HeaderName, HeaderValue, IF_NONE_MATCH},
    Method, StatusCode,
};
use tokio::{
    sync::{Notify, OnceCell},
    task::JoinSet,
    time::{Duration, Instant},
};

use crate::{
    changes::DatabaseChangesConnector,
    commands::{GetDatabaseTopologyCommand, GetStatisticsCommand},
    document_conventions::DocumentConventions,
    events::{EventListeners, RequestEvents},
    http_cache::ResponseCache,
    node_selector::NodeSelector,
    raven_command::{etag_header, numeric_header, RavenCommand, ResponseType},
    ravendb_error::ServerErrorPayload,
    server_node::ServerNode,
    topology::Topology,
};

use super::{AggressiveCacheOptions, ChangeFeedEvictor, NodeFailure, RequestExecutorError};

const TOPOLOGY_ETAG_HEADER: &str = "Topology-Etag";
const REFRESH_TOPOLOGY_HEADER: &str = "Refresh-Topology";
const DATABASE_MISSING_HEADER: &str = "Database-Missing";

/// Outcome of one attempt against one node.
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// The node could not serve the request; another node might.
    Node(NodeFailure),
    /// Retrying elsewhere cannot help.
    Fatal(RequestExecutorError),
}

pub(crate) struct ExecutorShared {
    pub(crate) database: String,
    pub(crate) initial_urls: Vec<String>,
    pub(crate) conventions: DocumentConventions,
    pub(crate) http_client: reqwest::Client,
    pub(crate) node_selector: RwLock<NodeSelector>,
    pub(crate) cache: ResponseCache,
    pub(crate) aggressive_caching: Mutex<Option<AggressiveCacheOptions>>,
    pub(crate) first_topology_update: OnceCell<()>,
    pub(crate) cache_evictor: OnceCell<ChangeFeedEvictor>,
    pub(crate) changes_connector: Option<Arc<dyn DatabaseChangesConnector>>,
    pub(crate) events: EventListeners<RequestEvents>,
    /// Wakes the actor for an out-of-band topology refresh.
    pub(crate) topology_refresh_requested: Notify,
    pub(crate) closed: AtomicBool,
}

impl std::fmt::Debug for ExecutorShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorShared")
            .field("database", &self.database)
            .field("initial_urls", &self.initial_urls)
            .field("topology_etag", &self.node_selector.read().etag())
            .field("cached_responses", &self.cache.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ExecutorShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_single_node(&self) -> bool {
        self.node_selector.read().is_fixed()
    }

    pub(crate) fn request_topology_refresh(&self) {
        if !self.is_single_node() && !self.is_closed() {
            self.topology_refresh_requested.notify_one();
        }
    }

    /// Installs `topology` if it is newer than the current one.
    pub(crate) fn apply_topology(&self, topology: Topology) -> bool {
        let etag = topology.etag;
        let applied = self.node_selector.write().try_update_topology(topology);
        if applied {
            tracing::info!(database = %self.database, etag, "Topology updated and stored.");
            self.events.emit(&RequestEvents::TopologyUpdated {
                database: self.database.clone(),
                etag,
            });
        } else {
            tracing::debug!(database = %self.database, etag, "Discarding stale topology.");
        }
        applied
    }

    pub(crate) async fn fetch_topology(
        &self,
        node: &ServerNode,
    ) -> Result<Topology, AttemptError> {
        let mut command = GetDatabaseTopologyCommand::new();
        self.send_to_node(node, &mut command).await?;
        command.into_result().ok_or_else(|| {
            AttemptError::Fatal(RequestExecutorError::DatabaseDoesNotExist(
                self.database.clone(),
            ))
        })
    }

    /// Downloads the topology from the first node able to serve it and installs it.
    #[tracing::instrument(
        level = "debug",
        name = "RequestExecutor - Update Topology",
        skip(self),
        fields(database = %self.database)
    )]
    pub(crate) async fn update_topology(&self) -> Result<bool, RequestExecutorError> {
        let nodes = self.node_selector.read().topology().nodes.clone();
        let mut last_error = None;
        for node in nodes {
            match self.fetch_topology(&node).await {
                Ok(topology) => return Ok(self.apply_topology(topology)),
                Err(AttemptError::Node(failure)) => {
                    tracing::debug!("Topology update from {} failed: {}", &node, &failure);
                    last_error = Some(RequestExecutorError::UnexpectedError(anyhow::anyhow!(
                        "Unable to update topology from {}. Caused by: {}",
                        node,
                        failure
                    )));
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            RequestExecutorError::UnexpectedError(anyhow::anyhow!("Topology has no nodes"))
        }))
    }

    /// Probes every node once; the first node to answer becomes the preferred node for reads.
    pub(crate) async fn run_speed_test(self: Arc<Self>) {
        if !self.conventions.speed_test_enabled() {
            return;
        }
        let nodes = self.node_selector.write().begin_speed_test();
        let Some(nodes) = nodes else {
            return;
        };

        tracing::debug!(
            database = %self.database,
            "Running speed test across {} nodes",
            nodes.len()
        );
        let mut probes = JoinSet::new();
        for node in nodes {
            let shared = self.clone();
            probes.spawn(async move {
                let started = Instant::now();
                let mut command = GetStatisticsCommand::health_check();
                shared
                    .send_to_node(&node, &mut command)
                    .await
                    .map(|_| (node, started.elapsed()))
            });
        }

        let mut winner = None;
        while let Some(probe) = probes.join_next().await {
            if let Ok(Ok((node, elapsed))) = probe {
                tracing::debug!("{} answered the speed test in {:?}", &node, elapsed);
                winner = Some(node);
                break;
            }
        }
        probes.abort_all();

        self.node_selector.write().record_speed_test(winner);
    }

    /// Sends `command` to `node` exactly once, consulting and feeding the response cache.
    pub(crate) async fn send_to_node<C>(
        &self,
        node: &ServerNode,
        command: &mut C,
    ) -> Result<(), AttemptError>
    where
        C: RavenCommand + ?Sized,
    {
        let mut request = command.create_request(node).map_err(|e| {
            AttemptError::Fatal(RequestExecutorError::UnexpectedError(
                e.context("Unable to create the request"),
            ))
        })?;
        let url = request.url().to_string();

        let cacheable = command.can_cache() && request.method() == Method::GET;
        let cached = if cacheable { self.cache.get(&url) } else { None };

        if let Some(cached) = &cached {
            let aggressive = *self.aggressive_caching.lock();
            if let Some(options) = aggressive.filter(|_| command.can_cache_aggressively()) {
                if let Some(fresh) = self.cache.get_fresh(&url, options.duration) {
                    tracing::trace!(url = %url, "Serving aggressively cached response");
                    return command
                        .set_response(Some(fresh.payload), true)
                        .map_err(fatal_response_error);
                }
            }

            let validator = HeaderValue::from_str(&format!("\"{}\"", cached.change_vector))
                .map_err(|e| fatal_response_error(e.into()))?;
            request.headers_mut().insert(IF_NONE_MATCH, validator);
        }

        let known_etag = {
            let selector = self.node_selector.read();
            (!selector.is_fixed()).then(|| selector.etag())
        };
        if let Some(etag) = known_etag {
            request.headers_mut().insert(
                HeaderName::from_static("topology-etag"),
                HeaderValue::from(etag),
            );
        }

        let timeout = *request
            .timeout_mut()
            .get_or_insert(self.conventions.request_timeout());

        self.events.emit(&RequestEvents::BeforeRequest {
            database: self.database.clone(),
            url: url.clone(),
        });
        tracing::trace!(node = %node, url = %url, "Sending request");
        // Responses to requests sent before an invalidation must not be served aggressively.
        let generation = self.cache.generation();

        let response = match self.http_client.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                let failure = transport_failure(&e, timeout);
                self.emit_failed(&url, &failure.to_string());
                return Err(AttemptError::Node(failure));
            }
        };

        let status = response.status();
        tracing::trace!(node = %node, url = %url, status = status.as_u16(), "Response received");
        if let Some(etag) = known_etag {
            if topology_is_stale(&response, etag) {
                tracing::debug!("Server reports a newer topology, scheduling a refresh.");
                self.request_topology_refresh();
            }
        }

        let result = self
            .handle_response(node, command, response, &url, cacheable, cached, generation, timeout)
            .await;
        match &result {
            Ok(()) => self.events.emit(&RequestEvents::SucceedRequest {
                database: self.database.clone(),
                url,
                status: status.as_u16(),
            }),
            Err(AttemptError::Node(failure)) => self.emit_failed(&url, &failure.to_string()),
            Err(AttemptError::Fatal(e)) => self.emit_failed(&url, &e.to_string()),
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_response<C>(
        &self,
        node: &ServerNode,
        command: &mut C,
        response: reqwest::Response,
        url: &str,
        cacheable: bool,
        cached: Option<crate::http_cache::CachedResponse>,
        generation: u64,
        timeout: Duration,
    ) -> Result<(), AttemptError>
    where
        C: RavenCommand + ?Sized,
    {
        let status = response.status();
        match status {
            StatusCode::NOT_MODIFIED => {
                let cached = cached.ok_or_else(|| {
                    AttemptError::Fatal(RequestExecutorError::InvalidResponse(format!(
                        "{} answered 304 Not Modified for `{}` but nothing was cached",
                        node, url
                    )))
                })?;
                self.cache.mark_not_modified(url, generation);
                command
                    .set_response(Some(cached.payload), true)
                    .map_err(fatal_response_error)
            }
            StatusCode::NO_CONTENT => command
                .set_response(None, false)
                .map_err(fatal_response_error),
            StatusCode::NOT_FOUND => {
                self.cache.evict(url);
                match command.response_type() {
                    ResponseType::Raw => self.set_raw_response(command, response).await,
                    _ => {
                        // Drain the body so the connection goes back to the pool.
                        let _ = response.bytes().await;
                        command.set_response(None, false).map_err(fatal_response_error)
                    }
                }
            }
            s if s.is_success() => match command.response_type() {
                ResponseType::Empty => {
                    let _ = response.bytes().await;
                    command.set_response(None, false).map_err(fatal_response_error)
                }
                ResponseType::Raw => self.set_raw_response(command, response).await,
                ResponseType::Object => {
                    let change_vector = etag_header(&response);
                    let body = response
                        .bytes()
                        .await
                        .map_err(|e| AttemptError::Node(transport_failure(&e, timeout)))?;
                    if body.is_empty() {
                        return command.set_response(None, false).map_err(fatal_response_error);
                    }
                    if let (true, Some(change_vector)) = (cacheable, change_vector) {
                        self.cache
                            .set_with_generation(url, change_vector, body.clone(), generation);
                    }
                    command
                        .set_response(Some(body), false)
                        .map_err(fatal_response_error)
                }
            },
            _ => Err(self.unsuccessful_response(node, response, timeout).await),
        }
    }

    async fn set_raw_response<C>(
        &self,
        command: &mut C,
        response: reqwest::Response,
    ) -> Result<(), AttemptError>
    where
        C: RavenCommand + ?Sized,
    {
        match command.as_raw_response() {
            Some(raw) => raw
                .set_response_raw(response)
                .await
                .map_err(fatal_response_error),
            None => Err(AttemptError::Fatal(RequestExecutorError::InvalidResponse(
                "Command expects a raw response but does not implement RawResponseCommand"
                    .to_string(),
            ))),
        }
    }

    /// Classifies an error status. The body is always read so the connection goes back to the
    /// pool.
    async fn unsuccessful_response(
        &self,
        node: &ServerNode,
        response: reqwest::Response,
        timeout: Duration,
    ) -> AttemptError {
        let status = response.status();
        let database_missing = response.headers().contains_key(DATABASE_MISSING_HEADER);
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return AttemptError::Node(transport_failure(&e, timeout)),
        };
        let message = ServerErrorPayload::describe(&body);

        match status {
            StatusCode::SERVICE_UNAVAILABLE if database_missing => AttemptError::Fatal(
                RequestExecutorError::DatabaseDoesNotExist(node.database().to_string()),
            ),
            StatusCode::BAD_REQUEST => {
                AttemptError::Fatal(RequestExecutorError::BadRequest(message))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                AttemptError::Fatal(RequestExecutorError::BadAuthorization(message))
            }
            StatusCode::CONFLICT => AttemptError::Fatal(RequestExecutorError::Conflict(message)),
            StatusCode::GONE => {
                // The database moved away from this node.
                self.request_topology_refresh();
                AttemptError::Node(NodeFailure::ServerError {
                    status: status.as_u16(),
                    message,
                })
            }
            StatusCode::REQUEST_TIMEOUT
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => AttemptError::Node(NodeFailure::ServerError {
                status: status.as_u16(),
                message,
            }),
            _ => AttemptError::Fatal(RequestExecutorError::UnexpectedStatus {
                status: status.as_u16(),
                message,
            }),
        }
    }

    fn emit_failed(&self, url: &str, error: &str) {
        self.events.emit(&RequestEvents::FailedRequest {
            database: self.database.clone(),
            url: url.to_string(),
            error: error.to_string(),
        });
    }
}

fn fatal_response_error(e: anyhow::Error) -> AttemptError {
    AttemptError::Fatal(RequestExecutorError::UnexpectedError(
        e.context("Unable to process the response"),
    ))
}

fn transport_failure(e: &reqwest::Error, timeout: Duration) -> NodeFailure {
    if e.is_timeout() {
        NodeFailure::Timeout(timeout)
    } else {
        NodeFailure::Transport(e.to_string())
    }
}

/// `Refresh-Topology: true`, or a `Topology-Etag` newer than the one we hold.
fn topology_is_stale(response: &reqwest::Response, known_etag: i64) -> bool {
    let refresh_requested = response
        .headers()
        .get(REFRESH_TOPOLOGY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    refresh_requested
        || numeric_header(response, TOPOLOGY_ETAG_HEADER)
            .map(|etag| etag > known_etag)
            .unwrap_or(false)
}
