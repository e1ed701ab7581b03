use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{instrument, Span};
use uuid::Uuid;

use super::{request_executor_shared::ExecutorShared, RequestExecutorMessage};

/// Background half of a [`RequestExecutor`](super::RequestExecutor).
///
/// The actor never sits on the request path. It refreshes the topology on a timer and when a
/// response hints that the topology changed, and runs the one-time speed test. Requests keep
/// flowing through the handle while this happens.
pub struct RequestExecutorActor {
    shared: Arc<ExecutorShared>,
    receiver: mpsc::Receiver<RequestExecutorMessage>,
    topology_updater: Option<JoinHandle<()>>,
    speed_test: Option<JoinHandle<()>>,
}

impl RequestExecutorActor {
    pub(crate) fn new(
        receiver: mpsc::Receiver<RequestExecutorMessage>,
        shared: Arc<ExecutorShared>,
    ) -> Self {
        Self {
            shared,
            receiver,
            topology_updater: None,
            speed_test: None,
        }
    }

    /// Message handler for the RequestExecutorActor
    #[instrument(
        level = "debug",
        name = "RequestExecutor Actor - Handle Message",
        skip(self, msg),
        fields(database = %self.shared.database, correlation_id)
    )]
    fn handle_message(&mut self, msg: RequestExecutorMessage) {
        // Apply a correlation id to all child spans of this message handler
        Span::current().record("correlation_id", Uuid::new_v4().to_string().as_str());
        match msg {
            RequestExecutorMessage::UpdateTopology => self.refresh_topology(),
            RequestExecutorMessage::RunSpeedTest => self.run_speed_test(),
            RequestExecutorMessage::Close => {}
        }
    }

    /// Starts a topology refresh in the background unless one is still running.
    fn refresh_topology(&mut self) {
        if self
            .topology_updater
            .as_ref()
            .map(|updater| !updater.is_finished())
            .unwrap_or(false)
        {
            tracing::debug!(
                "Topology update already running. Canceling to avoid duplication of effort."
            );
            return;
        }

        let shared = self.shared.clone();
        self.topology_updater = Some(tokio::spawn(async move {
            match shared.update_topology().await {
                Ok(true) => shared.run_speed_test().await,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        "There was an error updating the topology. Caused by: {}",
                        e
                    );
                }
            }
        }));
    }

    fn run_speed_test(&mut self) {
        if self.speed_test.is_some() {
            return;
        }
        self.speed_test = Some(tokio::spawn(self.shared.clone().run_speed_test()));
    }

    fn stop(&mut self) {
        for task in [self.topology_updater.take(), self.speed_test.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

#[instrument(level = "debug", name = "Running Request Executor Actor", skip(actor))]
pub async fn run_request_executor_actor(mut actor: RequestExecutorActor) {
    let period = actor.shared.conventions.topology_refresh_interval();
    let mut topology_update_timer = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = topology_update_timer.tick() => {
                tracing::debug!("Updating topology via timer.");
                actor.handle_message(RequestExecutorMessage::UpdateTopology);
            },
            _ = actor.shared.topology_refresh_requested.notified() => {
                actor.handle_message(RequestExecutorMessage::UpdateTopology);
            },
            opt_msg = actor.receiver.recv() => {
                let msg = match opt_msg {
                    Some(RequestExecutorMessage::Close) | None => break,
                    Some(msg) => msg,
                };
                actor.handle_message(msg);
            },
        }
    }
    actor.stop();
    tracing::debug!("Request executor actor stopped.");
}
