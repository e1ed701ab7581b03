mod aggressive_caching;
mod change_feed_evictor;
mod request_executor_actor;
mod request_executor_error;
mod request_executor_handle;
mod request_executor_shared;

pub use aggressive_caching::{AggressiveCacheOptions, AggressiveCachingGuard};
pub use change_feed_evictor::ChangeFeedEvictor;
pub use request_executor_actor::RequestExecutorActor;
pub use request_executor_error::{NodeFailure, RequestExecutorError};
pub use request_executor_handle::{RequestExecutor, RequestExecutorOptions};

pub(crate) enum RequestExecutorMessage {
    /// Probe every node once and remember the fastest.
    RunSpeedTest,
    /// Refresh the topology now, without waiting for the timer.
    UpdateTopology,
    /// Stop background work. Sent by `close`.
    Close,
}
