//! Change notifications, consumed as an abstract event source.
//!
//! This crate does not speak the change-feed wire protocol. Whoever builds the store plugs in a
//! [`DatabaseChangesConnector`] that turns a database name into a stream of
//! [`DatabaseChange`]s; the aggressive cache listens to it to drop stale responses.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error_chain_fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentChangeType {
    Put,
    Delete,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseChange {
    Document {
        id: String,
        collection: Option<String>,
        change_type: DocumentChangeType,
    },
    Index {
        name: String,
    },
    /// Anything else the feed reports (counters, time series, operations, ...).
    Other,
}

#[derive(thiserror::Error)]
pub enum ChangesError {
    #[error("Unable to connect to the change feed of `{database}`: {reason}")]
    ConnectionFailed { database: String, reason: String },
    #[error("Change feed connection dropped: {0}")]
    ConnectionLost(String),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for ChangesError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// Live notifications for one database. The stream ending (all senders dropped) means the
/// connection dropped; an `Err` item reports a transport problem without closing the stream.
pub type ChangeStream = mpsc::Receiver<Result<DatabaseChange, ChangesError>>;

#[async_trait]
pub trait DatabaseChangesConnector: Send + Sync + std::fmt::Debug {
    async fn connect(&self, database: &str) -> Result<ChangeStream, ChangesError>;
}

const CHANNEL_CAPACITY: usize = 64;

/// Connector fed by the application itself, useful when notifications already arrive through
/// some other channel.
#[derive(Debug, Default)]
pub struct ChannelChangesConnector {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Result<DatabaseChange, ChangesError>>>>>,
}

impl ChannelChangesConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `change` to every open stream of `database`. Returns how many streams got it.
    ///
    /// A stream whose buffer is full is ended instead: once the subscriber drains it, the stream
    /// closes and reports that changes were lost.
    pub fn publish(&self, database: &str, change: DatabaseChange) -> usize {
        let mut subscribers = self.subscribers.lock();
        let Some(senders) = subscribers.get_mut(&database.to_lowercase()) else {
            return 0;
        };
        let mut delivered = 0;
        senders.retain(|sender| match sender.try_send(Ok(change.clone())) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(database, "Change stream is full, ending it to signal lost changes");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Ends every open stream of `database`, as a dropped connection would.
    pub fn disconnect(&self, database: &str) {
        self.subscribers.lock().remove(&database.to_lowercase());
    }

    pub fn connection_count(&self, database: &str) -> usize {
        self.subscribers
            .lock()
            .get(&database.to_lowercase())
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DatabaseChangesConnector for ChannelChangesConnector {
    async fn connect(&self, database: &str) -> Result<ChangeStream, ChangesError> {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .entry(database.to_lowercase())
            .or_default()
            .push(sender);
        Ok(receiver)
    }
}
