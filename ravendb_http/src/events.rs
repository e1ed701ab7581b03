//! Listener registries for request and store events.
//!
//! Adding a listener returns a [`ListenerHandle`]; removing it later takes that handle. Handles
//! never get reused, so removing one listener cannot disturb any other.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;

#[derive(Clone, Debug)]
pub enum RequestEvents {
    BeforeRequest {
        database: String,
        url: String,
    },
    FailedRequest {
        database: String,
        url: String,
        error: String,
    },
    SucceedRequest {
        database: String,
        url: String,
        status: u16,
    },
    TopologyUpdated {
        database: String,
        etag: i64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvents {
    BeforeClose,
    AfterClose,
}

/// Opaque token identifying a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct EventListeners<E> {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<u64, Listener<E>>>,
}

impl<E> Default for EventListeners<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: RwLock::new(HashMap::new()),
        }
    }
}

impl<E> std::fmt::Debug for EventListeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListeners")
            .field("count", &self.len())
            .finish()
    }
}

impl<E> EventListeners<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().insert(id, Arc::new(listener));
        ListenerHandle(id)
    }

    /// Returns `false` if the handle was already removed.
    pub fn remove(&self, handle: ListenerHandle) -> bool {
        self.listeners.write().remove(&handle.0).is_some()
    }

    /// Calls every listener in registration order.
    ///
    /// Listeners run outside the registry lock and may add or remove listeners themselves.
    pub fn emit(&self, event: &E) {
        let mut snapshot = self
            .listeners
            .read()
            .iter()
            .map(|(id, listener)| (*id, listener.clone()))
            .collect::<Vec<_>>();
        snapshot.sort_by_key(|(id, _)| *id);
        for (_, listener) in snapshot {
            listener(event);
        }
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}
