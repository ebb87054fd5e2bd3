//! Outbound requests issued by blocks.
//!
//! Blocks never talk to the network themselves. They hand a [`FetchRequest`]
//! to a [`FetchClient`], which stamps it with a [`RequestId`], remembers which
//! block asked, and forwards it to the host's [`Transport`]. The host answers
//! later through `BlockHost::complete_fetch`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::BlockKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    #[default]
    #[serde(alias = "GET", alias = "get")]
    Get,
    #[serde(alias = "POST", alias = "post")]
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub id: RequestId,
    pub origin: BlockKey,
    pub method: Method,
    pub url: String,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("server answered with status {0}")]
    Status(u16),
    #[error("network failure: {0}")]
    Network(String),
    #[error("no transport configured")]
    NotConfigured,
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),
    #[error("transport unavailable")]
    Poisoned,
}

/// Sink for outbound requests. Answers arrive asynchronously via the host.
pub trait Transport: Send + Sync {
    fn submit(&self, request: FetchRequest) -> Result<(), TransportError>;
}

/// Transport that only records requests; the embedding loop (or a test)
/// drains them and answers through the host.
#[derive(Debug, Default)]
pub struct QueuedTransport {
    queue: Mutex<VecDeque<FetchRequest>>,
}

impl QueuedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<FetchRequest> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn drain(&self) -> Vec<FetchRequest> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Transport for QueuedTransport {
    fn submit(&self, request: FetchRequest) -> Result<(), TransportError> {
        self.queue
            .lock()
            .map_err(|_| TransportError::Poisoned)?
            .push_back(request);
        Ok(())
    }
}

/// Cloneable handle blocks keep to issue requests, including from inside
/// channel handlers.
#[derive(Clone)]
pub struct FetchClient {
    transport: Arc<dyn Transport>,
    routes: Arc<Mutex<HashMap<RequestId, BlockKey>>>,
    next_id: Arc<AtomicU64>,
}

impl FetchClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            routes: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn submit(
        &self,
        origin: &BlockKey,
        method: Method,
        url: impl Into<String>,
        body: Option<String>,
    ) -> Result<RequestId, TransportError> {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.routes
            .lock()
            .map_err(|_| TransportError::Poisoned)?
            .insert(id, origin.clone());
        let request = FetchRequest {
            id,
            origin: origin.clone(),
            method,
            url: url.into(),
            body,
        };
        if let Err(err) = self.transport.submit(request) {
            self.take_route(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Forget a request and return the block that issued it.
    pub fn take_route(&self, id: RequestId) -> Option<BlockKey> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn pending(&self) -> usize {
        self.routes.lock().map(|routes| routes.len()).unwrap_or(0)
    }
}

impl fmt::Debug for FetchClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchClient")
            .field("pending", &self.pending())
            .finish()
    }
}
