//! Request/response correlation.
//!
//! [`Correlator`] is the cheap, cloneable caller side: it allocates ids and
//! hands each request to the connection task together with a oneshot reply
//! slot. [`PendingRequests`] is the table of outstanding requests; it lives
//! inside the connection task and is never shared, so there is no lock on
//! the hot path.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::RequestError;
use crate::protocol::{Request, Response};
use crate::transport::ConnectionStatus;

/// Default per-request deadline
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Stand-in for "never" when a timeout is too large to add to `now`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

pub(crate) type Reply = oneshot::Sender<Result<Value, RequestError>>;

/// Messages from callers to the connection task
pub(crate) enum ConnectionCommand {
    Call {
        request: Request,
        deadline: Instant,
        reply: Reply,
    },
    Cancel {
        id: u64,
    },
    SetStatus(ConnectionStatus),
}

struct PendingRequest {
    method: String,
    deadline: Instant,
    reply: Reply,
}

impl PendingRequest {
    fn fulfil(self, result: Result<Value, RequestError>) {
        // The caller may have gone away already; its late answer is simply dropped
        let _ = self.reply.send(result);
    }
}

/// Outstanding requests of one connection, keyed (and ordered) by id
#[derive(Default)]
pub(crate) struct PendingRequests {
    entries: BTreeMap<u64, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a request; a duplicate id is refused and its caller told so
    pub fn insert(&mut self, id: u64, method: String, deadline: Instant, reply: Reply) -> bool {
        if self.entries.contains_key(&id) {
            tracing::warn!("Duplicate request id {} for {}, refusing", id, method);
            let _ = reply.send(Err(RequestError::Protocol(crate::error::ProtocolError::new(
                format!("request id {id} already in flight"),
            ))));
            return false;
        }
        self.entries.insert(
            id,
            PendingRequest {
                method,
                deadline,
                reply,
            },
        );
        true
    }

    /// Hand a response to its waiting caller; returns false if nobody was waiting
    pub fn resolve(&mut self, response: Response) -> bool {
        let Some(pending) = self.entries.remove(&response.id) else {
            tracing::debug!("Dropping unmatched response {} ({})", response.id, response.status);
            return false;
        };

        let result = if response.is_success() {
            Ok(response.params.unwrap_or(Value::Null))
        } else if response.is_unauthorized() {
            Err(RequestError::Unauthorized {
                method: pending.method.clone(),
            })
        } else {
            tracing::warn!("Hub rejected {}: {}", pending.method, response.error_code());
            Err(RequestError::HubRejected {
                method: pending.method.clone(),
                code: response.error_code(),
            })
        };
        pending.fulfil(result);
        true
    }

    /// Forget a request whose caller gave up
    pub fn cancel(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Fail one request, e.g. because its frame could not be written
    pub fn fail(&mut self, id: u64, error: impl FnOnce(String) -> RequestError) {
        if let Some(pending) = self.entries.remove(&id) {
            let err = error(pending.method.clone());
            pending.fulfil(Err(err));
        }
    }

    /// Earliest deadline among outstanding requests
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|p| p.deadline).min()
    }

    /// Resolve every overdue request with a timeout, in id order
    pub fn expire(&mut self, now: Instant) -> Vec<u64> {
        let overdue: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &overdue {
            if let Some(pending) = self.entries.remove(id) {
                tracing::warn!("Request {} ({}) timed out", id, pending.method);
                let method = pending.method.clone();
                pending.fulfil(Err(RequestError::Timeout { method }));
            }
        }
        overdue
    }

    /// Resolve everything with a disconnect failure, in id order
    pub fn fail_all(&mut self) -> Vec<u64> {
        let entries = std::mem::take(&mut self.entries);
        let mut failed = Vec::with_capacity(entries.len());
        for (id, pending) in entries {
            let method = pending.method.clone();
            pending.fulfil(Err(RequestError::Disconnected { method }));
            failed.push(id);
        }
        failed
    }
}

/// Caller-side handle for issuing correlated requests
///
/// Clones share the id counter, the token and the connection.
#[derive(Clone)]
pub struct Correlator {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    next_id: Arc<AtomicU64>,
    token: Arc<RwLock<Option<String>>>,
    default_timeout: Duration,
}

impl Correlator {
    pub(crate) fn new(commands: mpsc::UnboundedSender<ConnectionCommand>, default_timeout: Duration) -> Self {
        Self {
            commands,
            // 0 is reserved for the connection probe
            next_id: Arc::new(AtomicU64::new(1)),
            token: Arc::new(RwLock::new(None)),
            default_timeout,
        }
    }

    /// Install (or clear) the token attached to every request
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Issue a request and wait for its result with the default deadline
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RequestError> {
        self.call_with_timeout(method, params, self.default_timeout).await
    }

    /// Issue a request and wait for its result
    ///
    /// Dropping the returned future cancels the request locally; the hub's late
    /// answer, if any, is discarded as unmatched.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        self.dispatch(method, params, timeout, self.token()).await
    }

    /// Issue a request carrying an explicit token instead of the installed one
    pub async fn call_with_token(
        &self,
        method: &str,
        params: Value,
        token: &str,
    ) -> Result<Value, RequestError> {
        self.dispatch(method, params, self.default_timeout, Some(token.to_string()))
            .await
    }

    async fn dispatch(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        token: Option<String>,
    ) -> Result<Value, RequestError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(id, method).with_params(params).with_token(token);
        let (reply, rx) = oneshot::channel();

        self.commands
            .send(ConnectionCommand::Call {
                request,
                deadline: deadline_after(timeout),
                reply,
            })
            .map_err(|_| RequestError::Disconnected {
                method: method.to_string(),
            })?;

        let mut guard = CancelOnDrop {
            id,
            commands: &self.commands,
            armed: true,
        };
        let result = rx.await;
        guard.armed = false;

        match result {
            Ok(result) => result,
            // The connection task went away with our reply slot
            Err(_) => Err(RequestError::Disconnected {
                method: method.to_string(),
            }),
        }
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        let _ = self.commands.send(ConnectionCommand::SetStatus(status));
    }
}

/// `now + timeout`, saturating at a point far enough away to mean "never"
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

struct CancelOnDrop<'a> {
    id: u64,
    commands: &'a mpsc::UnboundedSender<ConnectionCommand>,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("Request {} cancelled by caller", self.id);
            let _ = self.commands.send(ConnectionCommand::Cancel { id: self.id });
        }
    }
}
