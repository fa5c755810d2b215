//! Correlation table: in-flight request id -> single-assignment waiter.
//!
//! Every outcome (response, timeout, connection failure) is delivered through the entry's
//! oneshot, and the entry is removed under the same lock that delivers it, so each id
//! completes at most once no matter whether the receive loop, the sweeper, or the waiter
//! itself gets there first.

use crate::gateway::error::BridgeError;
use crate::gateway::protocol::WsResponse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// What a waiter receives: the raw response, or the reason it will never arrive.
pub type Outcome = Result<WsResponse, BridgeError>;

struct PendingRequest {
    method: String,
    issued_at: Instant,
    deadline: Instant,
    /// Skip `{"status":"accepted"}` acks and keep waiting for the final response.
    expect_final: bool,
    slot: oneshot::Sender<Outcome>,
}

/// Shared table of pending requests. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct PendingTable {
    inner: Arc<Mutex<HashMap<String, PendingRequest>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new in-flight request. Fails if the id is already pending.
    pub fn register(
        &self,
        id: impl Into<String>,
        method: &str,
        timeout: Duration,
        expect_final: bool,
    ) -> Result<PendingHandle, BridgeError> {
        let id = id.into();
        let issued_at = Instant::now();
        let deadline = issued_at + timeout;
        let (slot, rx) = oneshot::channel();
        {
            let mut entries = self.entries();
            if entries.contains_key(&id) {
                return Err(BridgeError::DuplicateId(id));
            }
            entries.insert(
                id.clone(),
                PendingRequest {
                    method: method.to_string(),
                    issued_at,
                    deadline,
                    expect_final,
                    slot,
                },
            );
        }
        Ok(PendingHandle {
            id,
            deadline,
            rx,
            table: self.clone(),
            finished: false,
        })
    }

    /// Complete the waiter for `response.id`. Returns false when nobody is waiting
    /// (late or duplicate response, or the entry already timed out).
    pub fn resolve(&self, response: WsResponse) -> bool {
        let mut entries = self.entries();
        let intermediate = match entries.get(&response.id) {
            Some(entry) => entry.expect_final && is_accepted_ack(&response),
            None => {
                log::debug!("gateway: dropping response for unknown request {}", response.id);
                return false;
            }
        };
        if intermediate {
            log::debug!("gateway: request {} accepted, waiting for final response", response.id);
            return true;
        }
        let Some(entry) = entries.remove(&response.id) else {
            return false;
        };
        drop(entries);
        log::debug!(
            "gateway: {} {} completed in {:?}",
            entry.method,
            response.id,
            entry.issued_at.elapsed()
        );
        let _ = entry.slot.send(Ok(response));
        true
    }

    /// Time out every entry whose deadline is at or before `now`. Returns how many expired.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(String, PendingRequest)> = {
            let mut entries = self.entries();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
                .collect()
        };
        for (id, entry) in &expired {
            log::warn!("gateway: {} {} timed out", entry.method, id);
        }
        let count = expired.len();
        for (_, entry) in expired {
            let method = entry.method;
            let _ = entry.slot.send(Err(BridgeError::Timeout { method }));
        }
        count
    }

    /// Fail every pending entry with the error built by `make`. Returns how many were failed.
    pub fn fail_all(&self, make: impl Fn() -> BridgeError) -> usize {
        let drained: Vec<PendingRequest> = self.entries().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.slot.send(Err(make()));
        }
        count
    }

    /// Remove an entry without delivering anything (the waiter went away).
    pub fn cancel(&self, id: &str) -> bool {
        self.entries().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn time_out(&self, id: &str) {
        let Some(entry) = self.entries().remove(id) else {
            return;
        };
        log::warn!("gateway: {} {} timed out", entry.method, id);
        let method = entry.method;
        let _ = entry.slot.send(Err(BridgeError::Timeout { method }));
    }
}

fn is_accepted_ack(response: &WsResponse) -> bool {
    response.ok
        && response
            .payload
            .as_ref()
            .and_then(|p| p.get("status"))
            .and_then(|s| s.as_str())
            == Some("accepted")
}

/// Waitable side of a pending request. Dropping it before completion removes the entry.
pub struct PendingHandle {
    id: String,
    deadline: Instant,
    rx: oneshot::Receiver<Outcome>,
    table: PendingTable,
    finished: bool,
}

impl PendingHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the outcome. At the deadline the entry is expired through the table,
    /// so a response racing the deadline is either delivered or discarded, never both.
    pub async fn wait(mut self) -> Outcome {
        let received = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(received) => received,
            Err(_) => {
                self.table.time_out(&self.id);
                (&mut self.rx).await
            }
        };
        self.finished = true;
        received.unwrap_or(Err(BridgeError::ConnectionClosed))
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        if !self.finished && self.table.cancel(&self.id) {
            log::debug!("gateway: request {} cancelled by caller", self.id);
        }
    }
}
