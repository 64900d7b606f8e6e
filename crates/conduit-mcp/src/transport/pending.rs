//! Request/response correlation for transports with a shared inbound channel.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::protocol::{JsonRpcResponse, RequestId};

type Outcome = Result<JsonRpcResponse<Value>, TransportError>;
type Waiter = oneshot::Sender<Outcome>;

/// Outstanding requests keyed by id, bounded to `limit` entries.
///
/// A request that times out or whose caller stops waiting is removed
/// immediately, so a late response finds no waiter and is dropped instead
/// of accumulating.
#[derive(Debug)]
pub(crate) struct PendingRequests {
    waiters: Mutex<HashMap<RequestId, Waiter>>,
    limit: usize,
}

impl PendingRequests {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            limit: limit.max(1),
        }
    }

    /// Reserve a slot for `id`. The slot is released when the returned
    /// guard is dropped, whether or not a response arrived.
    pub(crate) fn register(&self, id: RequestId) -> Result<PendingSlot<'_>, TransportError> {
        let mut waiters = self.waiters.lock();
        if waiters.len() >= self.limit {
            return Err(TransportError::TooManyPending { limit: self.limit });
        }
        let (tx, rx) = oneshot::channel();
        waiters.insert(id.clone(), tx);
        Ok(PendingSlot {
            pending: self,
            id,
            rx,
        })
    }

    /// Hand a response to its waiter. Returns `false` if nobody is waiting.
    pub(crate) fn complete(&self, response: JsonRpcResponse<Value>) -> bool {
        let waiter = self.waiters.lock().remove(&response.id);
        match waiter {
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    fn cancel(&self, id: &RequestId) {
        self.waiters.lock().remove(id);
    }

    /// Fail every outstanding request.
    pub(crate) fn fail_all(&self, error: impl Fn() -> TransportError) {
        let drained: Vec<Waiter> = self.waiters.lock().drain().map(|(_, tx)| tx).collect();
        for tx in drained {
            let _ = tx.send(Err(error()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}

/// A registered request. Dropping it frees the slot, including when the
/// future waiting on it is cancelled.
#[derive(Debug)]
pub(crate) struct PendingSlot<'a> {
    pending: &'a PendingRequests,
    id: RequestId,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingSlot<'_> {
    /// Wait up to `timeout` for the response.
    pub(crate) async fn wait(mut self, timeout: Duration) -> Outcome {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.cancel(&self.id);
    }
}
