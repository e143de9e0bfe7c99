//! Requests waiting for a correlated `RESPONSE`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use exile_id::{NodeId, RequestId};
use exile_proto::ResponsePayload;
use tokio::sync::oneshot;

/// Identifies one socket for the lifetime of the process.
pub type ConnectionId = u64;

struct Waiter {
    node_id: NodeId,
    connection: ConnectionId,
    reply: oneshot::Sender<ResponsePayload>,
}

/// What became of an incoming response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No caller is waiting: unknown id, already answered, or timed out.
    Unknown,
    /// The id belongs to a request sent to a different node.
    Foreign { expected: NodeId },
}

#[derive(Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<RequestId, Waiter>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter under a fresh request id.
    ///
    /// The entry lives until the returned guard is dropped or a response
    /// fills it, whichever comes first.
    pub fn insert(
        &self,
        node_id: NodeId,
        connection: ConnectionId,
    ) -> (PendingGuard<'_>, oneshot::Receiver<ResponsePayload>) {
        let (reply, rx) = oneshot::channel();
        let id = RequestId::new();
        self.lock().insert(
            id,
            Waiter {
                node_id,
                connection,
                reply,
            },
        );
        (PendingGuard { table: self, id }, rx)
    }

    /// Hands `response` to its waiter if it came from the node it was sent to.
    pub fn complete(&self, from: NodeId, response: ResponsePayload) -> Delivery {
        let Ok(id) = RequestId::parse(&response.request_id) else {
            return Delivery::Unknown;
        };
        let mut waiters = self.lock();
        match waiters.get(&id) {
            None => return Delivery::Unknown,
            Some(waiter) if waiter.node_id != from => {
                return Delivery::Foreign {
                    expected: waiter.node_id,
                }
            }
            Some(_) => {}
        }
        let Some(waiter) = waiters.remove(&id) else {
            return Delivery::Unknown;
        };
        drop(waiters);
        match waiter.reply.send(response) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Unknown,
        }
    }

    /// Drops every waiter bound to `connection`; their callers see the
    /// connection as lost. Returns how many were dropped.
    pub fn fail_connection(&self, connection: ConnectionId) -> usize {
        let mut waiters = self.lock();
        let before = waiters.len();
        waiters.retain(|_, waiter| waiter.connection != connection);
        before - waiters.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes its pending entry when dropped.
pub struct PendingGuard<'a> {
    table: &'a PendingRequests,
    id: RequestId,
}

impl PendingGuard<'_> {
    pub fn request_id(&self) -> RequestId {
        self.id
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.lock().remove(&self.id);
    }
}
