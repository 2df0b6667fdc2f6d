//! A session: the caller-facing half of a connection worker.
//!
//! [`Session::submit`] queues a call in the shared [`SessionData`], wakes the
//! worker and returns a future that resolves when the dispatcher task sees
//! the answer. Updates go to every subscribed [`UpdateStream`](crate::UpdateStream).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tdmtp_mtproto::{Received, Request, RequestId, SessionData};
use tdmtp_tl_types::{types, Deserializable, Identifiable};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connection::{Clock, Command, ConnectionState, Deliveries, Worker, WorkerSetup};
use crate::errors::{InvocationError, RpcError};
use crate::transport::Connector;

type Reply = Result<Vec<u8>, InvocationError>;
type Waiters = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Reply>>>>;
pub(crate) type UpdateSinks = Arc<Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>>;

// ─── ResponseFuture ───────────────────────────────────────────────────────────

/// Resolves with the answer to one call.
///
/// Dropping it does not cancel the call; use [`Session::cancel`] for that.
pub struct ResponseFuture {
    request_id: RequestId,
    rx:         oneshot::Receiver<Reply>,
}

impl ResponseFuture {
    pub fn request_id(&self) -> RequestId { self.request_id }
}

impl Future for ResponseFuture {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Reply> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.unwrap_or(Err(InvocationError::Dropped)))
    }
}

// ─── Session ──────────────────────────────────────────────────────────────────

pub struct Session {
    dc_id:    i32,
    data:     Arc<SessionData>,
    commands: mpsc::UnboundedSender<Command>,
    waiters:  Waiters,
    state:    watch::Receiver<ConnectionState>,
    cancel:   CancellationToken,
    clock:    Clock,
}

impl Session {
    /// Start a worker and a dispatcher for `setup.dc_id`.
    pub(crate) fn spawn<C: Connector>(
        setup: WorkerSetup<C>,
        updates: UpdateSinks,
        parent: &CancellationToken,
    ) -> Result<Self, InvocationError> {
        let dc_id = setup.dc_id;
        let data = Arc::new(SessionData::new()?);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let cancel = parent.child_token();
        let waiters = Waiters::default();
        let clock = Clock::new();

        let worker = Worker::new(setup, Arc::clone(&data), clock, command_rx, delivery_tx, state_tx, cancel.clone());
        tokio::spawn(worker.run());
        tokio::spawn(dispatch(delivery_rx, Arc::clone(&waiters), updates));
        debug!("[tdmtp] session for dc {dc_id} started");

        Ok(Self { dc_id, data, commands, waiters, state, cancel, clock })
    }

    pub fn dc_id(&self) -> i32 { self.dc_id }

    /// The protocol state this session shares with its worker.
    pub fn data(&self) -> &Arc<SessionData> { &self.data }

    /// Watch the connection go up and down.
    pub fn state(&self) -> watch::Receiver<ConnectionState> { self.state.clone() }

    /// Send a call and wait for its answer.
    ///
    /// The body is a serialized TL function. `rpc_error` answers become
    /// [`InvocationError::Rpc`] (or [`InvocationError::Migrate`]).
    pub fn submit(&self, body: Vec<u8>) -> ResponseFuture { self.submit_request(Request::call(body), 0) }

    /// Like [`submit`](Self::submit) for a prepared request: one that must
    /// follow another (`after`), skips the layer wrapper, or may wait
    /// `ms_can_wait` to share a container.
    pub fn submit_request(&self, mut request: Request, ms_can_wait: u64) -> ResponseFuture {
        if request.request_id == 0 {
            request.request_id = self.data.next_request_id();
        }
        let request_id = request.request_id;
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(request_id, tx);
        self.data.send_prepared(request, ms_can_wait, self.clock.now());
        if self.commands.send(Command::Wake).is_err() {
            self.waiters.lock().remove(&request_id);
            self.data.cancel_request(request_id);
        }
        ResponseFuture { request_id, rx }
    }

    /// Forget a call. Its future resolves with [`InvocationError::Dropped`]
    /// and a late answer is ignored.
    pub fn cancel(&self, request_id: RequestId) {
        self.data.cancel_request(request_id);
        self.waiters.lock().remove(&request_id);
    }

    /// Number of calls still waiting for an answer.
    pub fn pending(&self) -> usize { self.waiters.lock().len() }

    /// Drop the connection and reconnect.
    pub fn reconnect(&self) { let _ = self.commands.send(Command::Reconnect); }

    /// Stop the worker; every waiting call fails.
    pub fn shutdown(&self) { self.cancel.cancel(); }
}

impl Drop for Session {
    fn drop(&mut self) { self.cancel.cancel(); }
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

/// Turn a raw answer into the caller's result.
fn into_reply(body: Vec<u8>) -> Reply {
    if body.get(..4) == Some(&types::RpcError::CONSTRUCTOR_ID.to_le_bytes()[..]) {
        let error = types::RpcError::from_bytes(&body[4..])?;
        return Err(RpcError::from_telegram(error.error_code, &error.error_message).into());
    }
    Ok(body)
}

async fn dispatch(mut deliveries: mpsc::UnboundedReceiver<Deliveries>, waiters: Waiters, updates: UpdateSinks) {
    while let Some(batch) = deliveries.recv().await {
        for (request_id, received) in batch {
            let reply = match received {
                Received::Update(body) => {
                    updates.lock().retain(|sink| sink.send(body.clone()).is_ok());
                    continue;
                }
                Received::Response(body) => into_reply(body),
                Received::Failed(e) => Err(e.into()),
            };
            match waiters.lock().remove(&request_id) {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => trace!("[tdmtp] answer to request {request_id} has no waiter"),
            }
        }
    }
    // The worker is gone; dropping the senders fails what is left.
    waiters.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdmtp_tl_types::Serializable;

    #[test]
    fn rpc_errors_are_parsed_out_of_answers() {
        let body = types::RpcError { error_code: 420, error_message: "FLOOD_WAIT_12".into() }.to_bytes();
        match into_reply(body) {
            Err(InvocationError::Rpc(e)) => assert_eq!(e.flood_wait_seconds(), Some(12)),
            other => panic!("unexpected {other:?}"),
        }
        let body = types::RpcError { error_code: 303, error_message: "USER_MIGRATE_5".into() }.to_bytes();
        assert!(matches!(into_reply(body), Err(InvocationError::Migrate(5))));
        assert_eq!(into_reply(vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap(), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn dispatcher_routes_answers_and_updates() {
        let (tx, rx) = mpsc::unbounded_channel();
        let waiters = Waiters::default();
        let (sink, mut updates) = mpsc::unbounded_channel();
        let sinks: UpdateSinks = Arc::new(Mutex::new(vec![sink]));
        let task = tokio::spawn(dispatch(rx, Arc::clone(&waiters), sinks));

        let (ok_tx, ok_rx) = oneshot::channel();
        let (fail_tx, fail_rx) = oneshot::channel();
        waiters.lock().insert(1, ok_tx);
        waiters.lock().insert(2, fail_tx);
        let (orphan_tx, orphan_rx) = oneshot::channel::<Reply>();
        waiters.lock().insert(3, orphan_tx);

        let mut batch = Deliveries::new();
        batch.insert(-7, Received::Update(vec![9; 8]));
        batch.insert(1, Received::Response(vec![1; 8]));
        batch.insert(2, Received::Failed(tdmtp_mtproto::Error::Timeout));
        tx.send(batch).unwrap();

        assert_eq!(ok_rx.await.unwrap().unwrap(), [1; 8]);
        assert!(matches!(fail_rx.await.unwrap(), Err(InvocationError::Timeout)));
        assert_eq!(updates.recv().await.unwrap(), [9; 8]);

        drop(tx);
        task.await.unwrap();
        assert!(orphan_rx.await.is_err());
    }
}
