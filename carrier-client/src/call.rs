//! Method invocation over a connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use carrier_mtproto::envelope;
use carrier_mtproto::state::Phase;
use carrier_mtproto::{Args, Serializer};

use crate::connection::Connection;
use crate::message::OutgoingMessage;
use crate::InvocationError;

/// Serialize and queue a method call, then wait for its result.
pub async fn invoke(
    conn: &Connection,
    serializer: &dyn Serializer,
    method: &str,
    args: &Args,
) -> Result<Vec<u8>, InvocationError> {
    invoke_in(conn, serializer, Phase::Main, method, args, None, None).await
}

/// Like [`invoke`], but the caller can abort through `token`.
///
/// Cancelling before the message hits the wire silently drops it; after,
/// an `rpc_drop_answer` is queued so the server stops working on it.
pub async fn invoke_cancellable(
    conn: &Connection,
    serializer: &dyn Serializer,
    method: &str,
    args: &Args,
    token: CancellationToken,
) -> Result<Vec<u8>, InvocationError> {
    invoke_in(conn, serializer, Phase::Main, method, args, Some(token), None).await
}

/// Invoke in the pre-init phase (binding and connection init only).
pub async fn invoke_uninited(
    conn: &Connection,
    serializer: &dyn Serializer,
    method: &str,
    args: &Args,
) -> Result<Vec<u8>, InvocationError> {
    invoke_in(conn, serializer, Phase::Uninited, method, args, None, None).await
}

pub(crate) async fn invoke_in(
    conn: &Connection,
    serializer: &dyn Serializer,
    phase: Phase,
    method: &str,
    args: &Args,
    token: Option<CancellationToken>,
    queue_id: Option<u64>,
) -> Result<Vec<u8>, InvocationError> {
    let body = serializer.serialize_method(method, args)?;
    let (tx, mut rx) = oneshot::channel();
    let token = token.unwrap_or_default();
    let mut message =
        OutgoingMessage::method(method, body, tx).with_cancellation(token.clone());
    if let Some(queue_id) = queue_id {
        message = message.with_queue_id(queue_id);
    }
    let handle = conn.enqueue(phase, message);

    tokio::select! {
        result = &mut rx => result.unwrap_or(Err(InvocationError::Dropped)),
        _ = token.cancelled() => {
            // Already on the wire? Tell the server to forget it.
            let sent_id = conn.with_session(|s| {
                s.arena().get(handle).filter(|m| m.is_sent()).and_then(|m| m.msg_id())
            });
            if let Some(msg_id) = sent_id {
                let drop_req = envelope::serialize_rpc_drop_answer(msg_id);
                conn.enqueue(
                    Phase::Main,
                    OutgoingMessage::object("rpc_drop_answer", drop_req, true),
                );
            }
            conn.with_session(|s| {
                if let Some(m) = s.arena_mut().get_mut(handle) {
                    m.reply(Err(InvocationError::Cancelled));
                }
                s.gc();
            });
            Err(InvocationError::Cancelled)
        }
    }
}

/// Queue a bare object (no reply expected).
pub fn send_object(
    conn: &Connection,
    serializer: &dyn Serializer,
    object: &str,
    args: &Args,
    content_related: bool,
) -> Result<(), InvocationError> {
    let body = serializer.serialize_object(object, args)?;
    conn.enqueue(Phase::Main, OutgoingMessage::object(object, body, content_related));
    Ok(())
}

// ─── Ordered call queues ──────────────────────────────────────────────────────

/// Strict FIFO ordering for calls that share a queue id (chunked uploads:
/// part n+1 must not be sent before part n was answered).
#[derive(Default)]
pub struct CallQueues {
    locks: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
}

impl CallQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, queue_id: u64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(queue_id).or_default().clone()
    }

    /// Invoke under the queue's lock: calls with the same id run one at a
    /// time, in arrival order.
    pub async fn invoke_queued(
        &self,
        conn: &Connection,
        serializer: &dyn Serializer,
        queue_id: u64,
        method: &str,
        args: &Args,
    ) -> Result<Vec<u8>, InvocationError> {
        let queue_lock = self.lock_for(queue_id);
        let _guard = queue_lock.lock().await;
        invoke_in(conn, serializer, Phase::Main, method, args, None, Some(queue_id)).await
    }

    /// Invoke one method repeatedly for a payload split into parts (an
    /// overlong message chunked at the serializer's limit). The queue lock
    /// is held across the whole sequence, and part n+1 is not sent before
    /// part n was answered; the replies come back in part order.
    pub async fn invoke_chunks(
        &self,
        conn: &Connection,
        serializer: &dyn Serializer,
        queue_id: u64,
        method: &str,
        parts: &[Args],
    ) -> Result<Vec<Vec<u8>>, InvocationError> {
        let queue_lock = self.lock_for(queue_id);
        let _guard = queue_lock.lock().await;
        let mut replies = Vec::with_capacity(parts.len());
        for args in parts {
            replies
                .push(invoke_in(conn, serializer, Phase::Main, method, args, None, Some(queue_id)).await?);
        }
        Ok(replies)
    }
}
