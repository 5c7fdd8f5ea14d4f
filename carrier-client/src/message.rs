//! Outgoing message lifecycle.
//!
//! A message moves `PENDING → SENT → ACKED → REPLIED`; the state is a
//! bitmask because an ack can arrive before or after the reply, and a
//! resend clears `SENT` without touching the rest.

use carrier_mtproto::state::Phase;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::InvocationError;

pub const PENDING: u8 = 0;
pub const SENT: u8 = 1;
pub const ACKED: u8 = 2;
pub const REPLIED: u8 = ACKED | 4;

pub type ResultSender = oneshot::Sender<Result<Vec<u8>, InvocationError>>;

pub struct OutgoingMessage {
    /// Constructor name, for logging and error reporting.
    name: String,
    body: Option<Vec<u8>>,
    /// Assigned on first send; kept across resends of the same payload.
    msg_id: Option<i64>,
    seq_no: Option<i32>,
    /// Methods expect an `rpc_result`; bare objects are done once acked.
    expects_reply: bool,
    content_related: bool,
    unencrypted: bool,
    /// Phase queue this message belongs to; recorded when it is enqueued so
    /// recalls and resends route it back to the right queue.
    phase: Phase,
    state: u8,
    tries: u32,
    sent_at: Option<i64>,
    result: Option<ResultSender>,
    cancellation: CancellationToken,
    /// Calls sharing a queue id are kept strictly ordered (chunked uploads).
    queue_id: Option<u64>,
}

impl OutgoingMessage {
    /// A method call that expects a reply.
    pub fn method(name: impl Into<String>, body: Vec<u8>, result: ResultSender) -> Self {
        Self {
            name: name.into(),
            body: Some(body),
            msg_id: None,
            seq_no: None,
            expects_reply: true,
            content_related: true,
            unencrypted: false,
            phase: Phase::Main,
            state: PENDING,
            tries: 0,
            sent_at: None,
            result: Some(result),
            cancellation: CancellationToken::new(),
            queue_id: None,
        }
    }

    /// A fire-and-forget object; done once the server acknowledges it.
    pub fn object(name: impl Into<String>, body: Vec<u8>, content_related: bool) -> Self {
        Self {
            name: name.into(),
            body: Some(body),
            msg_id: None,
            seq_no: None,
            expects_reply: false,
            content_related,
            unencrypted: false,
            phase: Phase::Main,
            state: PENDING,
            tries: 0,
            sent_at: None,
            result: None,
            cancellation: CancellationToken::new(),
            queue_id: None,
        }
    }

    pub fn with_unencrypted(mut self) -> Self {
        self.unencrypted = true;
        self.content_related = false;
        self
    }

    pub fn with_queue_id(mut self, queue_id: u64) -> Self {
        self.queue_id = Some(queue_id);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Pin the outgoing msg id (the binding payload must share its id with
    /// the outer message). The seq no is still assigned at send time.
    pub fn with_msg_id(mut self, msg_id: i64) -> Self {
        self.msg_id = Some(msg_id);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn serialized_len(&self) -> usize {
        self.body.as_ref().map_or(0, Vec::len)
    }

    pub fn msg_id(&self) -> Option<i64> {
        self.msg_id
    }

    pub fn seq_no(&self) -> Option<i32> {
        self.seq_no
    }

    pub fn expects_reply(&self) -> bool {
        self.expects_reply
    }

    pub fn content_related(&self) -> bool {
        self.content_related
    }

    pub fn is_unencrypted(&self) -> bool {
        self.unencrypted
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn queue_id(&self) -> Option<u64> {
        self.queue_id
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn sent_at(&self) -> Option<i64> {
        self.sent_at
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn state(&self) -> u8 {
        self.state
    }

    pub fn is_sent(&self) -> bool {
        self.state & SENT != 0
    }

    pub fn is_acked(&self) -> bool {
        self.state & ACKED != 0
    }

    pub fn is_replied(&self) -> bool {
        self.state & REPLIED == REPLIED
    }

    /// Went over the wire under `msg_id`/`seq_no` at time `now`.
    pub fn sent(&mut self, msg_id: i64, seq_no: i32, now: i64) {
        self.msg_id = Some(msg_id);
        self.seq_no = Some(seq_no);
        self.sent_at = Some(now);
        self.tries += 1;
        self.state |= SENT;
    }

    /// The message must go out again (timeout, reconnect). Keeps the
    /// assigned ids so the server can deduplicate.
    pub fn reset_sent(&mut self) {
        self.state &= !SENT;
        self.sent_at = None;
    }

    /// Assigned ids are stale (new session or bad salt); fresh ones will be
    /// issued on the next send.
    pub fn reset_ids(&mut self) {
        self.reset_sent();
        self.msg_id = None;
        self.seq_no = None;
    }

    /// Server acknowledged receipt. An object that expects no reply is
    /// complete at this point.
    pub fn ack(&mut self) {
        self.state |= ACKED;
        if !self.expects_reply {
            self.reply(Ok(Vec::new()));
        }
    }

    /// Deliver the final result. Idempotent; frees the serialized body.
    pub fn reply(&mut self, result: Result<Vec<u8>, InvocationError>) {
        if self.is_replied() {
            return;
        }
        self.state |= REPLIED;
        self.body = None;
        if let Some(tx) = self.result.take() {
            let _ = tx.send(result);
        }
    }

    /// Replied messages hold no bodies and no waiters; drop them.
    pub fn can_garbage_collect(&self) -> bool {
        self.is_replied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_bits() {
        let (tx, mut rx) = oneshot::channel();
        let mut m = OutgoingMessage::method("ping", vec![0; 8], tx);
        assert_eq!(m.state(), PENDING);

        m.sent(4, 1, 100);
        assert!(m.is_sent());
        assert_eq!(m.tries(), 1);

        m.ack();
        assert!(m.is_acked());
        assert!(!m.is_replied(), "a method is not done until it gets a reply");
        assert!(rx.try_recv().is_err());

        m.reply(Ok(vec![1]));
        assert!(m.is_replied());
        assert!(m.can_garbage_collect());
        assert_eq!(rx.try_recv().unwrap().unwrap(), vec![1]);
    }

    #[test]
    fn ack_completes_an_object() {
        let mut m = OutgoingMessage::object("msgs_ack", vec![0; 8], false);
        m.sent(4, 0, 100);
        m.ack();
        assert!(m.is_replied());
        assert!(m.body().is_none());
    }

    #[test]
    fn reply_is_idempotent() {
        let (tx, mut rx) = oneshot::channel();
        let mut m = OutgoingMessage::method("ping", vec![0; 8], tx);
        m.reply(Ok(vec![1]));
        m.reply(Ok(vec![2]));
        assert_eq!(rx.try_recv().unwrap().unwrap(), vec![1]);
    }

    #[test]
    fn resend_keeps_ids_and_counts_tries() {
        let mut m = OutgoingMessage::object("data", vec![0; 8], true);
        m.sent(4, 1, 100);
        m.reset_sent();
        assert!(!m.is_sent());
        assert_eq!(m.msg_id(), Some(4));
        m.sent(4, 1, 160);
        assert_eq!(m.tries(), 2);
    }
}
