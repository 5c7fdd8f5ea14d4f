//! Per-connection session bookkeeping.
//!
//! One [`Session`] owns everything a single socket needs to deliver
//! reliably: the outgoing queues (one per connection phase), the table of
//! sent-but-unresolved messages, the acknowledgment queue and the
//! `msgs_state_req` check list. It is pure state; the read and write loops
//! drive it under the connection mutex, which is what keeps msg-id and
//! seq-no assignment single-writer.

use std::collections::{HashMap, HashSet};

use carrier_mtproto::envelope::{Envelope, RpcOutcome};
use carrier_mtproto::state::Phase;
use carrier_mtproto::{DcId, MsgIdGen, SeqNoGen};

use crate::arena::{MessageArena, MessageHandle, OutQueue};
use crate::message::OutgoingMessage;
use crate::{InvocationError, RpcError};

/// How a processed envelope affects state owned outside the session.
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// The server issued a new salt; install it in the key session.
    AdoptSalt(i64),
    /// Client clock is off; msg ids were corrected by this many seconds.
    TimeOffsetAdjusted(i32),
    /// Our session was torn down server-side; a fresh one was created.
    SessionReset,
}

pub struct Session {
    dc: DcId,
    session_id: i64,
    msg_ids: MsgIdGen,
    seq: SeqNoGen,
    arena: MessageArena,
    unencrypted: OutQueue,
    uninited: OutQueue,
    main: OutQueue,
    /// Sent messages awaiting ack or reply, by msg id.
    pending: HashMap<i64, MessageHandle>,
    /// Incoming content-related msg ids we still owe an ack for.
    to_ack: Vec<i64>,
    /// Incoming msg ids whose bodies we failed to read; ask for them again.
    to_resend_req: Vec<i64>,
    /// Msg ids currently queried via `msgs_state_req`.
    check_list: HashSet<i64>,
    /// Outstanding state requests: request msg id → queried msg ids.
    state_reqs: HashMap<i64, Vec<i64>>,
}

fn random_session_id() -> i64 {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    i64::from_le_bytes(bytes)
}

impl Session {
    pub fn new(dc: DcId, time_offset: i32) -> Self {
        Self {
            dc,
            session_id: random_session_id(),
            msg_ids: MsgIdGen::new(time_offset),
            seq: SeqNoGen::new(),
            arena: MessageArena::new(),
            unencrypted: OutQueue::new(),
            uninited: OutQueue::new(),
            main: OutQueue::new(),
            pending: HashMap::new(),
            to_ack: Vec::new(),
            to_resend_req: Vec::new(),
            check_list: HashSet::new(),
            state_reqs: HashMap::new(),
        }
    }

    pub fn dc(&self) -> DcId {
        self.dc
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn time_offset(&self) -> i32 {
        self.msg_ids.time_offset()
    }

    pub fn next_msg_id(&mut self) -> i64 {
        self.msg_ids.generate()
    }

    pub fn next_seq_no(&mut self, content_related: bool) -> i32 {
        self.seq.next(content_related)
    }

    // ─── Queueing ────────────────────────────────────────────────────────────

    /// Queue a message for the given connection phase.
    pub fn enqueue(&mut self, phase: Phase, mut message: OutgoingMessage) -> MessageHandle {
        message.set_phase(phase);
        let handle = self.arena.insert(message);
        self.queue_mut(phase).push(handle);
        handle
    }

    fn queue_mut(&mut self, phase: Phase) -> &mut OutQueue {
        match phase {
            Phase::Unencrypted => &mut self.unencrypted,
            Phase::Uninited => &mut self.uninited,
            Phase::Main => &mut self.main,
        }
    }

    /// Pop the next sendable message for `phase`, skipping cancelled ones.
    pub fn pop_sendable(&mut self, phase: Phase) -> Option<MessageHandle> {
        loop {
            let handle = match phase {
                Phase::Unencrypted => self.unencrypted.pop_live(&self.arena),
                Phase::Uninited => self.uninited.pop_live(&self.arena),
                Phase::Main => self.main.pop_live(&self.arena),
            }?;
            let message = self.arena.get_mut(handle)?;
            if message.is_cancelled() && !message.is_sent() {
                // Never went out; drop it without telling the server.
                message.reply(Err(InvocationError::Cancelled));
                self.arena.remove(handle);
                continue;
            }
            return Some(handle);
        }
    }

    /// Put a popped-but-unsent message back at the head of its queue, so a
    /// batch-overflow carry keeps its place in front of newer traffic.
    pub fn requeue_front(&mut self, phase: Phase, handle: MessageHandle) {
        self.queue_mut(phase).push_front(handle);
    }

    pub fn queue_len(&self, phase: Phase) -> usize {
        match phase {
            Phase::Unencrypted => self.unencrypted.len(),
            Phase::Uninited => self.uninited.len(),
            Phase::Main => self.main.len(),
        }
    }

    pub fn arena(&self) -> &MessageArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut MessageArena {
        &mut self.arena
    }

    // ─── Send bookkeeping ────────────────────────────────────────────────────

    /// Record that `handle` went over the wire under freshly assigned ids.
    pub fn mark_sent(&mut self, handle: MessageHandle, msg_id: i64, seq_no: i32, now: i64) {
        if let Some(message) = self.arena.get_mut(handle) {
            message.sent(msg_id, seq_no, now);
            if !message.is_unencrypted() {
                self.pending.insert(msg_id, handle);
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_handle(&self, msg_id: i64) -> Option<MessageHandle> {
        self.pending.get(&msg_id).copied()
    }

    // ─── Acks ────────────────────────────────────────────────────────────────

    /// An incoming content-related message we must acknowledge.
    pub fn queue_ack(&mut self, msg_id: i64) {
        self.to_ack.push(msg_id);
    }

    pub fn has_acks(&self) -> bool {
        !self.to_ack.is_empty()
    }

    /// Take the queued acks for sending.
    pub fn take_acks(&mut self) -> Vec<i64> {
        std::mem::take(&mut self.to_ack)
    }

    /// The server did not process these acks; queue them again.
    pub fn return_acks(&mut self, acks: Vec<i64>) {
        self.to_ack.extend(acks);
    }

    /// Take the msg ids queued for a `msg_resend_req`.
    pub fn take_resend_reqs(&mut self) -> Vec<i64> {
        std::mem::take(&mut self.to_resend_req)
    }

    // ─── Resolution ──────────────────────────────────────────────────────────

    fn ack_message(&mut self, msg_id: i64) {
        if let Some(&handle) = self.pending.get(&msg_id) {
            if let Some(message) = self.arena.get_mut(handle) {
                message.ack();
                if message.can_garbage_collect() {
                    self.arena.remove(handle);
                    self.pending.remove(&msg_id);
                }
            }
        }
    }

    fn reply(&mut self, msg_id: i64, result: Result<Vec<u8>, InvocationError>) {
        if let Some(handle) = self.pending.remove(&msg_id) {
            if let Some(message) = self.arena.get_mut(handle) {
                message.reply(result);
            }
            self.arena.remove(handle);
        }
        self.check_list.remove(&msg_id);
    }

    /// Put a sent message back at the head of its queue for a fresh send
    /// under new ids.
    fn recall(&mut self, msg_id: i64) {
        if let Some(handle) = self.pending.remove(&msg_id) {
            if let Some(message) = self.arena.get_mut(handle) {
                message.reset_ids();
                let phase = message.phase();
                self.queue_mut(phase).push_front(handle);
            }
        }
        self.check_list.remove(&msg_id);
    }

    /// Resend a message under its existing ids (the server never saw it).
    fn resend(&mut self, msg_id: i64) {
        if let Some(&handle) = self.pending.get(&msg_id) {
            if let Some(message) = self.arena.get_mut(handle) {
                message.reset_sent();
                let phase = message.phase();
                self.pending.remove(&msg_id);
                self.queue_mut(phase).push_front(handle);
            }
        }
        self.check_list.remove(&msg_id);
    }

    // ─── State requests ──────────────────────────────────────────────────────

    /// Sent messages whose ack is overdue and not already being checked.
    pub fn overdue_sent(&mut self, now: i64, timeout: i64) -> Vec<i64> {
        let mut ids: Vec<i64> = Vec::new();
        for (&msg_id, &handle) in &self.pending {
            if self.check_list.contains(&msg_id) {
                continue;
            }
            let Some(message) = self.arena.get(handle) else { continue };
            if message.is_sent()
                && !message.is_acked()
                && message.sent_at().is_some_and(|t| now - t >= timeout)
            {
                ids.push(msg_id);
            }
        }
        ids.sort_unstable();
        self.check_list.extend(ids.iter().copied());
        ids
    }

    /// Record an outstanding `msgs_state_req`.
    pub fn record_state_req(&mut self, req_msg_id: i64, queried: Vec<i64>) {
        self.state_reqs.insert(req_msg_id, queried);
    }

    fn apply_state_info(&mut self, req_msg_id: i64, info: &[u8]) {
        let Some(queried) = self.state_reqs.remove(&req_msg_id) else { return };
        for (i, &msg_id) in queried.iter().enumerate() {
            let status = info.get(i).copied().unwrap_or(1);
            self.check_list.remove(&msg_id);
            if status & 4 != 0 {
                // Received; an answer is coming (or was already sent).
                self.ack_message(msg_id);
            } else {
                // 1: nothing known, 2: not received, 3: undeliverable.
                self.resend(msg_id);
            }
        }
    }

    // ─── Incoming envelopes ──────────────────────────────────────────────────

    /// Process one decoded envelope; returns effects for state owned by the
    /// connection (salt, clock, session identity).
    pub fn process(&mut self, envelope: Envelope) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.process_into(envelope, &mut effects);
        effects
    }

    fn process_into(&mut self, envelope: Envelope, effects: &mut Vec<Effect>) {
        match envelope {
            Envelope::Container(messages) => {
                for inner in messages {
                    if inner.seq_no % 2 == 1 {
                        self.queue_ack(inner.msg_id);
                    }
                    match carrier_mtproto::envelope::parse(&inner.body) {
                        Ok(e) => self.process_into(e, effects),
                        Err(e) => {
                            tracing::warn!("{}: bad inner envelope: {e}", self.dc);
                            self.to_resend_req.push(inner.msg_id);
                        }
                    }
                }
            }
            Envelope::RpcResult { req_msg_id, outcome } => {
                let result = match outcome {
                    RpcOutcome::Ok(body) => Ok(body),
                    RpcOutcome::Err { code, message } => {
                        Err(RpcError::from_wire(code, &message).into())
                    }
                };
                self.reply(req_msg_id, result);
            }
            Envelope::Pong { msg_id, .. } => {
                // A pong doubles as an ack for everything sent before it.
                self.reply(msg_id, Ok(Vec::new()));
            }
            Envelope::MsgsAck { msg_ids } => {
                for msg_id in msg_ids {
                    self.ack_message(msg_id);
                }
            }
            Envelope::BadServerSalt { bad_msg_id, new_server_salt, .. } => {
                effects.push(Effect::AdoptSalt(new_server_salt));
                self.recall(bad_msg_id);
            }
            Envelope::BadMsgNotification { bad_msg_id, error_code, .. } => {
                match error_code {
                    16 | 17 => {
                        // Our msg ids land outside the server's window: the
                        // clock is off. Resync from the server time implied
                        // by the last valid server msg id is done upstream;
                        // here we just flag the drift and replay.
                        effects.push(Effect::TimeOffsetAdjusted(0));
                        self.recall(bad_msg_id);
                    }
                    32 | 33 => {
                        // seq_no desync is unrecoverable in place.
                        effects.push(Effect::SessionReset);
                        self.reset();
                    }
                    48 => {
                        // Stale salt without a replacement; the connection
                        // fetches a fresh one and replays.
                        self.recall(bad_msg_id);
                    }
                    code => {
                        self.reply(
                            bad_msg_id,
                            Err(InvocationError::Deserialize(format!(
                                "bad_msg_notification {code}"
                            ))),
                        );
                    }
                }
            }
            Envelope::NewSessionCreated { server_salt, first_msg_id, .. } => {
                effects.push(Effect::AdoptSalt(server_salt));
                // Anything sent before the server's first seen message is
                // lost; replay it.
                let lost: Vec<i64> =
                    self.pending.keys().copied().filter(|&id| id < first_msg_id).collect();
                for msg_id in lost {
                    self.recall(msg_id);
                }
            }
            Envelope::MsgsStateInfo { req_msg_id, info } => {
                self.reply(req_msg_id, Ok(Vec::new()));
                self.apply_state_info(req_msg_id, &info);
            }
            Envelope::Other { .. } => {
                // Updates and RPC payloads are the dispatcher's concern.
            }
        }
    }

    // ─── Session identity ────────────────────────────────────────────────────

    /// Correct the clock skew; future msg ids use the new offset.
    pub fn set_time_offset(&mut self, offset: i32) {
        self.msg_ids.set_time_offset(offset);
    }

    /// Tear down the session identity and recall everything in flight.
    ///
    /// Queued-but-unsent messages stay queued; sent ones go back to the
    /// head of their queue with their ids cleared.
    pub fn reset(&mut self) {
        self.session_id = random_session_id();
        self.seq.reset();
        self.msg_ids.reset();
        let in_flight: Vec<i64> = self.pending.keys().copied().collect();
        for msg_id in in_flight {
            self.recall(msg_id);
        }
        self.to_ack.clear();
        self.to_resend_req.clear();
        self.check_list.clear();
        self.state_reqs.clear();
    }

    /// Recall every in-flight message after a transport loss; ids are kept
    /// so the server can deduplicate on the new socket.
    pub fn recall_after_disconnect(&mut self) {
        let in_flight: Vec<i64> = self.pending.keys().copied().collect();
        for msg_id in in_flight {
            self.resend(msg_id);
        }
        self.to_ack.clear();
        self.to_resend_req.clear();
        self.check_list.clear();
        self.state_reqs.clear();
    }

    // ─── Backup / restore ────────────────────────────────────────────────────

    /// Extract every unresolved message for migration to another
    /// connection. The session is left empty.
    pub fn backup(&mut self) -> Vec<OutgoingMessage> {
        self.pending.clear();
        self.unencrypted.clear();
        self.uninited.clear();
        self.main.clear();
        self.to_ack.clear();
        self.to_resend_req.clear();
        self.check_list.clear();
        self.state_reqs.clear();
        let mut messages = self.arena.drain_where(|_| true);
        messages.retain(|m| {
            if m.is_replied() || m.is_cancelled() {
                return false;
            }
            true
        });
        for message in &mut messages {
            message.reset_ids();
        }
        messages
    }

    /// Adopt messages extracted from another session, each into the queue
    /// of the phase it was originally enqueued for.
    pub fn restore(&mut self, messages: Vec<OutgoingMessage>) {
        for message in messages {
            let phase = message.phase();
            self.enqueue(phase, message);
        }
    }

    /// Drop replied and never-sent-cancelled messages.
    pub fn gc(&mut self) {
        let dead = self.arena.drain_where(|m| m.can_garbage_collect());
        drop(dead);
        let arena = &self.arena;
        self.pending.retain(|_, handle| arena.get(*handle).is_some());
    }
}
