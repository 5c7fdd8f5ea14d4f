//! Outgoing batch planning and payload assembly.
//!
//! The planner decides *what* goes into the next wire packet (pure, no
//! clocks or sockets); assembly assigns msg ids and seq numbers in queue
//! order and produces the final frame. Both run under the connection
//! mutex, so id assignment has a single writer per session.

use carrier_mtproto::envelope;
use carrier_mtproto::frame;
use carrier_mtproto::state::Phase;
use carrier_mtproto::AuthKeySession;

use crate::arena::MessageHandle;
use crate::session::Session;

/// Hard cap on one encrypted packet's payload bytes.
pub const MAX_BATCH_BYTES: usize = 32_760;
/// Hard cap on messages per container.
pub const MAX_BATCH_COUNT: usize = 1_020;
/// Per-message envelope overhead inside a container.
pub const MESSAGE_OVERHEAD: usize = 32;

/// Long-poll window for HTTP-like wires, in seconds.
pub const HTTP_WAIT_SECS: i32 = 30;

/// What the next packet will carry.
pub struct PlannedBatch {
    pub entries: Vec<MessageHandle>,
    pub acks: Vec<i64>,
    /// At most one `msg_resend_req` rides along per packet.
    pub resend_reqs: Vec<i64>,
}

impl PlannedBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.acks.is_empty() && self.resend_reqs.is_empty()
    }
}

/// Pick the next batch for `phase`, respecting the byte and count caps.
///
/// Unsendable (cancelled-before-send) messages are dropped by the session
/// while popping. Messages that do not fit stay queued for the next pass.
pub fn plan_batch(session: &mut Session, phase: Phase) -> PlannedBatch {
    let mut entries = Vec::new();
    let (acks, resend_reqs) = if phase == Phase::Main {
        (session.take_acks(), session.take_resend_reqs())
    } else {
        (Vec::new(), Vec::new())
    };
    let mut total = if acks.is_empty() { 0 } else { 12 + 8 * acks.len() + MESSAGE_OVERHEAD };
    total += if resend_reqs.is_empty() { 0 } else { 12 + 8 * resend_reqs.len() + MESSAGE_OVERHEAD };
    let mut count = usize::from(!acks.is_empty()) + usize::from(!resend_reqs.is_empty());

    while count < MAX_BATCH_COUNT {
        let Some(handle) = session.pop_sendable(phase) else { break };
        let len = session
            .arena()
            .get(handle)
            .map_or(0, |m| m.serialized_len() + MESSAGE_OVERHEAD);
        if !entries.is_empty() && total + len > MAX_BATCH_BYTES {
            session.requeue_front(phase, handle);
            break;
        }
        total += len;
        count += 1;
        entries.push(handle);
        if phase == Phase::Unencrypted {
            // Plain frames carry exactly one message.
            break;
        }
    }
    PlannedBatch { entries, acks, resend_reqs }
}

/// Assemble and record a plain (unencrypted) frame for one message.
pub fn build_plain_payload(
    session: &mut Session,
    handle: MessageHandle,
    now: i64,
) -> Option<Vec<u8>> {
    let body = session.arena().get(handle)?.body()?.to_vec();
    let msg_id = session.next_msg_id();
    session.mark_sent(handle, msg_id, 0, now);
    Some(frame::build_plain_frame(msg_id, &body))
}

/// Assemble and record an encrypted frame carrying the whole batch.
///
/// Children are assigned ids in order; the container (when one is needed)
/// gets its id last so it is the largest. Returns `None` when the key
/// session cannot encrypt yet.
pub fn build_encrypted_payload(
    session: &mut Session,
    keys: &AuthKeySession,
    batch: PlannedBatch,
    now: i64,
    http: bool,
) -> Option<Vec<u8>> {
    let temp_key = keys.temporary_key()?.clone();
    let salt = keys.server_salt()?;

    let mut parts: Vec<(i64, i32, Vec<u8>)> = Vec::with_capacity(batch.entries.len() + 2);

    for handle in batch.entries {
        let message = session.arena().get(handle)?;
        let body = message.body()?.to_vec();
        let content_related = message.content_related();
        // A resend (or a pinned id) reuses what was already assigned.
        let preset = (message.msg_id(), message.seq_no());
        let msg_id = preset.0.unwrap_or_else(|| session.next_msg_id());
        let seq_no = preset.1.unwrap_or_else(|| session.next_seq_no(content_related));
        session.mark_sent(handle, msg_id, seq_no, now);
        parts.push((msg_id, seq_no, body));
    }

    if !batch.acks.is_empty() {
        let body = envelope::serialize_msgs_ack(&batch.acks);
        let msg_id = session.next_msg_id();
        let seq_no = session.next_seq_no(false);
        parts.push((msg_id, seq_no, body));
    }

    if !batch.resend_reqs.is_empty() {
        let body = envelope::serialize_msg_resend_req(&batch.resend_reqs);
        let msg_id = session.next_msg_id();
        let seq_no = session.next_seq_no(false);
        parts.push((msg_id, seq_no, body));
    }

    if http && !parts.is_empty() {
        let body = envelope::serialize_http_wait(500, 150, HTTP_WAIT_SECS * 1000);
        let msg_id = session.next_msg_id();
        let seq_no = session.next_seq_no(false);
        parts.push((msg_id, seq_no, body));
    }

    if parts.is_empty() {
        return None;
    }

    let (msg_id, seq_no, body) = if parts.len() == 1 {
        parts.pop().unwrap_or_default()
    } else {
        let body = envelope::serialize_container(&parts);
        let msg_id = session.next_msg_id();
        let seq_no = session.next_seq_no(false);
        (msg_id, seq_no, body)
    };

    Some(frame::build_encrypted_frame(
        &temp_key,
        salt,
        session.session_id(),
        msg_id,
        seq_no,
        &body,
    ))
}

/// Build a `msgs_state_req` for overdue sent messages, if any.
pub fn build_check_payload(
    session: &mut Session,
    keys: &AuthKeySession,
    now: i64,
    resend_timeout: i64,
) -> Option<Vec<u8>> {
    let overdue = session.overdue_sent(now, resend_timeout);
    if overdue.is_empty() {
        return None;
    }
    tracing::debug!("{}: checking state of {} unacked messages", session.dc(), overdue.len());
    let temp_key = keys.temporary_key()?.clone();
    let salt = keys.server_salt()?;
    let body = envelope::serialize_msgs_state_req(&overdue);
    let msg_id = session.next_msg_id();
    let seq_no = session.next_seq_no(false);
    session.record_state_req(msg_id, overdue);
    Some(frame::build_encrypted_frame(
        &temp_key,
        salt,
        session.session_id(),
        msg_id,
        seq_no,
        &body,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use carrier_mtproto::state::{DcId, LoginState};
    use carrier_mtproto::AuthKeySession;

    use crate::message::OutgoingMessage;

    fn session() -> Session {
        Session::new(DcId::new(2), 0)
    }

    fn keys() -> AuthKeySession {
        let dc = DcId::new(2);
        let mut keys = AuthKeySession::new(dc, false, LoginState::NotLoggedIn);
        let _ = keys.set_permanent_key(Some([1u8; 256]));
        let _ = keys.set_temporary_key(Some(([2u8; 256], 0x1122, 0)));
        keys
    }

    fn queue_object(session: &mut Session, len: usize) -> MessageHandle {
        session.enqueue(Phase::Main, OutgoingMessage::object("data", vec![0xAA; len], true))
    }

    #[test]
    fn batch_respects_byte_cap() {
        let mut s = session();
        for _ in 0..4 {
            queue_object(&mut s, 12_000);
        }
        let batch = plan_batch(&mut s, Phase::Main);
        // 2 × (12000 + 32) fits in 32760; a third does not.
        assert_eq!(batch.entries.len(), 2);
        assert_eq!(s.queue_len(Phase::Main), 2);
    }

    #[test]
    fn batch_respects_count_cap() {
        let mut s = session();
        // Empty bodies keep 1,020 × 32 bytes of overhead under the byte
        // cap, so the count cap is what stops the batch.
        for _ in 0..MAX_BATCH_COUNT + 5 {
            queue_object(&mut s, 0);
        }
        let batch = plan_batch(&mut s, Phase::Main);
        assert_eq!(batch.entries.len(), MAX_BATCH_COUNT);
        assert_eq!(s.queue_len(Phase::Main), 5);
    }

    #[test]
    fn overflow_is_carried_in_queue_order() {
        let mut s = session();
        for name in ["a", "b", "c", "d"] {
            s.enqueue(Phase::Main, OutgoingMessage::object(name, vec![0xAA; 12_000], true));
        }
        let names = |s: &Session, batch: &PlannedBatch| -> Vec<String> {
            batch
                .entries
                .iter()
                .filter_map(|&h| s.arena().get(h).map(|m| m.name().to_string()))
                .collect()
        };

        let first = plan_batch(&mut s, Phase::Main);
        assert_eq!(names(&s, &first), ["a", "b"]);
        // The message that overflowed the byte cap goes out next, ahead of
        // anything queued behind it.
        let second = plan_batch(&mut s, Phase::Main);
        assert_eq!(names(&s, &second), ["c", "d"]);
    }

    #[test]
    fn an_oversized_message_still_goes_out_alone() {
        let mut s = session();
        queue_object(&mut s, MAX_BATCH_BYTES * 2);
        let batch = plan_batch(&mut s, Phase::Main);
        assert_eq!(batch.entries.len(), 1);
    }

    #[test]
    fn acks_ride_along() {
        let mut s = session();
        s.queue_ack(101);
        s.queue_ack(102);
        queue_object(&mut s, 16);
        let batch = plan_batch(&mut s, Phase::Main);
        assert_eq!(batch.acks, vec![101, 102]);
        assert_eq!(batch.entries.len(), 1);
        assert!(!s.has_acks());
    }

    #[test]
    fn single_message_is_sent_bare() {
        let mut s = session();
        let k = keys();
        let h = queue_object(&mut s, 16);
        let batch = plan_batch(&mut s, Phase::Main);
        let wire = build_encrypted_payload(&mut s, &k, batch, 1000, false).unwrap();
        assert!(!wire.is_empty());
        let m = s.arena().get(h).unwrap();
        assert!(m.is_sent());
        assert_eq!(m.seq_no(), Some(1), "first content-related message");
        assert_eq!(s.pending_count(), 1);
    }

    #[test]
    fn multiple_messages_become_a_container() {
        let mut s = session();
        let k = keys();
        let a = queue_object(&mut s, 16);
        let b = queue_object(&mut s, 16);
        let batch = plan_batch(&mut s, Phase::Main);
        build_encrypted_payload(&mut s, &k, batch, 1000, false).unwrap();
        let id_a = s.arena().get(a).unwrap().msg_id().unwrap();
        let id_b = s.arena().get(b).unwrap().msg_id().unwrap();
        assert!(id_b > id_a, "ids assigned in queue order");
        assert_eq!(s.pending_count(), 2);
    }

    #[test]
    fn resend_reuses_assigned_ids() {
        let mut s = session();
        let k = keys();
        let h = queue_object(&mut s, 16);
        let batch = plan_batch(&mut s, Phase::Main);
        build_encrypted_payload(&mut s, &k, batch, 1000, false).unwrap();
        let first_id = s.arena().get(h).unwrap().msg_id().unwrap();

        s.recall_after_disconnect();
        let batch = plan_batch(&mut s, Phase::Main);
        assert_eq!(batch.entries.len(), 1);
        build_encrypted_payload(&mut s, &k, batch, 1060, false).unwrap();
        let m = s.arena().get(h).unwrap();
        assert_eq!(m.msg_id(), Some(first_id));
        assert_eq!(m.tries(), 2);
    }

    #[test]
    fn check_pass_covers_overdue_messages_once() {
        let mut s = session();
        let k = keys();
        queue_object(&mut s, 16);
        let batch = plan_batch(&mut s, Phase::Main);
        build_encrypted_payload(&mut s, &k, batch, 1000, false).unwrap();

        assert!(build_check_payload(&mut s, &k, 1030, 60).is_none(), "not overdue yet");
        assert!(build_check_payload(&mut s, &k, 1070, 60).is_some());
        assert!(build_check_payload(&mut s, &k, 1071, 60).is_none(), "already being checked");
    }
}
