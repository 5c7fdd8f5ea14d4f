//! One socket to one datacenter.
//!
//! A [`Connection`] owns the per-socket [`Session`] behind a mutex and
//! drives it with a single task: drain the outgoing queue for the current
//! phase, then wait for either an incoming packet or a wakeup. All msg-id
//! and seq-no assignment happens inside that task, under the session lock.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use carrier_mtproto::envelope::{self, Envelope};
use carrier_mtproto::frame;
use carrier_mtproto::state::{ConnectionState, Phase};
use carrier_mtproto::AuthKeySession;

use crate::arena::MessageHandle;
use crate::clock::Clock;
use crate::message::OutgoingMessage;
use crate::publisher::Publisher;
use crate::session::{Effect, Session};
use crate::transport::Wire;
use crate::write_loop;
use crate::ConnectionSettings;

pub(crate) struct ConnectionInner {
    pub session: Mutex<Session>,
    /// Shared across every socket of the same datacenter.
    pub keys: Arc<Mutex<AuthKeySession>>,
    pub clock: Arc<dyn Clock>,
    pub settings: ConnectionSettings,
    /// Wakes the driver when something was queued.
    pub wake: Notify,
    pub cancel: CancellationToken,
    /// Payloads the transport does not interpret (updates, RPC pushes).
    pub unhandled: Arc<Publisher<Vec<u8>>>,
    /// Set while the driver task is alive and the socket healthy.
    connected: AtomicBool,
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Connection {
    pub fn new(
        session: Session,
        keys: Arc<Mutex<AuthKeySession>>,
        clock: Arc<dyn Clock>,
        settings: ConnectionSettings,
        unhandled: Arc<Publisher<Vec<u8>>>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                session: Mutex::new(session),
                keys,
                clock,
                settings,
                wake: Notify::new(),
                cancel: CancellationToken::new(),
                unhandled,
                connected: AtomicBool::new(false),
            }),
        }
    }

    pub fn keys(&self) -> &Arc<Mutex<AuthKeySession>> {
        &self.inner.keys
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Whether two handles point at the same underlying socket driver.
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queue a message into the given phase queue and wake the driver.
    pub fn enqueue(&self, phase: Phase, message: OutgoingMessage) -> MessageHandle {
        let handle = lock(&self.inner.session).enqueue(phase, message);
        self.inner.wake.notify_one();
        handle
    }

    /// Wake the driver (after an external state change).
    pub fn trigger(&self) {
        self.inner.wake.notify_one();
    }

    /// Queued plus in-flight work, used for pool balancing.
    pub fn load(&self) -> usize {
        let session = lock(&self.inner.session);
        session.queue_len(Phase::Main) + session.pending_count()
    }

    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut lock(&self.inner.session))
    }

    /// Extract every unresolved message, leaving the session empty.
    pub fn backup_session(&self) -> Vec<OutgoingMessage> {
        lock(&self.inner.session).backup()
    }

    /// Adopt messages from a previous connection and wake the driver.
    pub fn restore_session(&self, messages: Vec<OutgoingMessage>) {
        lock(&self.inner.session).restore(messages);
        self.inner.wake.notify_one();
    }

    /// Ask the driver to stop; in-flight messages stay recallable.
    pub fn signal_disconnect(&self) {
        self.inner.cancel.cancel();
        self.inner.wake.notify_one();
    }

    fn current_state(&self) -> ConnectionState {
        lock(&self.inner.keys).state()
    }

    /// Drive the socket until cancellation or an I/O error.
    ///
    /// On return, everything in flight has been recalled so a replacement
    /// connection can pick it up.
    pub async fn run<W: Wire>(&self, mut wire: W) -> io::Result<()> {
        self.inner.connected.store(true, Ordering::SeqCst);
        let result = self.run_inner(&mut wire).await;
        self.inner.connected.store(false, Ordering::SeqCst);
        lock(&self.inner.session).recall_after_disconnect();
        result
    }

    async fn run_inner<W: Wire>(&self, wire: &mut W) -> io::Result<()> {
        loop {
            // Drain the queue the current phase allows.
            loop {
                let phase = self.current_state().phase();
                let payload = self.next_payload(phase, wire.is_http());
                match payload {
                    Some(p) => wire.send(&p).await?,
                    None => break,
                }
            }

            // One check pass for overdue unacked messages.
            let check = {
                let mut session = lock(&self.inner.session);
                let keys = lock(&self.inner.keys);
                if keys.state().is_encrypted() {
                    write_loop::build_check_payload(
                        &mut session,
                        &keys,
                        self.inner.clock.now(),
                        self.inner.settings.resend_timeout_secs,
                    )
                } else {
                    None
                }
            };
            if let Some(p) = check {
                wire.send(&p).await?;
            }

            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(()),
                _ = self.inner.wake.notified() => {}
                packet = wire.recv() => self.dispatch(packet?),
            }
        }
    }

    fn next_payload(&self, phase: Phase, http: bool) -> Option<Vec<u8>> {
        let mut session = lock(&self.inner.session);
        let now = self.inner.clock.now();
        match phase {
            Phase::Unencrypted => {
                let handle = session.pop_sendable(Phase::Unencrypted)?;
                write_loop::build_plain_payload(&mut session, handle, now)
            }
            phase => {
                let keys = lock(&self.inner.keys);
                let batch = write_loop::plan_batch(&mut session, phase);
                if batch.is_empty() {
                    return None;
                }
                write_loop::build_encrypted_payload(&mut session, &keys, batch, now, http)
            }
        }
    }

    fn dispatch(&self, mut packet: Vec<u8>) {
        let state = self.current_state();
        if !state.is_encrypted() {
            // Plain frames only occur during the key exchange, which the
            // pool drives synchronously; anything else here is noise.
            match frame::parse_plain_frame(&packet) {
                Ok((_, body)) => self.inner.unhandled.publish(body.to_vec()),
                Err(e) => tracing::warn!("dropping plain frame: {e}"),
            }
            return;
        }

        let decrypted = {
            let keys = lock(&self.inner.keys);
            let session = lock(&self.inner.session);
            let Some(temp_key) = keys.temporary_key() else {
                tracing::warn!("{}: encrypted packet without a temp key", session.dc());
                return;
            };
            frame::open_encrypted_frame(temp_key, session.session_id(), &mut packet)
        };
        let message = match decrypted {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("dropping encrypted frame: {e}");
                return;
            }
        };

        let server_msg_id = message.msg_id;
        let effects = {
            let mut session = lock(&self.inner.session);
            if message.seq_no % 2 == 1 {
                session.queue_ack(message.msg_id);
            }
            match envelope::parse(&message.body) {
                Ok(Envelope::Other { body, .. }) => {
                    drop(session);
                    self.inner.unhandled.publish(body);
                    Vec::new()
                }
                Ok(envelope) => session.process(envelope),
                Err(e) => {
                    tracing::warn!("{}: bad envelope: {e}", session.dc());
                    Vec::new()
                }
            }
        };

        for effect in effects {
            match effect {
                Effect::AdoptSalt(salt) => {
                    lock(&self.inner.keys).set_server_salt(salt);
                }
                Effect::TimeOffsetAdjusted(_) => {
                    // Re-derive the skew from the server's own msg id.
                    let server_secs = (server_msg_id >> 32) as i64;
                    let offset = (server_secs - self.inner.clock.now()) as i32;
                    let mut session = lock(&self.inner.session);
                    tracing::info!("{}: clock skew corrected to {offset}s", session.dc());
                    session.set_time_offset(offset);
                }
                Effect::SessionReset => {
                    tracing::info!("session reset by server");
                }
            }
        }
        // Acks or recalled messages may now be sendable.
        self.inner.wake.notify_one();
    }
}
