//! Keepalive: periodic `ping_delay_disconnect`.
//!
//! The ping doubles as a liveness probe; a pong that never arrives within
//! the disconnect delay means the socket is dead even though reads have
//! not failed yet, so the connection is told to tear itself down.

use std::time::Duration;

use tokio::sync::oneshot;

use carrier_mtproto::envelope;
use carrier_mtproto::state::Phase;

use crate::connection::Connection;
use crate::message::OutgoingMessage;

pub async fn ping_loop(conn: Connection) {
    let clock = conn.clock().clone();
    let interval = Duration::from_secs(conn.settings().ping_interval_secs);
    let grace = conn.settings().ping_disconnect_delay_secs;
    let mut ping_id: i64 = {
        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        i64::from_le_bytes(bytes)
    };

    loop {
        tokio::select! {
            _ = conn.cancellation().cancelled() => return,
            _ = clock.sleep(interval) => {}
        }
        if !conn.is_connected() {
            continue;
        }
        // Pings only make sense on a fully established session.
        let ready = {
            let keys = conn.keys().lock().unwrap_or_else(|e| e.into_inner());
            keys.state().phase() == Phase::Main
        };
        if !ready {
            continue;
        }

        ping_id = ping_id.wrapping_add(1);
        let body = envelope::serialize_ping_delay_disconnect(ping_id, grace as i32);
        let (tx, rx) = oneshot::channel();
        conn.enqueue(Phase::Main, OutgoingMessage::method("ping_delay_disconnect", body, tx));

        tokio::select! {
            _ = conn.cancellation().cancelled() => return,
            reply = rx => {
                if reply.is_err() {
                    // Sender side dropped without replying; the session was
                    // torn down under us.
                    continue;
                }
            }
            _ = clock.sleep(Duration::from_secs(grace)) => {
                tracing::warn!("no pong within {grace}s, dropping connection");
                conn.signal_disconnect();
                return;
            }
        }
    }
}
