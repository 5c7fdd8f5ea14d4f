//! Strict ordering of calls that share a queue id.

use std::sync::{Arc, Mutex};

use carrier_client::{
    call::CallQueues, Args, Connection, ConnectionSettings, ManualClock, Phase, Publisher,
    Serializer, Session,
};
use carrier_mtproto::envelope::{Envelope, RpcOutcome};
use carrier_mtproto::state::{DcId, LoginState};
use carrier_mtproto::{AuthKeySession, SerializeError};

struct EchoSerializer;

impl Serializer for EchoSerializer {
    fn serialize_method(&self, method: &str, _args: &Args) -> Result<Vec<u8>, SerializeError> {
        Ok(method.as_bytes().to_vec())
    }

    fn serialize_object(&self, object: &str, _args: &Args) -> Result<Vec<u8>, SerializeError> {
        Ok(object.as_bytes().to_vec())
    }
}

fn connection() -> Connection {
    let dc = DcId::new(2);
    Connection::new(
        Session::new(dc, 0),
        Arc::new(Mutex::new(AuthKeySession::new(dc, false, LoginState::NotLoggedIn))),
        Arc::new(ManualClock::at(1_700_000_000)),
        ConnectionSettings::default(),
        Arc::new(Publisher::new()),
    )
}

async fn wait_queued(conn: &Connection) {
    while conn.with_session(|s| s.queue_len(Phase::Main)) == 0 {
        tokio::task::yield_now().await;
    }
}

/// Play the write loop for one message and hand back its wire msg id.
fn send_next(conn: &Connection) -> i64 {
    conn.with_session(|s| {
        let handle = s.pop_sendable(Phase::Main).unwrap();
        let msg_id = s.next_msg_id();
        let seq_no = s.next_seq_no(true);
        s.mark_sent(handle, msg_id, seq_no, 1_700_000_000);
        msg_id
    })
}

#[tokio::test]
async fn chunked_calls_go_out_strictly_in_order() {
    let conn = connection();
    let queues = Arc::new(CallQueues::new());

    let task = {
        let conn = conn.clone();
        let queues = Arc::clone(&queues);
        tokio::spawn(async move {
            let parts = vec![Args::new(), Args::new()];
            queues.invoke_chunks(&conn, &EchoSerializer, 7, "messages.sendMessage", &parts).await
        })
    };

    // Exactly one part is on the wire; the second waits for its answer.
    wait_queued(&conn).await;
    let first_id = send_next(&conn);
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(conn.with_session(|s| s.queue_len(Phase::Main)), 0);

    conn.with_session(|s| {
        s.process(Envelope::RpcResult { req_msg_id: first_id, outcome: RpcOutcome::Ok(vec![1]) });
    });

    // Only now does part two show up.
    wait_queued(&conn).await;
    let second_id = send_next(&conn);
    assert!(second_id > first_id);
    conn.with_session(|s| {
        s.process(Envelope::RpcResult { req_msg_id: second_id, outcome: RpcOutcome::Ok(vec![2]) });
    });

    let replies = task.await.unwrap().unwrap();
    assert_eq!(replies, vec![vec![1], vec![2]], "replies come back in part order");
}
