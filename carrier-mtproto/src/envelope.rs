//! Envelope constructors as a closed tagged union.
//!
//! Only the service constructors the transport itself speaks are decoded
//! here; anything else is handed back raw for the TL collaborator to
//! deserialize. Constructor ids are the wire values.

// Incoming service constructors.
pub const ID_MSG_CONTAINER: u32 = 0x73f1f8dc;
pub const ID_RPC_RESULT: u32 = 0xf35c6d01;
pub const ID_RPC_ERROR: u32 = 0x2144ca19;
pub const ID_PONG: u32 = 0x347773c5;
pub const ID_MSGS_ACK: u32 = 0x62d6b459;
pub const ID_BAD_SERVER_SALT: u32 = 0xedab447b;
pub const ID_BAD_MSG_NOTIFICATION: u32 = 0xa7eff811;
pub const ID_NEW_SESSION_CREATED: u32 = 0x9ec20908;
pub const ID_MSGS_STATE_INFO: u32 = 0x04deb57d;
pub const ID_GZIP_PACKED: u32 = 0x3072cfa1;

// Outgoing service constructors.
pub const ID_MSGS_STATE_REQ: u32 = 0xda69fb52;
pub const ID_MSG_RESEND_REQ: u32 = 0x7d861a08;
pub const ID_HTTP_WAIT: u32 = 0x9299359f;
pub const ID_PING_DELAY_DISCONNECT: u32 = 0xf3427b8c;
pub const ID_RPC_DROP_ANSWER: u32 = 0x58e4a740;
pub const ID_BIND_AUTH_KEY_INNER: u32 = 0x75a3f765;

const ID_VECTOR: u32 = 0x1cb5c415;

/// One message unwrapped from a `msg_container`.
#[derive(Clone, Debug, PartialEq)]
pub struct InnerMessage {
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
}

/// Outcome of an RPC, as carried by `rpc_result`.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcOutcome {
    /// Raw reply bytes; may still be `gzip_packed`, which is the TL
    /// collaborator's concern.
    Ok(Vec<u8>),
    Err { code: i32, message: String },
}

/// A decoded incoming envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    Container(Vec<InnerMessage>),
    RpcResult { req_msg_id: i64, outcome: RpcOutcome },
    Pong { msg_id: i64, ping_id: i64 },
    MsgsAck { msg_ids: Vec<i64> },
    BadServerSalt { bad_msg_id: i64, bad_msg_seqno: i32, error_code: i32, new_server_salt: i64 },
    BadMsgNotification { bad_msg_id: i64, bad_msg_seqno: i32, error_code: i32 },
    NewSessionCreated { first_msg_id: i64, unique_id: i64, server_salt: i64 },
    MsgsStateInfo { req_msg_id: i64, info: Vec<u8> },
    /// Anything the transport does not interpret itself.
    Other { constructor_id: u32, body: Vec<u8> },
}

/// Errors from [`parse`].
#[derive(Clone, Debug, PartialEq)]
pub enum ParseError {
    Truncated,
    BadVector,
    BadString,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "envelope truncated"),
            Self::BadVector => write!(f, "malformed vector"),
            Self::BadString => write!(f, "malformed TL string"),
        }
    }
}
impl std::error::Error for ParseError {}

// ─── Reader ──────────────────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.pos + n > self.data.len() {
            return Err(ParseError::Truncated);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, ParseError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, ParseError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// TL bytes: 1-byte length (or 0xfe + 3 bytes), payload, pad to 4.
    fn tl_bytes(&mut self) -> Result<Vec<u8>, ParseError> {
        let first = self.take(1)?[0];
        let (len, header) = if first < 254 {
            (first as usize, 1)
        } else {
            let b = self.take(3)?;
            (b[0] as usize | (b[1] as usize) << 8 | (b[2] as usize) << 16, 4)
        };
        let payload = self.take(len)?.to_vec();
        let pad = (4 - (header + len) % 4) % 4;
        self.take(pad)?;
        Ok(payload)
    }

    fn i64_vector(&mut self) -> Result<Vec<i64>, ParseError> {
        if self.u32()? != ID_VECTOR {
            return Err(ParseError::BadVector);
        }
        let count = self.i32()?;
        if count < 0 {
            return Err(ParseError::BadVector);
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.i64()?);
        }
        Ok(out)
    }
}

// ─── Parse ───────────────────────────────────────────────────────────────────

/// Decode a decrypted message body into an [`Envelope`].
pub fn parse(body: &[u8]) -> Result<Envelope, ParseError> {
    let mut r = Reader::new(body);
    let id = r.u32()?;
    Ok(match id {
        ID_MSG_CONTAINER => {
            let count = r.i32()?;
            if count < 0 {
                return Err(ParseError::BadVector);
            }
            let mut messages = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let msg_id = r.i64()?;
                let seq_no = r.i32()?;
                let bytes = r.i32()?;
                if bytes < 0 {
                    return Err(ParseError::Truncated);
                }
                let body = r.take(bytes as usize)?.to_vec();
                messages.push(InnerMessage { msg_id, seq_no, body });
            }
            Envelope::Container(messages)
        }
        ID_RPC_RESULT => {
            let req_msg_id = r.i64()?;
            let inner = r.rest();
            let outcome = if inner.len() >= 4
                && u32::from_le_bytes(inner[..4].try_into().unwrap()) == ID_RPC_ERROR
            {
                let mut er = Reader::new(&inner[4..]);
                let code = er.i32()?;
                let message = String::from_utf8_lossy(&er.tl_bytes().map_err(|_| ParseError::BadString)?)
                    .into_owned();
                RpcOutcome::Err { code, message }
            } else {
                RpcOutcome::Ok(inner.to_vec())
            };
            Envelope::RpcResult { req_msg_id, outcome }
        }
        ID_PONG => Envelope::Pong { msg_id: r.i64()?, ping_id: r.i64()? },
        ID_MSGS_ACK => Envelope::MsgsAck { msg_ids: r.i64_vector()? },
        ID_BAD_SERVER_SALT => Envelope::BadServerSalt {
            bad_msg_id: r.i64()?,
            bad_msg_seqno: r.i32()?,
            error_code: r.i32()?,
            new_server_salt: r.i64()?,
        },
        ID_BAD_MSG_NOTIFICATION => Envelope::BadMsgNotification {
            bad_msg_id: r.i64()?,
            bad_msg_seqno: r.i32()?,
            error_code: r.i32()?,
        },
        ID_NEW_SESSION_CREATED => Envelope::NewSessionCreated {
            first_msg_id: r.i64()?,
            unique_id: r.i64()?,
            server_salt: r.i64()?,
        },
        ID_MSGS_STATE_INFO => Envelope::MsgsStateInfo {
            req_msg_id: r.i64()?,
            info: r.tl_bytes()?,
        },
        other => Envelope::Other { constructor_id: other, body: body.to_vec() },
    })
}

// ─── Serialize ───────────────────────────────────────────────────────────────

fn put_i64_vector(out: &mut Vec<u8>, values: &[i64]) {
    out.extend(ID_VECTOR.to_le_bytes());
    out.extend((values.len() as i32).to_le_bytes());
    for v in values {
        out.extend(v.to_le_bytes());
    }
}

/// TL bytes: 1-byte length (or 0xfe + 3 bytes), payload, pad to 4.
pub fn put_tl_bytes(out: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    let header = if len < 254 {
        out.push(len as u8);
        1
    } else {
        out.push(0xfe);
        out.push((len & 0xff) as u8);
        out.push(((len >> 8) & 0xff) as u8);
        out.push(((len >> 16) & 0xff) as u8);
        4
    };
    out.extend_from_slice(data);
    let pad = (4 - (header + len) % 4) % 4;
    out.extend(std::iter::repeat(0u8).take(pad));
}

fn ids_body(constructor: u32, msg_ids: &[i64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 8 + msg_ids.len() * 8);
    out.extend(constructor.to_le_bytes());
    put_i64_vector(&mut out, msg_ids);
    out
}

pub fn serialize_msgs_ack(msg_ids: &[i64]) -> Vec<u8> {
    ids_body(ID_MSGS_ACK, msg_ids)
}

pub fn serialize_msgs_state_req(msg_ids: &[i64]) -> Vec<u8> {
    ids_body(ID_MSGS_STATE_REQ, msg_ids)
}

pub fn serialize_msg_resend_req(msg_ids: &[i64]) -> Vec<u8> {
    ids_body(ID_MSG_RESEND_REQ, msg_ids)
}

pub fn serialize_http_wait(max_delay: i32, wait_after: i32, max_wait: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend(ID_HTTP_WAIT.to_le_bytes());
    out.extend(max_delay.to_le_bytes());
    out.extend(wait_after.to_le_bytes());
    out.extend(max_wait.to_le_bytes());
    out
}

pub fn serialize_ping_delay_disconnect(ping_id: i64, disconnect_delay: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend(ID_PING_DELAY_DISCONNECT.to_le_bytes());
    out.extend(ping_id.to_le_bytes());
    out.extend(disconnect_delay.to_le_bytes());
    out
}

pub fn serialize_rpc_drop_answer(req_msg_id: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend(ID_RPC_DROP_ANSWER.to_le_bytes());
    out.extend(req_msg_id.to_le_bytes());
    out
}

/// Serialize a `msg_container` from already-assigned (msg_id, seq_no, body)
/// triples.
pub fn serialize_container(messages: &[(i64, i32, Vec<u8>)]) -> Vec<u8> {
    let payload: usize = messages.iter().map(|(_, _, b)| 16 + b.len()).sum();
    let mut out = Vec::with_capacity(8 + payload);
    out.extend(ID_MSG_CONTAINER.to_le_bytes());
    out.extend((messages.len() as i32).to_le_bytes());
    for (msg_id, seq_no, body) in messages {
        out.extend(msg_id.to_le_bytes());
        out.extend(seq_no.to_le_bytes());
        out.extend((body.len() as i32).to_le_bytes());
        out.extend_from_slice(body);
    }
    out
}

/// Serialize the inner payload of `auth.bindTempAuthKey`.
pub fn serialize_bind_auth_key_inner(
    nonce: i64,
    temp_auth_key_id: i64,
    perm_auth_key_id: i64,
    temp_session_id: i64,
    expires_at: i32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(40);
    out.extend(ID_BIND_AUTH_KEY_INNER.to_le_bytes());
    out.extend(nonce.to_le_bytes());
    out.extend(temp_auth_key_id.to_le_bytes());
    out.extend(perm_auth_key_id.to_le_bytes());
    out.extend(temp_session_id.to_le_bytes());
    out.extend(expires_at.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_round_trip() {
        let wire = serialize_msgs_ack(&[4, 8, 15]);
        match parse(&wire).unwrap() {
            Envelope::MsgsAck { msg_ids } => assert_eq!(msg_ids, vec![4, 8, 15]),
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn container_round_trip() {
        let wire = serialize_container(&[
            (100, 1, vec![0xAA, 0xBB, 0xCC, 0xDD]),
            (104, 3, vec![0x11; 8]),
        ]);
        match parse(&wire).unwrap() {
            Envelope::Container(messages) => {
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[0].msg_id, 100);
                assert_eq!(messages[0].seq_no, 1);
                assert_eq!(messages[0].body, vec![0xAA, 0xBB, 0xCC, 0xDD]);
                assert_eq!(messages[1].msg_id, 104);
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn rpc_error_is_decoded() {
        let mut wire = Vec::new();
        wire.extend(ID_RPC_RESULT.to_le_bytes());
        wire.extend(42i64.to_le_bytes());
        wire.extend(ID_RPC_ERROR.to_le_bytes());
        wire.extend(420i32.to_le_bytes());
        put_tl_bytes(&mut wire, b"FLOOD_WAIT_30");
        match parse(&wire).unwrap() {
            Envelope::RpcResult { req_msg_id, outcome } => {
                assert_eq!(req_msg_id, 42);
                assert_eq!(outcome, RpcOutcome::Err { code: 420, message: "FLOOD_WAIT_30".into() });
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn unknown_constructor_is_passed_through() {
        let mut wire = Vec::new();
        wire.extend(0xdeadbeefu32.to_le_bytes());
        wire.extend([1, 2, 3, 4]);
        match parse(&wire).unwrap() {
            Envelope::Other { constructor_id, body } => {
                assert_eq!(constructor_id, 0xdeadbeef);
                assert_eq!(body.len(), 8);
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn truncated_input_errors() {
        let wire = serialize_msgs_ack(&[1, 2, 3]);
        assert_eq!(parse(&wire[..wire.len() - 4]), Err(ParseError::Truncated));
    }
}
