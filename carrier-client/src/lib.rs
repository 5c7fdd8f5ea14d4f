//! Async MTProto transport client.
//!
//! Everything between "bytes of a serialized method call" and "bytes of
//! its reply": per-datacenter connection pools, the temp-key binding
//! handshake, reliable delivery (batching, acks, resends) and session
//! continuity across reconnects. TL (de)serialization and the DH key
//! exchange are collaborators plugged in through [`Serializer`] and
//! [`KeyExchange`].

#![deny(unsafe_code)]

pub mod arena;
pub mod call;
pub mod clock;
pub mod connection;
pub mod dc_conn;
pub mod errors;
pub mod message;
pub mod ping_loop;
pub mod publisher;
pub mod session;
pub mod transport;
pub mod write_loop;

pub use call::CallQueues;
pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::Connection;
pub use dc_conn::{
    ConnectionPool, Connector, DataCenterConnection, KeyExchange, TcpConnector, TempKey,
};
pub use errors::{HandshakeError, InvocationError, RpcError};
pub use message::OutgoingMessage;
pub use publisher::Publisher;
pub use session::Session;
pub use transport::{Abridged, Intermediate, Wire};

pub use carrier_mtproto::{
    ArgValue, Args, ConnectionState, DcId, LoginState, Phase, Serializer,
};

/// Connection metadata written to the server right after binding.
#[derive(Clone, Debug)]
pub struct InitInfo {
    pub api_id: i32,
    pub device_model: String,
    pub system_version: String,
    pub app_version: String,
    pub lang_code: String,
}

impl Default for InitInfo {
    fn default() -> Self {
        Self {
            api_id: 0,
            device_model: std::env::consts::OS.to_string(),
            system_version: std::env::consts::ARCH.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            lang_code: "en".to_string(),
        }
    }
}

/// Tunables for connection and delivery behavior.
#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    /// Seconds before an unacked sent message is queried via
    /// `msgs_state_req`.
    pub resend_timeout_secs: i64,
    /// Seconds between keepalive pings.
    pub ping_interval_secs: u64,
    /// Server-side disconnect delay carried by the ping; also how long we
    /// wait for a pong before declaring the socket dead.
    pub ping_disconnect_delay_secs: u64,
    /// Binding handshake attempts before giving up on the permanent key.
    pub bind_retries: u32,
    /// Lifetime requested for temporary keys.
    pub temp_key_expires_secs: i64,
    /// Socket cap per datacenter pool.
    pub max_connections_per_dc: usize,
    pub init: InitInfo,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            resend_timeout_secs: 60,
            ping_interval_secs: 15,
            ping_disconnect_delay_secs: 75,
            bind_retries: 5,
            temp_key_expires_secs: 86_400,
            max_connections_per_dc: 8,
            init: InitInfo::default(),
        }
    }
}
