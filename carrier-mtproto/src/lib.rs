//! MTProto envelope protocol, free of I/O.
//!
//! This crate holds everything about the protocol that can be expressed as
//! pure state and bytes:
//! * the connection-state machine and login state
//! * the authorization-key session (permanent + temporary keys, PFS binding)
//! * envelope constructors as a closed enum, with their wire codec
//! * plaintext and encrypted frame assembly
//! * message-id and sequence-number generation
//! * the serializer collaborator boundary (the TL method catalogue lives
//!   outside this workspace)
//!
//! Sockets, loops and pools live in `carrier-client`.

#![deny(unsafe_code)]

pub mod auth_key;
pub mod envelope;
pub mod frame;
pub mod msg_id;
pub mod serializer;
pub mod state;

pub use auth_key::AuthKeySession;
pub use frame::DecryptedMessage;
pub use msg_id::{MsgIdGen, SeqNoGen};
pub use serializer::{ArgValue, Args, SerializeError, Serializer};
pub use state::{ConnectionState, DcId, LoginState, Phase};
