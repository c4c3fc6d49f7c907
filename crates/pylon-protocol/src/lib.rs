//! # pylon-protocol
//!
//! Wire protocol definitions for the Pylon message gateway.
//!
//! Clients exchange discriminated request/response envelopes over a
//! persistent connection. Every inbound [`Envelope`] carries an integer
//! message type and a client-chosen request id; every [`Reply`] derived
//! from it echoes both back unchanged.
//!
//! ## Example
//!
//! ```rust
//! use pylon_protocol::{codec, Envelope, Reply};
//!
//! let envelope = Envelope::new(7, "req-1", serde_json::json!({"name": "Ada"}));
//! let reply = Reply::ok(&envelope, serde_json::json!({"greeting": "hello"}));
//!
//! let encoded = codec::encode(&reply).unwrap();
//! let decoded: Reply = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.request_id, "req-1");
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{Envelope, Reply, StatusCode, POLICY_VIOLATION};
