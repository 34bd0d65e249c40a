//! # VaultLink Protocol Library
//!
//! Wire protocol shared by the VaultLink native-messaging proxy and the
//! credential store's browser-bridge server.
//!
//! ## Overview
//!
//! This crate is the foundation of the bridge's communication layer,
//! providing:
//!
//! - **Message Definitions**: JSON envelopes, the action set, and the stable
//!   error-code taxonomy shared with the browser extension
//! - **Cryptographic Session**: key pairs, the unencrypted key exchange, and
//!   per-message NaCl box encryption with deterministic nonce increments
//! - **Frame Codec**: the 4-byte length-prefixed native-messaging framing
//!   read from the browser's stdio pipe
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        JSON Envelope (messages)         │  action / nonce / requestID
//! ├─────────────────────────────────────────┤
//! │        NaCl Box (crypto)                │  X25519 + XSalsa20-Poly1305
//! ├─────────────────────────────────────────┤
//! │        Native-Messaging Framing         │  4-byte length prefix
//! ├─────────────────────────────────────────┤
//! │   Transport (stdio pipe / Unix socket)  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: key pairs, sessions, nonce arithmetic
//! - [`messages`]: envelope and response definitions, error codes
//! - [`framing`]: host-channel frame codec
//! - [`error`]: error types

pub mod crypto;
pub mod error;
pub mod framing;
pub mod messages;

pub use crypto::{KeyPair, Nonce, Session, KEY_LENGTH, NONCE_LENGTH};
pub use error::{ProtocolError, Result};
pub use framing::{read_frame, write_frame, FRAME_PREFIX_SIZE, MAX_FRAME_SIZE};
pub use messages::{
    build_error_response, build_response, error_reply, reconnected_notification, Action, Envelope,
    ErrorCode, Parameters, BRIDGE_VERSION, MAX_URL_LENGTH, PROTOCOL_VERSION,
};
