//! # tdmtp: MTProto v1 handshake, session and transport core
//!
//! The stack is split into focused sub-crates, wired together here:
//!
//! | Sub-crate        | Role                                                        |
//! |------------------|-------------------------------------------------------------|
//! | `tdmtp-tl-types` | TL serialization and the service schema                     |
//! | `tdmtp-crypto`   | AES-IGE, RSA, SHA, DH checks, auth key                      |
//! | `tdmtp-mtproto`  | Sans-IO handshake, session bookkeeping, engine, framing     |
//! | `tdmtp-client`   | tokio transports, reconnecting worker, `Client` (`client`)  |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! # async fn f() -> Result<(), tdmtp::InvocationError> {
//! use tdmtp::tl::functions::Ping;
//!
//! let client = tdmtp::Client::connect(tdmtp::Config { api_id: 12345, ..Default::default() }).await?;
//! let pong = client.invoke(&Ping { ping_id: 1 }).await?;
//! # Ok(()) }
//! ```
//!
//! ## Sans-IO use
//!
//! Without the `client` feature, drive [`authentication::Handshake`] and
//! [`Engine`] yourself: hand them frames and the current time, send
//! whatever they return.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Re-export of [`tdmtp_tl_types`]: service constructors, functions and enums.
pub use tdmtp_tl_types as tl;

/// Re-export of [`tdmtp_mtproto`]: handshake, session data, engine and framing.
pub use tdmtp_mtproto as mtproto;

/// Re-export of [`tdmtp_crypto`]: AES-IGE, SHA, RSA, factorize, AuthKey.
pub use tdmtp_crypto as crypto;

/// Re-export of [`tdmtp_client`] (requires `feature = "client"`).
#[cfg(feature = "client")]
pub use tdmtp_client as client;

// ─── Convenience re-exports ───────────────────────────────────────────────────

pub use tdmtp_tl_types::{Deserializable, Identifiable, RemoteCall, Serializable, LAYER};

pub use tdmtp_mtproto::authentication::{self, Finished, Handshake, HandshakeContext};
pub use tdmtp_mtproto::{Engine, EngineConfig, FrameCodec, Framing, SessionData};
pub use tdmtp_crypto::AuthKey;

#[cfg(feature = "client")]
pub use tdmtp_client::{Client, Config, ConnectionState, InvocationError, RpcError, Session, TransportKind};
