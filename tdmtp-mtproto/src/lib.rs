//! Sans-IO MTProto v1 core.
//!
//! This crate handles:
//! * The DH key exchange ([`authentication`])
//! * Message ids, sequence numbers and the plaintext envelope ([`message`])
//! * Per-session bookkeeping shared by connections ([`SessionData`])
//! * Building outgoing frames and dispatching incoming ones ([`Engine`])
//! * Packet framing on a byte stream ([`transport`])
//!
//! Nothing here performs I/O or reads the clock: callers pass the current
//! time in Unix milliseconds and move the bytes themselves.

#![deny(unsafe_code)]

pub mod authentication;
pub mod constants;
pub mod engine;
pub mod error;
pub mod message;
pub mod request;
pub mod session_data;
pub mod transport;

pub use engine::{Engine, EngineConfig, Outcome, Outgoing, PingCheck};
pub use error::{Error, Violation};
pub use message::{Message, MsgIdGen, SeqNo};
pub use request::{Request, RequestId, RequestKind};
pub use session_data::{Received, ReceivedIds, SessionData, Sent};
pub use transport::{FrameCodec, FrameError, Framing};
