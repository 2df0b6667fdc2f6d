//! Error taxonomy of the session engine.

use std::fmt;

use tdmtp_crypto::CryptoError;
use tdmtp_tl_types::deserialize;

// ─── Violation ───────────────────────────────────────────────────────────────

/// Why an incoming frame could not be trusted.
///
/// Every violation is fatal to the connection: the session's crypto state
/// is no longer known to be in sync, so the connection restarts.
#[derive(Clone, Debug, PartialEq)]
pub enum Violation {
    /// Frame shorter than the smallest possible encrypted message.
    ShortFrame { len: usize },
    /// There is no auth key, or it changed while the connection was using it.
    KeyChanged,
    /// Declared message length is not 4-aligned or exceeds the frame.
    BadLength { len: u32 },
    /// `msg_key` does not match the decrypted plaintext.
    MsgKeyMismatch,
    /// The frame belongs to another session.
    SessionMismatch { got: i64, expected: i64 },
    /// Server message ids must be odd (`msg_id & 3` of 1 or 3).
    BadMsgIdParity { msg_id: i64 },
    /// A contained message has a bad header.
    BadContainer,
    /// `gzip_packed` payload did not inflate to whole words.
    BadGzip,
    /// A service message could not be parsed.
    Undecodable(deserialize::Error),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortFrame { len } => write!(f, "frame of {len} bytes is too short"),
            Self::KeyChanged => write!(f, "auth key changed"),
            Self::BadLength { len } => write!(f, "bad msg_len {len}"),
            Self::MsgKeyMismatch => write!(f, "msg_key mismatch after decryption"),
            Self::SessionMismatch { got, expected } => {
                write!(f, "session {got} received, expected {expected}")
            }
            Self::BadMsgIdParity { msg_id } => write!(f, "bad server msg_id {msg_id}"),
            Self::BadContainer => write!(f, "bad contained message"),
            Self::BadGzip => write!(f, "bad gzip_packed payload"),
            Self::Undecodable(e) => write!(f, "undecodable message: {e}"),
        }
    }
}

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors surfaced by the engine and by failed requests.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A primitive rejected its input.
    Crypto(CryptoError),
    /// An incoming frame failed an integrity check.
    ProtocolViolation(Violation),
    /// `bad_msg_notification` with a code that cannot be fixed by resending.
    ServerRejection { code: i32 },
    /// The byte stream below failed.
    Transport(String),
    /// The request was evicted or expired without an answer.
    Timeout,
}

impl Error {
    /// Violations and crypto failures leave the session in an unknown state.
    pub fn restarts_connection(&self) -> bool {
        matches!(self, Self::Crypto(_) | Self::ProtocolViolation(_) | Self::Transport(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crypto(e) => write!(f, "crypto: {e}"),
            Self::ProtocolViolation(v) => write!(f, "protocol violation: {v}"),
            Self::ServerRejection { code } => write!(f, "message rejected by server, code {code}"),
            Self::Transport(why) => write!(f, "transport: {why}"),
            Self::Timeout => write!(f, "request timed out"),
        }
    }
}

impl std::error::Error for Error {}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AuthKeyMismatch => Self::ProtocolViolation(Violation::KeyChanged),
            other => Self::Crypto(other),
        }
    }
}

impl From<Violation> for Error {
    fn from(v: Violation) -> Self { Self::ProtocolViolation(v) }
}

impl From<deserialize::Error> for Error {
    fn from(e: deserialize::Error) -> Self { Self::ProtocolViolation(Violation::Undecodable(e)) }
}
