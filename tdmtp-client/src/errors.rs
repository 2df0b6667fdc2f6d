//! Error types for tdmtp-client.

use std::{fmt, io};

use tdmtp_mtproto::authentication;

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server in answer to a call (`rpc_error`).
///
/// Numeric values are stripped from the name and placed in [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with the numeric suffix removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw error message like `"FLOOD_WAIT_30"`.
    pub fn from_telegram(code: i32, message: &str) -> Self {
        if let Some((name, suffix)) = message.rsplit_once('_') {
            if !suffix.is_empty() && suffix.bytes().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    return Self { code, name: name.to_string(), value: Some(v) };
                }
            }
        }
        Self { code, name: message.to_string(), value: None }
    }

    /// Match on the error name, with an optional `'*'` wildcard prefix or suffix.
    ///
    /// # Examples
    /// - `err.is("FLOOD_WAIT")` exact match
    /// - `err.is("AUTH_KEY_*")` starts-with match
    /// - `err.is("*_MIGRATE")` ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// Seconds to wait, if this is a `FLOOD_WAIT_N` error.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        if self.code == 420 && self.name == "FLOOD_WAIT" {
            self.value.map(u64::from)
        } else {
            None
        }
    }

    /// Data center to move to, for `PHONE_MIGRATE_N`, `USER_MIGRATE_N`, ...
    pub fn migrate_dc(&self) -> Option<i32> {
        if self.code == 303 && self.is("*_MIGRATE") {
            self.value.and_then(|v| i32::try_from(v).ok())
        } else {
            None
        }
    }

    /// The server lost our `initConnection`; the call must be wrapped again.
    pub fn needs_layer(&self) -> bool {
        self.is("CONNECTION_NOT_INITED") || self.is("CONNECTION_LAYER_INVALID")
    }

    /// Internal server trouble, worth retrying after a pause.
    pub fn is_server_side(&self) -> bool { self.code < 0 || self.code >= 500 }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned by [`crate::Session::submit`] and [`crate::Client::invoke`].
#[derive(Debug)]
pub enum InvocationError {
    /// The server answered the call with an error.
    Rpc(RpcError),
    /// No answer arrived and the request was given up on.
    Timeout,
    /// The connection failed in a way that could not be recovered for this call.
    Transport(String),
    /// `bad_msg_notification` with a code resending cannot fix.
    Rejected { code: i32 },
    /// Local I/O failure (key store, sockets).
    Io(io::Error),
    /// Response deserialization failed.
    Deserialize(String),
    /// The session shut down before the call completed.
    Dropped,
    /// The account lives on another data center.
    Migrate(i32),
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e)            => write!(f, "{e}"),
            Self::Timeout           => write!(f, "request timed out"),
            Self::Transport(s)      => write!(f, "transport error: {s}"),
            Self::Rejected { code } => write!(f, "request rejected by the server (code {code})"),
            Self::Io(e)             => write!(f, "I/O error: {e}"),
            Self::Deserialize(s)    => write!(f, "deserialize error: {s}"),
            Self::Dropped           => write!(f, "request dropped"),
            Self::Migrate(dc)       => write!(f, "DC migration to {dc}"),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<io::Error> for InvocationError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<tdmtp_tl_types::deserialize::Error> for InvocationError {
    fn from(e: tdmtp_tl_types::deserialize::Error) -> Self { Self::Deserialize(e.to_string()) }
}

impl From<tdmtp_mtproto::Error> for InvocationError {
    fn from(e: tdmtp_mtproto::Error) -> Self {
        match e {
            tdmtp_mtproto::Error::Timeout                   => Self::Timeout,
            tdmtp_mtproto::Error::ServerRejection { code }  => Self::Rejected { code },
            tdmtp_mtproto::Error::Transport(s)              => Self::Transport(s),
            other                                           => Self::Transport(other.to_string()),
        }
    }
}

impl From<tdmtp_mtproto::FrameError> for InvocationError {
    fn from(e: tdmtp_mtproto::FrameError) -> Self { Self::Transport(e.to_string()) }
}

impl From<authentication::Error> for InvocationError {
    fn from(e: authentication::Error) -> Self { Self::Transport(format!("key exchange failed: {e}")) }
}

impl From<RpcError> for InvocationError {
    fn from(e: RpcError) -> Self {
        match e.migrate_dc() {
            Some(dc) => Self::Migrate(dc),
            None     => Self::Rpc(e),
        }
    }
}

impl InvocationError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _            => false,
        }
    }

    /// If this is a `FLOOD_WAIT` error, returns how many seconds to wait.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        match self {
            Self::Rpc(e) => e.flood_wait_seconds(),
            _            => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_suffix_is_split_off() {
        let e = RpcError::from_telegram(420, "FLOOD_WAIT_30");
        assert_eq!(e, RpcError { code: 420, name: "FLOOD_WAIT".into(), value: Some(30) });
        assert_eq!(e.flood_wait_seconds(), Some(30));

        let e = RpcError::from_telegram(400, "PEER_ID_INVALID");
        assert_eq!(e.value, None);
        assert!(e.is("*_INVALID"));
        assert!(e.is("PEER_*"));
        assert_eq!(e.flood_wait_seconds(), None);
    }

    #[test]
    fn migrate_errors_become_migrations() {
        let e = InvocationError::from(RpcError::from_telegram(303, "PHONE_MIGRATE_4"));
        assert!(matches!(e, InvocationError::Migrate(4)));
        let e = InvocationError::from(RpcError::from_telegram(400, "PHONE_MIGRATE_4"));
        assert!(matches!(e, InvocationError::Rpc(_)));
    }

    #[test]
    fn engine_errors_map_onto_invocation_errors() {
        assert!(matches!(InvocationError::from(tdmtp_mtproto::Error::Timeout), InvocationError::Timeout));
        assert!(matches!(
            InvocationError::from(tdmtp_mtproto::Error::ServerRejection { code: 35 }),
            InvocationError::Rejected { code: 35 }
        ));
        assert!(RpcError::from_telegram(400, "CONNECTION_NOT_INITED").needs_layer());
        assert!(RpcError::from_telegram(-503, "Timeout").is_server_side());
    }
}
