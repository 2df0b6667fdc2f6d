//! Protocol timing and sizing constants.
//!
//! Times are milliseconds unless the name says otherwise.

/// Capacity of the received-ids ring and of the were-acked table.
pub const IDS_BUFFER_SIZE: usize = 400;

/// A sent request unanswered for this long is resent or has its state queried.
pub const CHECK_RESEND_TIMEOUT: u64 = 10_000;

/// How long the resend timer may wait to batch the resends it triggers.
pub const CHECK_RESEND_WAITING: u64 = 1_000;

/// How long pending acks may wait before being flushed.
pub const ACK_SEND_WAITING: u64 = 10_000;

/// Requests at least this big (bytes) get a `msgs_state_req` instead of a blind resend.
pub const RESEND_THRESHOLD: usize = 1_024;

/// Containers are dropped from have-sent after this many seconds.
pub const CONTAINER_LIVES_SECS: i64 = 600;

pub const MIN_RECEIVE_DELAY: u64 = 4_000;
pub const MAX_RECEIVE_DELAY: u64 = 64_000;

pub const MIN_CONNECT_DELAY: u64 = 1_000;
pub const MAX_CONNECT_DELAY: u64 = 8_000;

/// A connection silent for this long is marked old.
pub const CONNECTION_OLD_TIMEOUT: u64 = 192_000;

/// Grace window for IPv4 after IPv6 connected first.
pub const IPV4_CONNECTION_WAIT_TIMEOUT: u64 = 1_000;

/// `disconnect_delay` passed with `ping_delay_disconnect` (seconds).
pub const PING_DELAY_DISCONNECT_SECS: i32 = 60;

/// Keepalive interval on the main session (seconds).
pub const PING_SEND_AFTER_SECS: u64 = 30;

/// Minimum spacing between automatic pings (seconds).
pub const PING_SEND_AFTER_AUTO_SECS: u64 = 1;

/// `http_wait` parameters: `max_delay`, `wait_after`, `max_wait`.
pub const HTTP_WAIT: (i32, i32, i32) = (100, 30, 25_000);

/// Upper bound of the reconnect timer.
pub const MAX_RETRY_TIMEOUT: u64 = 64_000;

/// Attempts allowed for `set_client_DH_params` before the handshake gives up.
pub const MAX_DH_ATTEMPTS: u32 = 5;

/// Server time may run ahead of ours by this much before it is distrusted.
pub const BAD_TIME_AHEAD_SECS: i64 = 60;

/// Server time may lag ours by this much before it is distrusted.
pub const BAD_TIME_BEHIND_SECS: i64 = 300;

/// Most messages packed into one outgoing container.
pub const MAX_CONTAINER_MESSAGES: usize = 1_020;
