//! Message ids, sequence numbers and the plaintext envelope.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Violation;

/// Milliseconds since the Unix epoch.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Server time carried in the upper half of a msg id.
pub fn msg_id_time(msg_id: i64) -> i64 { msg_id >> 32 }

/// Generator of outgoing message ids.
///
/// An id is `unixtime << 32` plus the fraction of the current second scaled
/// to 32 bits, with the low two bits cleared. Ids never repeat or decrease:
/// if the clock stutters the previous id is bumped by 4.
#[derive(Clone, Copy, Debug, Default)]
pub struct MsgIdGen {
    last: i64,
}

impl MsgIdGen {
    pub fn new() -> Self { Self::default() }

    /// Next id for local time `unix_ms` corrected by `time_offset` seconds.
    pub fn next(&mut self, unix_ms: u64, time_offset: i32) -> i64 {
        let ms = (unix_ms as i64).saturating_add(i64::from(time_offset) * 1000).max(0);
        let secs = ms / 1000;
        let frac = ((ms % 1000) << 32) / 1000;
        let mut id = ((secs << 32) | frac) & !3;
        if id <= self.last {
            id = self.last + 4;
        }
        self.last = id;
        id
    }

    pub fn last(&self) -> i64 { self.last }
}

/// Session-scoped `seq_no` counter.
///
/// Content messages get `2n + 1` and advance `n`; everything else gets `2n`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SeqNo {
    sent: i32,
}

impl SeqNo {
    pub fn next(&mut self, content: bool) -> i32 {
        let n = self.sent * 2 + i32::from(content);
        if content {
            self.sent += 1;
        }
        n
    }
}

/// An unencrypted message, only used during the key exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: i64,
    /// The serialized TL body (constructor ID + fields).
    pub body: Vec<u8>,
}

impl Message {
    pub fn plaintext(id: i64, body: Vec<u8>) -> Self {
        Self { id, body }
    }

    /// Serialize the message into the plaintext wire format:
    ///
    /// ```text
    /// auth_key_id:long  (0 for plaintext)
    /// message_id:long
    /// message_data_length:int
    /// message_data:bytes
    /// ```
    pub fn to_plaintext_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 8 + 4 + self.body.len());
        buf.extend(0i64.to_le_bytes());
        buf.extend(self.id.to_le_bytes());
        buf.extend((self.body.len() as u32).to_le_bytes());
        buf.extend(&self.body);
        buf
    }

    /// Parse a plaintext answer from the server.
    ///
    /// The key id must be zero, the msg id must be a server reply
    /// (`msg_id & 3 == 1`) and the length must cover the rest of the frame.
    pub fn from_plaintext_bytes(frame: &[u8]) -> Result<Self, Violation> {
        if frame.len() < 20 {
            return Err(Violation::ShortFrame { len: frame.len() });
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&frame[..8]);
        if u64::from_le_bytes(word) != 0 {
            return Err(Violation::KeyChanged);
        }
        word.copy_from_slice(&frame[8..16]);
        let id = i64::from_le_bytes(word);
        if id & 3 != 1 {
            return Err(Violation::BadMsgIdParity { msg_id: id });
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&frame[16..20]);
        let len = u32::from_le_bytes(len);
        if len as usize != frame.len() - 20 {
            return Err(Violation::BadLength { len });
        }
        Ok(Self { id, body: frame[20..].to_vec() })
    }
}
