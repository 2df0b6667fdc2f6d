//! Framing of MTProto packets on a byte stream.
//!
//! The codecs are sans-IO: [`FrameCodec::encode`] appends a framed packet to
//! an output buffer and [`FrameCodec::decode`] pulls complete packets out of
//! whatever bytes have arrived so far. Three framings are supported:
//!
//! * **Abridged**: init byte `0xef`, then `[len/4 as 1 or 4 bytes][payload]`.
//! * **Intermediate**: init `0xeeeeeeee`, then `[4-byte LE length][payload]`.
//! * **Full**: no init; `[len][seq_no][payload][crc32]`, where `len` counts
//!   the whole packet and the CRC covers everything before it.
//!
//! A 4-byte packet carrying a negative number is the server reporting a
//! transport-level error (`-404` for an unknown auth key, `-429` for flood).

use std::fmt;

/// Largest packet accepted from the server.
pub const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

/// Which framing a connection speaks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Framing {
    #[default]
    Abridged,
    Intermediate,
    Full,
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// A byte stream that cannot be framed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Negative error code sent in place of a packet.
    Server { code: i32 },
    /// Declared length is impossible or above [`MAX_PACKET_LEN`].
    BadLength { len: usize },
    /// Full framing: checksum does not match.
    Crc { got: u32, expected: u32 },
    /// Full framing: packets arrived out of order.
    Sequence { got: u32, expected: u32 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server { code } => write!(f, "server transport error {code}"),
            Self::BadLength { len } => write!(f, "bad packet length {len}"),
            Self::Crc { got, expected } => {
                write!(f, "CRC mismatch (got {got:#010x}, expected {expected:#010x})")
            }
            Self::Sequence { got, expected } => write!(f, "packet seq_no {got}, expected {expected}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<FrameError> for crate::Error {
    fn from(e: FrameError) -> Self { Self::Transport(e.to_string()) }
}

// ─── Codec ───────────────────────────────────────────────────────────────────

/// Stateful framing for one connection.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    framing: Framing,
    init_sent: bool,
    send_seq: u32,
    recv_seq: u32,
}

impl FrameCodec {
    pub fn new(framing: Framing) -> Self {
        Self { framing, init_sent: false, send_seq: 0, recv_seq: 0 }
    }

    pub fn framing(&self) -> Framing { self.framing }

    /// Append `payload` as one packet to `out`. The first packet is preceded
    /// by the framing's init bytes.
    pub fn encode(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        if !self.init_sent {
            match self.framing {
                Framing::Abridged => out.push(0xef),
                Framing::Intermediate => out.extend_from_slice(&[0xee; 4]),
                Framing::Full => {}
            }
            self.init_sent = true;
        }
        match self.framing {
            Framing::Abridged => {
                let words = payload.len() / 4;
                if words < 0x7f {
                    out.push(words as u8);
                } else {
                    out.push(0x7f);
                    out.extend_from_slice(&(words as u32).to_le_bytes()[..3]);
                }
            }
            Framing::Intermediate => out.extend_from_slice(&(payload.len() as u32).to_le_bytes()),
            Framing::Full => {
                let start = out.len();
                out.extend_from_slice(&((payload.len() + 12) as u32).to_le_bytes());
                out.extend_from_slice(&self.send_seq.to_le_bytes());
                out.extend_from_slice(payload);
                let crc = crc32_ieee(&out[start..]);
                out.extend_from_slice(&crc.to_le_bytes());
                self.send_seq = self.send_seq.wrapping_add(1);
                return;
            }
        }
        out.extend_from_slice(payload);
    }

    /// Take one packet off the front of `buf`.
    ///
    /// Returns the number of bytes consumed with the payload, or `None` if
    /// `buf` does not yet hold a whole packet.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(usize, Vec<u8>)>, FrameError> {
        let (header, len) = match self.framing {
            Framing::Abridged => {
                let Some(&first) = buf.first() else { return Ok(None) };
                if first < 0x7f {
                    (1, first as usize * 4)
                } else if buf.len() < 4 {
                    return Ok(None);
                } else {
                    (4, u32::from_le_bytes([buf[1], buf[2], buf[3], 0]) as usize * 4)
                }
            }
            Framing::Intermediate => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (4, u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize)
            }
            Framing::Full => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let total = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                if total < 12 || total > MAX_PACKET_LEN {
                    return Err(FrameError::BadLength { len: total });
                }
                if buf.len() < total {
                    return Ok(None);
                }
                let (body, crc) = buf[..total].split_at(total - 4);
                let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
                let got = crc32_ieee(body);
                if got != expected {
                    return Err(FrameError::Crc { got, expected });
                }
                let seq = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
                if seq != self.recv_seq {
                    return Err(FrameError::Sequence { got: seq, expected: self.recv_seq });
                }
                self.recv_seq = self.recv_seq.wrapping_add(1);
                let payload = body[8..].to_vec();
                check_server_error(&payload)?;
                return Ok(Some((total, payload)));
            }
        };
        if len > MAX_PACKET_LEN {
            return Err(FrameError::BadLength { len });
        }
        if buf.len() < header + len {
            return Ok(None);
        }
        let payload = buf[header..header + len].to_vec();
        check_server_error(&payload)?;
        Ok(Some((header + len, payload)))
    }
}

fn check_server_error(payload: &[u8]) -> Result<(), FrameError> {
    if let &[a, b, c, d] = payload {
        let code = i32::from_le_bytes([a, b, c, d]);
        if code < 0 {
            return Err(FrameError::Server { code });
        }
    }
    Ok(())
}

// ─── CRC-32 (IEEE 802.3 polynomial) ──────────────────────────────────────────

/// Compute CRC-32 using the standard IEEE 802.3 polynomial.
pub fn crc32_ieee(data: &[u8]) -> u32 {
    const POLY: u32 = 0xedb88320;
    let mut crc: u32 = 0xffffffff;
    for &byte in data {
        let mut b = byte as u32;
        for _ in 0..8 {
            let mix = (crc ^ b) & 1;
            crc >>= 1;
            if mix != 0 { crc ^= POLY; }
            b >>= 1;
        }
    }
    crc ^ 0xffffffff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut FrameCodec, mut buf: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some((used, payload)) = codec.decode(buf).unwrap() {
            out.push(payload);
            buf = &buf[used..];
        }
        assert!(buf.is_empty());
        out
    }

    #[test]
    fn crc_check_value() {
        assert_eq!(crc32_ieee(b"123456789"), 0xcbf43926);
    }

    #[test]
    fn abridged_long_header() {
        let mut tx = FrameCodec::new(Framing::Abridged);
        let mut wire = Vec::new();
        tx.encode(&[1; 8], &mut wire);
        tx.encode(&[2; 4 * 0x80], &mut wire);
        assert_eq!(&wire[..2], &[0xef, 2]);
        assert_eq!(&wire[10..14], &[0x7f, 0x80, 0, 0]);

        let mut rx = FrameCodec::new(Framing::Abridged);
        let packets = decode_all(&mut rx, &wire[1..]);
        assert_eq!(packets, vec![vec![1; 8], vec![2; 4 * 0x80]]);
    }

    #[test]
    fn intermediate_waits_for_whole_packet() {
        let mut tx = FrameCodec::new(Framing::Intermediate);
        let mut wire = Vec::new();
        tx.encode(&[9; 12], &mut wire);
        assert_eq!(&wire[..4], &[0xee; 4]);
        let mut rx = FrameCodec::new(Framing::Intermediate);
        assert_eq!(rx.decode(&wire[4..10]), Ok(None));
        assert_eq!(rx.decode(&wire[4..]), Ok(Some((16, vec![9; 12]))));
    }

    #[test]
    fn full_checks_crc_and_order() {
        let mut tx = FrameCodec::new(Framing::Full);
        let mut wire = Vec::new();
        tx.encode(&[5; 16], &mut wire);
        tx.encode(&[6; 16], &mut wire);
        assert_eq!(wire.len(), 2 * 28);

        let mut rx = FrameCodec::new(Framing::Full);
        assert_eq!(decode_all(&mut rx, &wire), vec![vec![5; 16], vec![6; 16]]);

        let mut rx = FrameCodec::new(Framing::Full);
        assert_eq!(rx.decode(&wire[28..]), Err(FrameError::Sequence { got: 1, expected: 0 }));

        wire[10] ^= 1;
        let mut rx = FrameCodec::new(Framing::Full);
        assert!(matches!(rx.decode(&wire), Err(FrameError::Crc { .. })));
    }

    #[test]
    fn negative_packet_is_server_error() {
        let mut rx = FrameCodec::new(Framing::Intermediate);
        let mut wire = 4u32.to_le_bytes().to_vec();
        wire.extend((-404i32).to_le_bytes());
        assert_eq!(rx.decode(&wire), Err(FrameError::Server { code: -404 }));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut rx = FrameCodec::new(Framing::Intermediate);
        assert_eq!(
            rx.decode(&u32::MAX.to_le_bytes()),
            Err(FrameError::BadLength { len: u32::MAX as usize })
        );
    }
}
