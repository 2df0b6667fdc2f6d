//! Bare constructors of the MTProto service schema.

use crate::deserialize::{Buffer, Error, Result};
use crate::{Blob, Deserializable, Identifiable, Serializable};

// ─── Key exchange ────────────────────────────────────────────────────────────

tl_object! {
    /// `resPQ#05162463`
    ResPq = 0x05162463 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        pq: Vec<u8>,
        server_public_key_fingerprints: Vec<i64>,
    }
}

tl_object! {
    /// `p_q_inner_data#83c95aec`, RSA-encrypted inside `req_DH_params`.
    PQInnerData = 0x83c95aec {
        pq: Vec<u8>,
        p: Vec<u8>,
        q: Vec<u8>,
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce: [u8; 32],
    }
}

tl_object! {
    ServerDhParamsFail = 0x79cb045d {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash: [u8; 16],
    }
}

tl_object! {
    ServerDhParamsOk = 0xd0e8075c {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_answer: Vec<u8>,
    }
}

tl_object! {
    ServerDhInnerData = 0xb5890dba {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        g: i32,
        dh_prime: Vec<u8>,
        g_a: Vec<u8>,
        server_time: i32,
    }
}

tl_object! {
    ClientDhInnerData = 0x6643b654 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        retry_id: i64,
        g_b: Vec<u8>,
    }
}

tl_object! {
    DhGenOk = 0x3bcbf734 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash1: [u8; 16],
    }
}

tl_object! {
    DhGenRetry = 0x46dc1fb9 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash2: [u8; 16],
    }
}

tl_object! {
    DhGenFail = 0xa69dae02 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash3: [u8; 16],
    }
}

// ─── Service messages ────────────────────────────────────────────────────────

tl_object! {
    MsgsAck = 0x62d6b459 { msg_ids: Vec<i64> }
}

tl_object! {
    BadMsgNotification = 0xa7eff811 {
        bad_msg_id: i64,
        bad_msg_seqno: i32,
        error_code: i32,
    }
}

tl_object! {
    BadServerSalt = 0xedab447b {
        bad_msg_id: i64,
        bad_msg_seqno: i32,
        error_code: i32,
        new_server_salt: i64,
    }
}

tl_object! {
    MsgsStateReq = 0xda69fb52 { msg_ids: Vec<i64> }
}

tl_object! {
    /// One state byte per queried id, in query order.
    MsgsStateInfo = 0x04deb57d { req_msg_id: i64, info: Vec<u8> }
}

tl_object! {
    MsgsAllInfo = 0x8cc0d131 { msg_ids: Vec<i64>, info: Vec<u8> }
}

tl_object! {
    MsgDetailedInfo = 0x276d3ec6 {
        msg_id: i64,
        answer_msg_id: i64,
        bytes: i32,
        status: i32,
    }
}

tl_object! {
    MsgNewDetailedInfo = 0x809db6df {
        answer_msg_id: i64,
        bytes: i32,
        status: i32,
    }
}

tl_object! {
    MsgResendReq = 0x7d861a08 { msg_ids: Vec<i64> }
}

tl_object! {
    /// `rpc_result#f35c6d01`. The result stays serialized; its type is only
    /// known to whoever sent `req_msg_id`.
    RpcResult = 0xf35c6d01 { req_msg_id: i64, result: Blob }
}

tl_object! {
    RpcError = 0x2144ca19 { error_code: i32, error_message: String }
}

tl_object! {
    Pong = 0x347773c5 { msg_id: i64, ping_id: i64 }
}

tl_object! {
    NewSessionCreated = 0x9ec20908 {
        first_msg_id: i64,
        unique_id: i64,
        server_salt: i64,
    }
}

tl_object! {
    GzipPacked = 0x3072cfa1 { packed_data: Vec<u8> }
}

// ─── Container ───────────────────────────────────────────────────────────────

/// A message inside a `msg_container`.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainedMessage {
    pub msg_id: i64,
    pub seqno: i32,
    pub body: Vec<u8>,
}

/// `msg_container#73f1f8dc messages:vector<%Message>`.
///
/// `%Message` carries its body length as a plain `int`, so the body is not
/// a TL `bytes` value and the layout is written out by hand here.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MsgContainer {
    pub messages: Vec<ContainedMessage>,
}

impl MsgContainer {
    /// Bytes taken by the container header plus one message header.
    pub const HEADER_LEN: usize = 8;
    pub const MESSAGE_HEADER_LEN: usize = 16;
}

impl Identifiable for MsgContainer {
    const CONSTRUCTOR_ID: u32 = 0x73f1f8dc;
}

impl Serializable for MsgContainer {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        (self.messages.len() as i32).serialize(buf);
        for m in &self.messages {
            m.msg_id.serialize(buf);
            m.seqno.serialize(buf);
            (m.body.len() as i32).serialize(buf);
            buf.extend(m.body.iter().copied());
        }
    }
}

impl Deserializable for MsgContainer {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let count = i32::deserialize(buf)?;
        if count < 0 || count as usize > buf.remaining() / Self::MESSAGE_HEADER_LEN {
            return Err(Error::InvalidLength { len: count as usize });
        }
        let mut messages = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let msg_id = i64::deserialize(buf)?;
            let seqno = i32::deserialize(buf)?;
            let len = i32::deserialize(buf)?;
            if len < 0 {
                return Err(Error::InvalidLength { len: len as usize });
            }
            let body = buf.read_slice(len as usize)?.to_vec();
            messages.push(ContainedMessage { msg_id, seqno, body });
        }
        Ok(Self { messages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_layout() {
        let c = MsgContainer {
            messages: vec![ContainedMessage { msg_id: 4, seqno: 1, body: vec![1, 2, 3, 4] }],
        };
        let bytes = c.to_bytes();
        assert_eq!(bytes.len(), MsgContainer::HEADER_LEN + MsgContainer::MESSAGE_HEADER_LEN + 4);
        assert_eq!(&bytes[..4], &0x73f1f8dcu32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1i32.to_le_bytes());
        assert_eq!(&bytes[20..24], &4i32.to_le_bytes());
        // bare: the caller consumes the constructor id
        assert_eq!(MsgContainer::from_bytes(&bytes[4..]).unwrap(), c);
    }

    #[test]
    fn container_rejects_overlong_body() {
        let mut bytes = Vec::new();
        1i32.serialize(&mut bytes);
        8i64.serialize(&mut bytes);
        1i32.serialize(&mut bytes);
        100i32.serialize(&mut bytes);
        bytes.extend([0u8; 8]);
        assert_eq!(MsgContainer::from_bytes(&bytes), Err(Error::UnexpectedEof));
    }

    #[test]
    fn rpc_result_keeps_payload_opaque() {
        let mut bytes = Vec::new();
        16i64.serialize(&mut bytes);
        bytes.extend([9u8; 12]);
        let r = RpcResult::from_bytes(&bytes).unwrap();
        assert_eq!(r.req_msg_id, 16);
        assert_eq!(r.result.0, vec![9u8; 12]);
    }
}
