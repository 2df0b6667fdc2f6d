//! Outgoing requests as kept in the session tables.

use tdmtp_tl_types::types::{
    BadMsgNotification, MsgContainer, MsgDetailedInfo, MsgNewDetailedInfo, MsgsAck, MsgsAllInfo,
    MsgsStateInfo,
};
use tdmtp_tl_types::{functions::HttpWait, Identifiable};

/// Logical id of a request; responses are routed by it.
///
/// Positive ids belong to calls made through the session, `0` marks engine
/// service messages that never enter the tables, and negative ids are
/// handed out for updates and other unsolicited payloads.
pub type RequestId = i32;

/// What a request is, as far as bookkeeping is concerned.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestKind {
    /// A call someone is waiting on; a bare ack does not complete it.
    Call,
    /// A message nobody waits on (`pong`, `msgs_state_info`, ...).
    Service,
    /// Our own `msgs_state_req`; never resent, expires like a container.
    StateRequest,
    /// A sent container: the ids of the messages it carried.
    Container(Vec<i64>),
}

/// A serialized outgoing message and its send state.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    /// TL body, without any `invokeWithLayer` / `invokeAfterMsg` wrapping.
    pub body: Vec<u8>,
    pub request_id: RequestId,
    /// Zero until the message is first placed on the wire.
    pub msg_id: i64,
    pub seq_no: i32,
    /// When it was last sent (ms). Zero means "send inside a container" and,
    /// once sent, "do not query the state of this one".
    pub sent_at: u64,
    /// Whether this request may carry the `initConnection` wrapper.
    pub needs_layer: bool,
    /// Request that must reach the server first.
    pub after: Option<RequestId>,
    pub kind: RequestKind,
}

impl Request {
    pub fn new(body: Vec<u8>, kind: RequestKind) -> Self {
        Self {
            body,
            request_id: 0,
            msg_id: 0,
            seq_no: 0,
            sent_at: 0,
            needs_layer: false,
            after: None,
            kind,
        }
    }

    /// A call that may be sent on its own without waiting for a container.
    pub fn call(body: Vec<u8>) -> Self {
        Self { needs_layer: true, ..Self::new(body, RequestKind::Call) }
    }

    pub fn constructor(&self) -> u32 {
        match self.body.get(..4) {
            Some(&[a, b, c, d]) => u32::from_le_bytes([a, b, c, d]),
            _ => 0,
        }
    }

    pub fn needs_ack(&self) -> bool { needs_ack(self.constructor()) }

    pub fn is_container(&self) -> bool { matches!(self.kind, RequestKind::Container(_)) }

    pub fn is_state_request(&self) -> bool { self.kind == RequestKind::StateRequest }

    pub fn awaits_response(&self) -> bool { self.kind == RequestKind::Call }

    /// Size of the message as placed in a container: header plus body.
    pub fn message_size(&self) -> usize { MsgContainer::MESSAGE_HEADER_LEN + self.body.len() }
}

/// Whether a message with this constructor must be acknowledged.
pub fn needs_ack(constructor: u32) -> bool {
    !matches!(
        constructor,
        MsgContainer::CONSTRUCTOR_ID
            | MsgsAck::CONSTRUCTOR_ID
            | HttpWait::CONSTRUCTOR_ID
            | BadMsgNotification::CONSTRUCTOR_ID
            | MsgsAllInfo::CONSTRUCTOR_ID
            | MsgsStateInfo::CONSTRUCTOR_ID
            | MsgDetailedInfo::CONSTRUCTOR_ID
            | MsgNewDetailedInfo::CONSTRUCTOR_ID
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdmtp_tl_types::functions::Ping;
    use tdmtp_tl_types::Serializable;

    #[test]
    fn ack_classes() {
        let ack = Request::new(MsgsAck { msg_ids: vec![4] }.to_bytes(), RequestKind::Service);
        assert!(!ack.needs_ack());
        let ping = Request::call(Ping { ping_id: 1 }.to_bytes());
        assert!(ping.needs_ack());
        assert!(!needs_ack(MsgContainer::CONSTRUCTOR_ID));
    }

    #[test]
    fn only_calls_await_a_response() {
        assert!(Request::call(vec![1, 2, 3, 4]).awaits_response());
        assert!(!Request::new(vec![1, 2, 3, 4], RequestKind::StateRequest).awaits_response());
        assert_eq!(Request::call(0x62d6b459u32.to_le_bytes().to_vec()).constructor(), MsgsAck::CONSTRUCTOR_ID);
    }
}
