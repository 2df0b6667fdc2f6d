//! The engine against a scripted server holding the same auth key.

use std::sync::Arc;

use tdmtp_crypto::{decrypt_message, encrypt_message_as_server, AuthKey, Side};
use tdmtp_mtproto::{Engine, EngineConfig, Error, Outcome, Received, Request, SessionData, Violation};
use tdmtp_tl_types::functions::{InvokeWithLayer, Ping, PingDelayDisconnect};
use tdmtp_tl_types::types::{
    BadMsgNotification, BadServerSalt, ContainedMessage, MsgContainer, MsgsAck, MsgsStateInfo, MsgsStateReq,
    NewSessionCreated, Pong, RpcResult,
};
use tdmtp_tl_types::{Blob, Deserializable, Identifiable, Serializable};

const NOW: u64 = 1_700_000_000_000;
const SALT: i64 = 0x1122_3344_5566_7788;
const BOOL_TRUE: [u8; 4] = [0xb5, 0x75, 0x72, 0x99];

/// Plaintext of a frame the client sent.
struct Opened {
    salt: i64,
    session: i64,
    msg_id: i64,
    seq_no: i32,
    body: Vec<u8>,
}

impl Opened {
    fn constructor(&self) -> u32 { constructor(&self.body) }

    fn messages(&self) -> Vec<ContainedMessage> {
        assert_eq!(self.constructor(), MsgContainer::CONSTRUCTOR_ID);
        MsgContainer::from_bytes(&self.body[4..]).unwrap().messages
    }
}

/// Top-level bodies of a frame, looking inside a container.
fn bodies(opened: &Opened) -> Vec<Vec<u8>> {
    if opened.constructor() == MsgContainer::CONSTRUCTOR_ID {
        opened.messages().into_iter().map(|m| m.body).collect()
    } else {
        vec![opened.body.clone()]
    }
}

fn constructor(body: &[u8]) -> u32 { u32::from_le_bytes(body[..4].try_into().unwrap()) }

fn find(messages: &[ContainedMessage], id: u32) -> &ContainedMessage {
    messages.iter().find(|m| constructor(&m.body) == id).unwrap()
}

/// The server end of the session.
struct Peer {
    key: AuthKey,
    salt: i64,
    counter: i64,
}

impl Peer {
    fn open(&self, frame: &[u8]) -> Opened {
        let (_, plain) = decrypt_message(frame, &self.key, Side::Client).unwrap();
        let len = u32::from_le_bytes(plain[28..32].try_into().unwrap()) as usize;
        Opened {
            salt: i64::from_le_bytes(plain[..8].try_into().unwrap()),
            session: i64::from_le_bytes(plain[8..16].try_into().unwrap()),
            msg_id: i64::from_le_bytes(plain[16..24].try_into().unwrap()),
            seq_no: i32::from_le_bytes(plain[24..28].try_into().unwrap()),
            body: plain[32..32 + len].to_vec(),
        }
    }

    /// A server msg id `skew` seconds away from [`NOW`].
    fn next_id(&mut self, skew: i64) -> i64 {
        self.counter += 1;
        (((NOW / 1000) as i64 + skew) << 32) | (self.counter * 4 + 1)
    }

    fn seal_at(&mut self, session: i64, seq_no: i32, body: &[u8], skew: i64) -> (i64, Vec<u8>) {
        let msg_id = self.next_id(skew);
        let mut plain = Vec::new();
        plain.extend(self.salt.to_le_bytes());
        plain.extend(session.to_le_bytes());
        plain.extend(msg_id.to_le_bytes());
        plain.extend(seq_no.to_le_bytes());
        plain.extend((body.len() as u32).to_le_bytes());
        plain.extend_from_slice(body);
        (msg_id, encrypt_message_as_server(&plain, &self.key, &[7; 16]).unwrap())
    }

    fn seal(&mut self, session: i64, seq_no: i32, body: &[u8]) -> (i64, Vec<u8>) {
        self.seal_at(session, seq_no, body, 0)
    }

    fn result(&mut self, req_msg_id: i64, response: &[u8]) -> ContainedMessage {
        let body = RpcResult { req_msg_id, result: Blob(response.to_vec()) }.to_bytes();
        ContainedMessage { msg_id: self.next_id(0), seqno: 1, body }
    }
}

fn setup(config: EngineConfig) -> (Engine, Arc<SessionData>, Peer) {
    let key = AuthKey::from_bytes([0x42; 256]);
    let data = Arc::new(SessionData::new().unwrap());
    data.set_auth_key(Some(Arc::new(key.clone()))).unwrap();
    let engine = Engine::new(Arc::clone(&data), config);
    (engine, data, Peer { key, salt: SALT, counter: 0 })
}

/// Send the first ping and answer it, which hands the client a salt.
fn connect(engine: &mut Engine, data: &SessionData, peer: &mut Peer) -> i64 {
    engine.on_key_ready(NOW).unwrap();
    let out = engine.prepare_frame(NOW).unwrap().unwrap();
    let ping = peer.open(&out.frame);
    assert_eq!(ping.salt, 0);
    assert_eq!(ping.constructor(), Ping::CONSTRUCTOR_ID);
    assert_eq!(ping.seq_no & 1, 1);
    assert!(out.needs_any_response);

    let ping_id = Ping::from_bytes(&ping.body[4..]).unwrap().ping_id;
    let (pong_id, frame) = peer.seal(ping.session, 1, &Pong { msg_id: ping.msg_id, ping_id }.to_bytes());
    assert_eq!(engine.handle_frame(&frame, NOW), Outcome::Ok);
    assert!(engine.is_connected());
    assert_eq!(data.salt(), SALT);
    pong_id
}

fn call(data: &SessionData, now: u64) -> i32 {
    data.send_prepared(Request::call(vec![0xaa; 8]), 0, now)
}

#[test]
fn nothing_but_the_ping_goes_out_before_a_salt() {
    let (mut engine, data, _) = setup(EngineConfig::default());
    call(&data, NOW);
    engine.on_key_ready(NOW).unwrap();
    assert!(engine.prepare_frame(NOW).unwrap().is_some());
    assert_eq!(engine.prepare_frame(NOW).unwrap(), None);
    assert_eq!(data.to_send_len(), 1);
}

#[test]
fn container_round_trip() {
    let (mut engine, data, mut peer) = setup(EngineConfig::default());
    let pong_id = connect(&mut engine, &data, &mut peer);

    let now = NOW + 2_000;
    let first = call(&data, now);
    let second = call(&data, now);
    let out = engine.prepare_frame(now).unwrap().unwrap();
    assert_eq!(out.ping_timer, Some(30_000));
    assert!(out.needs_any_response);

    let sent = peer.open(&out.frame);
    assert_eq!(sent.salt, SALT);
    assert_eq!(sent.seq_no & 1, 0);
    let messages = sent.messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(constructor(&messages[0].body), PingDelayDisconnect::CONSTRUCTOR_ID);
    let calls: Vec<_> = messages
        .iter()
        .filter(|m| constructor(&m.body) == InvokeWithLayer::<Blob>::CONSTRUCTOR_ID)
        .collect();
    assert_eq!(calls.len(), 2);
    for m in messages.iter().filter(|m| constructor(&m.body) != MsgsAck::CONSTRUCTOR_ID) {
        assert_eq!(m.seqno & 1, 1);
        assert!(m.msg_id < out.msg_id);
    }
    let ack = find(&messages, MsgsAck::CONSTRUCTOR_ID);
    assert_eq!(ack.seqno & 1, 0);
    assert_eq!(MsgsAck::from_bytes(&ack.body[4..]).unwrap().msg_ids, vec![pong_id]);

    let reply = MsgContainer { messages: vec![peer.result(calls[0].msg_id, &BOOL_TRUE), peer.result(calls[1].msg_id, &BOOL_TRUE)] };
    let answered: Vec<i64> = reply.messages.iter().map(|m| m.msg_id).collect();
    let (_, frame) = peer.seal(sent.session, 2, &reply.to_bytes());
    assert_eq!(engine.handle_frame(&frame, now), Outcome::Ok);

    let received = data.take_received();
    assert_eq!(received.len(), 2);
    for id in [first, second] {
        assert_eq!(received.get(&id), Some(&Received::Response(BOOL_TRUE.to_vec())));
    }
    assert!(data.layer_inited());

    // The answers get acked on their own, and later calls go out unwrapped.
    let out = engine.prepare_frame(now + 1).unwrap().unwrap();
    assert!(!out.needs_any_response);
    let ack = peer.open(&out.frame);
    assert_eq!(ack.constructor(), MsgsAck::CONSTRUCTOR_ID);
    assert_eq!(MsgsAck::from_bytes(&ack.body[4..]).unwrap().msg_ids, answered);

    call(&data, now + 2);
    let out = engine.prepare_frame(now + 2).unwrap().unwrap();
    assert_eq!(peer.open(&out.frame).body, vec![0xaa; 8]);
}

#[test]
fn server_clock_is_trusted_only_when_it_echoes_our_ids() {
    let (mut engine, data, mut peer) = setup(EngineConfig::default());
    connect(&mut engine, &data, &mut peer);

    let now = NOW + 500;
    let request_id = call(&data, now);
    let sent = peer.open(&engine.prepare_frame(now).unwrap().unwrap().frame);
    let call_id = find(&sent.messages(), InvokeWithLayer::<Blob>::CONSTRUCTOR_ID).msg_id;

    peer.salt = SALT + 1;
    let ack = MsgsAck { msg_ids: vec![0x1234_5678] }.to_bytes();
    let (_, frame) = peer.seal_at(sent.session, 0, &ack, 1_000);
    assert_eq!(engine.handle_frame(&frame, now), Outcome::Ok);
    assert_eq!(data.salt(), SALT);
    assert_eq!(data.time_offset(), 0);

    let result = RpcResult { req_msg_id: call_id, result: Blob(BOOL_TRUE.to_vec()) }.to_bytes();
    let (_, frame) = peer.seal_at(sent.session, 1, &result, 1_000);
    assert_eq!(engine.handle_frame(&frame, now), Outcome::Ok);
    assert_eq!(data.salt(), SALT + 1);
    assert_eq!(data.time_offset(), 1_000);
    assert_eq!(data.take_received().get(&request_id), Some(&Received::Response(BOOL_TRUE.to_vec())));
}

#[test]
fn untrusted_container_commits_nothing_after_a_skipped_message() {
    let (mut engine, data, mut peer) = setup(EngineConfig::default());
    connect(&mut engine, &data, &mut peer);
    let session = data.session();

    peer.salt = SALT + 5;
    let ack = MsgsAck { msg_ids: vec![0x1234_5678] }.to_bytes();
    let created = NewSessionCreated { first_msg_id: 0x4444_0000, unique_id: 1, server_salt: SALT + 5 }.to_bytes();
    let update = vec![0x11, 0x22, 0x33, 0x44, 0, 0, 0, 0];
    let messages = [ack, created, update]
        .into_iter()
        .map(|body| ContainedMessage { msg_id: peer.next_id(1_000), seqno: 1, body })
        .collect();
    let (_, frame) = peer.seal_at(session, 0, &MsgContainer { messages }.to_bytes(), 1_000);

    assert_eq!(engine.handle_frame(&frame, NOW + 100), Outcome::Ok);
    assert_eq!(data.salt(), SALT);
    assert_eq!(data.time_offset(), 0);
    assert_eq!(data.session(), session);
    assert!(data.take_received().is_empty());
}

#[test]
fn resent_call_is_answered_once() {
    let (mut engine, data, mut peer) = setup(EngineConfig::default());
    connect(&mut engine, &data, &mut peer);

    let now = NOW + 500;
    let request_id = call(&data, now);
    let sent = peer.open(&engine.prepare_frame(now).unwrap().unwrap().frame);
    let old_id = find(&sent.messages(), InvokeWithLayer::<Blob>::CONSTRUCTOR_ID).msg_id;

    let bad = BadServerSalt { bad_msg_id: old_id, bad_msg_seqno: 1, error_code: 48, new_server_salt: SALT + 7 };
    let (_, frame) = peer.seal(sent.session, 0, &bad.to_bytes());
    assert_eq!(engine.handle_frame(&frame, now), Outcome::Ok);
    assert_eq!(data.salt(), SALT + 7);

    let resent = peer.open(&engine.prepare_frame(now + 100).unwrap().unwrap().frame);
    assert_eq!(resent.salt, SALT + 7);
    assert_ne!(resent.msg_id, old_id);
    assert_eq!(resent.constructor(), InvokeWithLayer::<Blob>::CONSTRUCTOR_ID);

    // A late answer to the first copy is dropped.
    peer.salt = SALT + 7;
    let late = RpcResult { req_msg_id: old_id, result: Blob(vec![1; 4]) }.to_bytes();
    let (_, frame) = peer.seal(sent.session, 1, &late);
    assert_eq!(engine.handle_frame(&frame, now + 200), Outcome::Ok);
    assert!(data.take_received().is_empty());

    let result = RpcResult { req_msg_id: resent.msg_id, result: Blob(BOOL_TRUE.to_vec()) }.to_bytes();
    let (_, frame) = peer.seal(sent.session, 1, &result);
    assert_eq!(engine.handle_frame(&frame, now + 300), Outcome::Ok);
    let received = data.take_received();
    assert_eq!(received.len(), 1);
    assert_eq!(received.get(&request_id), Some(&Received::Response(BOOL_TRUE.to_vec())));
}

#[test]
fn server_ping_is_answered_with_pong() {
    let (mut engine, data, mut peer) = setup(EngineConfig::default());
    connect(&mut engine, &data, &mut peer);
    let session = data.session();

    let (ping_msg_id, frame) = peer.seal(session, 1, &Ping { ping_id: 9 }.to_bytes());
    assert_eq!(engine.handle_frame(&frame, NOW + 100), Outcome::Ok);
    let sent = peer.open(&engine.prepare_frame(NOW + 100).unwrap().unwrap().frame);
    let messages = sent.messages();
    let pong = find(&messages, Pong::CONSTRUCTOR_ID);
    assert_eq!(Pong::from_bytes(&pong.body[4..]).unwrap(), Pong { msg_id: ping_msg_id, ping_id: 9 });
    let ack = MsgsAck::from_bytes(&find(&messages, MsgsAck::CONSTRUCTOR_ID).body[4..]).unwrap();
    assert!(ack.msg_ids.contains(&ping_msg_id));
}

#[test]
fn tampered_frames_restart_the_connection() {
    let (mut engine, data, mut peer) = setup(EngineConfig::default());
    connect(&mut engine, &data, &mut peer);
    let session = data.session();

    let (_, mut frame) = peer.seal(session, 1, &Ping { ping_id: 1 }.to_bytes());
    frame[40] ^= 0x80;
    assert!(matches!(engine.handle_frame(&frame, NOW), Outcome::Restart(Error::ProtocolViolation(_))));

    let (_, mut frame) = peer.seal(session, 1, &Ping { ping_id: 2 }.to_bytes());
    frame[0] ^= 1;
    assert!(matches!(engine.handle_frame(&frame, NOW), Outcome::Restart(Error::Crypto(_))));

    let (_, frame) = peer.seal(session, 1, &Ping { ping_id: 3 }.to_bytes());
    assert!(matches!(
        engine.handle_frame(&frame[..64], NOW),
        Outcome::Restart(Error::ProtocolViolation(Violation::ShortFrame { .. }))
    ));
}

#[test]
fn foreign_session_restarts_the_connection() {
    let (mut engine, data, mut peer) = setup(EngineConfig::default());
    connect(&mut engine, &data, &mut peer);

    let (_, frame) = peer.seal(data.session().wrapping_add(1), 1, &Ping { ping_id: 1 }.to_bytes());
    assert!(matches!(
        engine.handle_frame(&frame, NOW),
        Outcome::Restart(Error::ProtocolViolation(Violation::SessionMismatch { .. }))
    ));
}

#[test]
fn bad_seq_no_resets_the_session() {
    let (mut engine, data, mut peer) = setup(EngineConfig::default());
    connect(&mut engine, &data, &mut peer);

    let now = NOW + 500;
    call(&data, now);
    let sent = peer.open(&engine.prepare_frame(now).unwrap().unwrap().frame);
    let call_id = find(&sent.messages(), InvokeWithLayer::<Blob>::CONSTRUCTOR_ID).msg_id;

    let bad = BadMsgNotification { bad_msg_id: call_id, bad_msg_seqno: 1, error_code: 32 };
    let (_, frame) = peer.seal(sent.session, 0, &bad.to_bytes());
    assert_eq!(engine.handle_frame(&frame, now), Outcome::ResetSessionThenRestart);

    engine.restart(now + 100).unwrap();
    assert!(!engine.is_connected());
    assert_ne!(data.session(), sent.session);
    assert!(data.take_session_reset());

    // Once the new connection has its salt the unanswered call goes out again.
    engine.on_key_ready(now + 200).unwrap();
    assert!(engine.is_connected());
    assert_eq!(data.to_send_len(), 1);
    let again = peer.open(&engine.prepare_frame(now + 200).unwrap().unwrap().frame);
    assert_eq!(again.session, data.session());
}

#[test]
fn rejected_call_fails_with_the_code() {
    let (mut engine, data, mut peer) = setup(EngineConfig::default());
    connect(&mut engine, &data, &mut peer);

    let now = NOW + 500;
    let request_id = call(&data, now);
    let sent = peer.open(&engine.prepare_frame(now).unwrap().unwrap().frame);
    let call_id = find(&sent.messages(), InvokeWithLayer::<Blob>::CONSTRUCTOR_ID).msg_id;

    let bad = BadMsgNotification { bad_msg_id: call_id, bad_msg_seqno: 1, error_code: 35 };
    let (_, frame) = peer.seal(sent.session, 0, &bad.to_bytes());
    assert_eq!(engine.handle_frame(&frame, now), Outcome::Ok);
    assert_eq!(
        data.take_received().get(&request_id),
        Some(&Received::Failed(Error::ServerRejection { code: 35 }))
    );
}

#[test]
fn state_requests_are_answered_from_received_ids() {
    let (mut engine, data, mut peer) = setup(EngineConfig::default());
    let pong_id = connect(&mut engine, &data, &mut peer);

    let req = MsgsStateReq { msg_ids: vec![4, pong_id, i64::MAX - 3] };
    let (req_id, frame) = peer.seal(data.session(), 0, &req.to_bytes());
    assert_eq!(engine.handle_frame(&frame, NOW + 100), Outcome::Ok);

    let sent = peer.open(&engine.prepare_frame(NOW + 100).unwrap().unwrap().frame);
    let body = bodies(&sent).into_iter().find(|b| constructor(b) == MsgsStateInfo::CONSTRUCTOR_ID).unwrap();
    let info = MsgsStateInfo::from_bytes(&body[4..]).unwrap();
    assert_eq!(info.req_msg_id, req_id);
    assert_eq!(info.info.len(), 3);
    assert_eq!(info.info[0], 0x01);
    assert_ne!(info.info[1] & 0x04, 0);
    assert_eq!(info.info[2], 0x03);
}

#[test]
fn new_session_resends_older_calls_and_is_forwarded() {
    let (mut engine, data, mut peer) = setup(EngineConfig::default());
    connect(&mut engine, &data, &mut peer);

    let now = NOW + 500;
    call(&data, now);
    let sent = peer.open(&engine.prepare_frame(now).unwrap().unwrap().frame);
    let call_id = find(&sent.messages(), InvokeWithLayer::<Blob>::CONSTRUCTOR_ID).msg_id;

    peer.salt = SALT + 9;
    let created = NewSessionCreated { first_msg_id: call_id + 4, unique_id: 77, server_salt: SALT + 9 }.to_bytes();
    let (_, frame) = peer.seal(sent.session, 1, &created);
    assert_eq!(engine.handle_frame(&frame, now), Outcome::Ok);
    assert_eq!(data.salt(), SALT + 9);

    let received = data.take_received();
    assert_eq!(received.len(), 1);
    let (&fake, update) = received.iter().next().unwrap();
    assert!(fake < 0);
    assert_eq!(update, &Received::Update(created));

    let again = peer.open(&engine.prepare_frame(now + 100).unwrap().unwrap().frame);
    let resent = again.messages();
    let resent_call = find(&resent, InvokeWithLayer::<Blob>::CONSTRUCTOR_ID);
    assert_ne!(resent_call.msg_id, call_id);
}

#[test]
fn unknown_constructors_become_updates() {
    let (mut engine, data, mut peer) = setup(EngineConfig::default());
    connect(&mut engine, &data, &mut peer);

    let update = [0x11, 0x22, 0x33, 0x44, 0, 0, 0, 0];
    let (_, frame) = peer.seal(data.session(), 1, &update);
    assert_eq!(engine.handle_frame(&frame, NOW + 100), Outcome::Ok);
    let received = data.take_received();
    assert_eq!(received.len(), 1);
    let (&fake, body) = received.iter().next().unwrap();
    assert!(fake < 0);
    assert_eq!(body, &Received::Update(update.to_vec()));
}
