//! The per-connection protocol engine.
//!
//! [`Engine::prepare_frame`] turns the session queues into one encrypted
//! frame; [`Engine::handle_frame`] decrypts a frame from the server and
//! dispatches every message in it. Neither does I/O or reads the clock:
//! the runtime passes `now` (Unix milliseconds) and moves the bytes.

use std::io::Read;
use std::sync::Arc;

use log::{debug, info, warn};
use tdmtp_crypto::{decrypt_message, encrypt_message, fill_random, msg_key_for, Side};
use tdmtp_tl_types::functions::{
    HttpWait, InitConnection, InvokeAfterMsg, InvokeWithLayer, Ping, PingDelayDisconnect,
};
use tdmtp_tl_types::types::{
    BadMsgNotification, BadServerSalt, ContainedMessage, GzipPacked, MsgContainer,
    MsgDetailedInfo, MsgNewDetailedInfo, MsgResendReq, MsgsAck, MsgsAllInfo, MsgsStateInfo,
    MsgsStateReq, NewSessionCreated, Pong, RpcResult,
};
use tdmtp_tl_types::{name_for_id, Blob, Deserializable, Identifiable, Serializable, LAYER};

use crate::constants::{
    ACK_SEND_WAITING, BAD_TIME_AHEAD_SECS, BAD_TIME_BEHIND_SECS, HTTP_WAIT,
    MAX_CONTAINER_MESSAGES, PING_DELAY_DISCONNECT_SECS, PING_SEND_AFTER_AUTO_SECS,
    PING_SEND_AFTER_SECS,
};
use crate::error::{Error, Violation};
use crate::message::msg_id_time;
use crate::request::{Request, RequestId, RequestKind};
use crate::session_data::{random_i64, Received, Sent, SessionData};

/// Smallest encrypted frame: key id, msg key and one block of header plus
/// the shortest body.
const MIN_FRAME_LEN: usize = 72;

/// `initConnection` parameters and per-connection switches.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub api_id: i32,
    pub device_model: String,
    pub system_version: String,
    pub app_version: String,
    pub lang_code: String,
    pub layer: i32,
    /// The main session keeps a ping timer and pings with
    /// `ping_delay_disconnect`; other sessions use plain `ping`.
    pub is_main: bool,
    /// The transport needs `http_wait` to keep a long poll open.
    pub http_wait: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_id: 0,
            device_model: "Rust".into(),
            system_version: std::env::consts::OS.into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
            lang_code: "en".into(),
            layer: LAYER,
            is_main: true,
            http_wait: false,
        }
    }
}

/// An encrypted frame ready for the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct Outgoing {
    pub frame: Vec<u8>,
    /// Id of the outer message (the container, if one was built).
    pub msg_id: i64,
    /// Something in the frame expects an answer; arm the receive timer.
    pub needs_any_response: bool,
    /// Restart the keepalive timer with this delay (ms).
    pub ping_timer: Option<u64>,
}

/// What the connection should do after an incoming frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Ok,
    Restart(Error),
    ResetSessionThenRestart,
}

/// Result of the keepalive timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingCheck {
    /// The ping in flight is overdue.
    Restart,
    /// Check again after this many ms.
    Rearm(u64),
    /// A send was requested; the next frame carries a ping.
    Send,
}

enum Handled {
    Ok,
    /// Not handled because the server clock is not trusted yet.
    Skip,
    ResetSession,
}

/// Per-connection protocol state on top of a shared [`SessionData`].
pub struct Engine {
    data: Arc<SessionData>,
    config: EngineConfig,
    connected: bool,
    restarted: bool,
    need_session_reset: bool,
    key_id: u64,
    ping_id: i64,
    ping_id_to_send: i64,
    ping_msg_id: i64,
    ping_send_at: u64,
    ack_request_data: Vec<i64>,
    resend_request_data: Vec<i64>,
}

impl Engine {
    pub fn new(data: Arc<SessionData>, config: EngineConfig) -> Self {
        Self {
            data,
            config,
            connected: false,
            restarted: false,
            need_session_reset: false,
            key_id: 0,
            ping_id: 0,
            ping_id_to_send: 0,
            ping_msg_id: 0,
            ping_send_at: 0,
            ack_request_data: Vec::new(),
            resend_request_data: Vec::new(),
        }
    }

    pub fn data(&self) -> &Arc<SessionData> { &self.data }

    pub fn config(&self) -> &EngineConfig { &self.config }

    /// A salt has been adopted on this connection.
    pub fn is_connected(&self) -> bool { self.connected }

    /// The key this connection encrypts with, `0` before [`on_key_ready`](Self::on_key_ready).
    pub fn key_id(&self) -> u64 { self.key_id }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// The transport is up and the session has a key (new or stored).
    ///
    /// Pins the key for this connection and queues a ping, whose answer
    /// brings the current salt.
    pub fn on_key_ready(&mut self, now: u64) -> Result<(), Error> {
        let key = self.data.auth_key().ok_or(Violation::KeyChanged)?;
        self.key_id = key.key_id();
        if self.data.salt() != 0 {
            self.mark_connected(now);
        }
        self.ping_id_to_send = random_i64()?;
        self.data.request_send(0);
        Ok(())
    }

    /// The transport went away.
    pub fn on_disconnect(&mut self) {
        self.connected = false;
        self.restarted = false;
        self.key_id = 0;
        self.ping_id = 0;
        self.ping_id_to_send = 0;
        self.ping_msg_id = 0;
    }

    /// Tear the connection state down before reconnecting.
    ///
    /// Runs the pending session reset, if any. Everything unanswered is
    /// resent once the new connection adopts a salt.
    pub fn restart(&mut self, now: u64) -> Result<(), Error> {
        self.on_disconnect();
        if std::mem::take(&mut self.need_session_reset) {
            self.ack_request_data.clear();
            self.resend_request_data.clear();
            self.data.reset_session(now)?;
        }
        self.restarted = true;
        Ok(())
    }

    /// Keepalive timer fired.
    pub fn check_ping(&mut self, now: u64) -> PingCheck {
        if self.ping_id == 0 {
            self.data.request_send(0);
            return PingCheck::Send;
        }
        let overdue = self.ping_send_at + (PING_SEND_AFTER_SECS - PING_SEND_AFTER_AUTO_SECS - 1) * 1000;
        if overdue < now {
            warn!("[tdmtp] ping {} unanswered, restarting", self.ping_id);
            return PingCheck::Restart;
        }
        let next = self.ping_send_at + (PING_SEND_AFTER_SECS - PING_SEND_AFTER_AUTO_SECS) * 1000;
        PingCheck::Rearm(next.saturating_sub(now))
    }

    fn mark_connected(&mut self, now: u64) -> bool {
        if self.connected {
            return false;
        }
        info!("[tdmtp] connected, salt {}", self.data.salt());
        self.connected = true;
        if self.restarted {
            self.data.resend_all(now);
            self.restarted = false;
        }
        true
    }

    // ─── Send path ───────────────────────────────────────────────────────

    /// Build the next frame, if there is anything to send.
    ///
    /// Until a salt is known only the ping goes out. A lone message that
    /// may travel on its own is sent as is; anything else is packed into a
    /// `msg_container`.
    pub fn prepare_frame(&mut self, now: u64) -> Result<Option<Outgoing>, Error> {
        if self.key_id == 0 {
            return Ok(None);
        }
        let prepend_only = !self.connected;
        let mut ping_timer = None;

        if self.config.is_main
            && !prepend_only
            && self.ping_id == 0
            && self.ping_id_to_send == 0
            && self.ping_send_at <= now
        {
            self.ping_id_to_send = random_i64()?;
        }
        let ping = if self.ping_id_to_send != 0 {
            let ping_id = self.ping_id_to_send;
            let body = if prepend_only || !self.config.is_main {
                debug!("[tdmtp] sending ping {ping_id}");
                Ping { ping_id }.to_bytes()
            } else {
                debug!("[tdmtp] sending ping_delay_disconnect {ping_id}");
                PingDelayDisconnect { ping_id, disconnect_delay: PING_DELAY_DISCONNECT_SECS }.to_bytes()
            };
            self.ping_send_at = now + PING_SEND_AFTER_AUTO_SECS * 1000;
            if self.config.is_main && !prepend_only {
                ping_timer = Some(PING_SEND_AFTER_SECS * 1000);
            }
            self.ping_id = ping_id;
            self.ping_id_to_send = 0;
            Some(service(body, now))
        } else if prepend_only {
            debug!("[tdmtp] not sending, waiting for a salt");
            return Ok(None);
        } else {
            None
        };

        let mut ack = None;
        let mut resend = None;
        let mut state = None;
        let mut http_wait = None;
        let mut calls = Vec::new();
        if !prepend_only {
            if !self.ack_request_data.is_empty() {
                let msg_ids = std::mem::take(&mut self.ack_request_data);
                ack = Some(service(MsgsAck { msg_ids }.to_bytes(), now));
            }
            if !self.resend_request_data.is_empty() {
                let msg_ids = std::mem::take(&mut self.resend_request_data);
                resend = Some(service(MsgResendReq { msg_ids }.to_bytes(), now));
            }
            let msg_ids = self.data.take_state_requests();
            if !msg_ids.is_empty() {
                let mut request = Request::new(MsgsStateReq { msg_ids }.to_bytes(), RequestKind::StateRequest);
                request.request_id = self.data.next_request_id();
                request.sent_at = now;
                state = Some(request);
            }
            if self.config.http_wait {
                let (max_delay, wait_after, max_wait) = HTTP_WAIT;
                http_wait = Some(service(HttpWait { max_delay, wait_after, max_wait }.to_bytes(), now));
            }
            calls = self.take_ready_calls();
        }

        let needs_layer = !self.data.layer_inited();
        let mut needs_any_response = ping.is_some() || resend.is_some() || state.is_some();
        let has_ping = ping.is_some();

        // Container order: ping, calls, state request, resend request, acks, http_wait.
        let mut items: Vec<Request> = ping.into_iter().collect();
        items.extend(calls);
        items.extend(state);
        items.extend(resend);
        items.extend(ack);
        items.extend(http_wait);

        if items.is_empty() {
            return Ok(None);
        }

        let (msg_id, seq_no, body) = if items.len() == 1 && items[0].sent_at > 0 {
            let mut request = items.remove(0);
            let msg_id = self.data.msgid(now);
            self.prepare_to_send(&mut request, msg_id, now);
            if has_ping {
                self.ping_msg_id = msg_id;
            }
            let seq_no = request.seq_no;
            let body = self.record_sent(request, needs_layer, now, &mut needs_any_response);
            (msg_id, seq_no, body)
        } else {
            let mut big = self.data.msgid(now);
            let mut messages = Vec::with_capacity(items.len());
            for (i, mut request) in items.into_iter().enumerate() {
                let msg_id = self.prepare_to_send(&mut request, big, now);
                if msg_id >= big {
                    big = self.data.msgid(now);
                }
                if has_ping && i == 0 {
                    self.ping_msg_id = msg_id;
                }
                let seqno = request.seq_no;
                let body = self.record_sent(request, needs_layer, now, &mut needs_any_response);
                messages.push(ContainedMessage { msg_id, seqno, body });
            }
            let inner = messages.iter().map(|m| m.msg_id).collect();
            let mut record = Request::new(Vec::new(), RequestKind::Container(inner));
            record.msg_id = big;
            record.seq_no = self.data.next_seq_no(false);
            let seq_no = record.seq_no;
            self.data.have_sent().write().insert(big, record);
            debug!("[tdmtp] packed {} messages into container {big}", messages.len());
            (big, seq_no, MsgContainer { messages }.to_bytes())
        };

        let frame = self.encrypt(msg_id, seq_no, &body)?;
        Ok(Some(Outgoing { frame, msg_id, needs_any_response, ping_timer }))
    }

    /// Queued calls whose dependency is already on the wire.
    fn take_ready_calls(&self) -> Vec<Request> {
        let mut to_send = self.data.to_send().write();
        let ready: Vec<RequestId> = to_send
            .iter()
            .filter(|(_, r)| r.after.is_none_or(|dep| !to_send.contains_key(&dep)))
            .map(|(&id, _)| id)
            .take(MAX_CONTAINER_MESSAGES)
            .collect();
        if ready.len() < to_send.len() {
            self.data.request_send(0);
        }
        ready.into_iter().filter_map(|id| to_send.remove(&id)).collect()
    }

    /// Give `request` the id `msg_id` and a seq number. A request that had
    /// an id before is being resent and moves off its old id.
    fn prepare_to_send(&self, request: &mut Request, msg_id: i64, now: u64) -> i64 {
        let msg_id = if request.msg_id != 0 {
            let id = self.data.replace_msg_id(request, msg_id, now);
            self.data.to_resend().write().remove(&id);
            id
        } else {
            request.msg_id = msg_id;
            msg_id
        };
        request.seq_no = self.data.next_seq_no(request.needs_ack());
        msg_id
    }

    /// File a request that is going out and return its wire body.
    fn record_sent(&self, mut request: Request, needs_layer: bool, now: u64, needs_any_response: &mut bool) -> Vec<u8> {
        if request.request_id == 0 {
            return request.body;
        }
        let msg_id = request.msg_id;
        if !request.needs_ack() {
            self.data.were_acked().write().insert(msg_id, request.request_id);
            return std::mem::take(&mut request.body);
        }
        let body = self.wrap(&request, needs_layer);
        request.sent_at = if request.is_state_request() { 0 } else { now };
        self.data.have_sent().write().insert(msg_id, request);
        *needs_any_response = true;
        body
    }

    /// Apply `invokeAfterMsg` and, until the layer is confirmed,
    /// `invokeWithLayer(initConnection(..))`.
    fn wrap(&self, request: &Request, needs_layer: bool) -> Vec<u8> {
        let mut body = request.body.clone();
        if let Some(dep) = request.after {
            let dep_msg_id = self
                .data
                .have_sent()
                .read()
                .iter()
                .find(|(_, r)| r.request_id == dep)
                .map(|(&id, _)| id);
            if let Some(msg_id) = dep_msg_id {
                body = InvokeAfterMsg { msg_id, query: Blob(body) }.to_bytes();
            }
        }
        if needs_layer && request.needs_layer {
            let c = &self.config;
            body = InvokeWithLayer {
                layer: c.layer,
                query: InitConnection {
                    api_id: c.api_id,
                    device_model: c.device_model.clone(),
                    system_version: c.system_version.clone(),
                    app_version: c.app_version.clone(),
                    lang_code: c.lang_code.clone(),
                    query: Blob(body),
                },
            }
            .to_bytes();
        }
        body
    }

    fn encrypt(&self, msg_id: i64, seq_no: i32, body: &[u8]) -> Result<Vec<u8>, Error> {
        let mut plain = Vec::with_capacity(32 + body.len());
        plain.extend(self.data.salt().to_le_bytes());
        plain.extend(self.data.session().to_le_bytes());
        plain.extend(msg_id.to_le_bytes());
        plain.extend(seq_no.to_le_bytes());
        plain.extend((body.len() as u32).to_le_bytes());
        plain.extend_from_slice(body);

        let mut random = [0u8; 16];
        fill_random(&mut random)?;
        let guard = self.data.auth_key_guard();
        let key = guard
            .as_ref()
            .filter(|k| k.key_id() == self.key_id)
            .ok_or(Violation::KeyChanged)?;
        Ok(encrypt_message(&plain, key, &random)?)
    }

    // ─── Receive path ────────────────────────────────────────────────────

    /// Decrypt, verify and dispatch one frame from the server.
    pub fn handle_frame(&mut self, frame: &[u8], now: u64) -> Outcome {
        match self.receive(frame, now) {
            Ok(Handled::ResetSession) => {
                warn!("[tdmtp] server asked for a new session");
                self.need_session_reset = true;
                Outcome::ResetSessionThenRestart
            }
            Ok(_) => Outcome::Ok,
            Err(e) => {
                warn!("[tdmtp] restarting: {e}");
                Outcome::Restart(e)
            }
        }
    }

    fn receive(&mut self, frame: &[u8], now: u64) -> Result<Handled, Error> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(Violation::ShortFrame { len: frame.len() }.into());
        }
        let plain = {
            let guard = self.data.auth_key_guard();
            let key = guard
                .as_ref()
                .filter(|k| k.key_id() == self.key_id)
                .ok_or(Violation::KeyChanged)?;
            let (msg_key, plain) = decrypt_message(frame, key, Side::Server)?;
            let msg_len = u32::from_le_bytes(word(&plain[28..32]));
            if msg_len as usize > plain.len() - 32 || msg_len % 4 != 0 {
                return Err(Violation::BadLength { len: msg_len }.into());
            }
            if msg_key_for(&plain[..32 + msg_len as usize]) != msg_key {
                return Err(Violation::MsgKeyMismatch.into());
            }
            plain
        };

        let server_salt = i64::from_le_bytes(long(&plain[..8]));
        let session = i64::from_le_bytes(long(&plain[8..16]));
        let msg_id = i64::from_le_bytes(long(&plain[16..24]));
        let seq_no = i32::from_le_bytes(word(&plain[24..28]));
        let msg_len = u32::from_le_bytes(word(&plain[28..32])) as usize;
        let body = &plain[32..32 + msg_len];

        let expected = self.data.session();
        if session != expected {
            return Err(Violation::SessionMismatch { got: session, expected }.into());
        }
        if !matches!(msg_id & 3, 1 | 3) {
            return Err(Violation::BadMsgIdParity { msg_id }.into());
        }

        let server_time = msg_id_time(msg_id);
        let client_time = self.data.server_now_secs(now);
        let bad_time = server_time > client_time + BAD_TIME_AHEAD_SECS
            || server_time + BAD_TIME_BEHIND_SECS < client_time;
        if bad_time {
            debug!("[tdmtp] bad server time {server_time}, ours {client_time}");
        }

        let mut became_connected = false;
        let server_salt = if server_salt == self.data.salt() {
            0
        } else {
            if !bad_time {
                self.data.set_salt(server_salt);
                became_connected = self.mark_connected(now);
            }
            server_salt
        };

        let need_ack = seq_no & 1 == 1;
        if need_ack {
            self.ack_request_data.push(msg_id);
        }
        let fresh = self.data.received_ids().write().insert(msg_id, need_ack);
        let handled = if fresh {
            self.handle_one(msg_id, body, server_salt, bad_time, now)
        } else {
            debug!("[tdmtp] duplicate msg {msg_id}, skipping");
            Ok(Handled::Ok)
        };
        self.data.received_ids().write().shrink();

        if !self.ack_request_data.is_empty() {
            self.data.request_send(ACK_SEND_WAITING);
        }
        let handled = handled?;
        if matches!(handled, Handled::ResetSession) {
            return Ok(handled);
        }

        self.data.set_key_checked(true);
        if became_connected || self.config.http_wait {
            self.data.request_send(0);
        }
        Ok(handled)
    }

    /// Who sent `msg_id`, counting the ping in flight.
    fn was_sent(&self, msg_id: i64) -> Option<Sent> {
        if msg_id != 0 && msg_id == self.ping_msg_id {
            return Some(Sent::Service);
        }
        self.data.was_sent(msg_id)
    }

    /// A message from a server whose clock we distrust referenced `ids`; if
    /// one of them is ours, the clock and salt are genuine after all.
    fn requests_fix_time_salt(&self, ids: &[i64], server_salt: i64, msg_id: i64, now: u64) -> bool {
        if !ids.iter().any(|&id| self.was_sent(id).is_some()) {
            return false;
        }
        if server_salt != 0 {
            self.data.set_salt(server_salt);
        }
        self.data.update_time(msg_id_time(msg_id), now);
        true
    }

    /// Ack the answer the server mentioned, or ask for it again.
    fn check_answer(&mut self, answer_msg_id: i64) {
        let received = self.data.received_ids().read();
        let have_it = received.lookup(answer_msg_id).is_some() && received.min().is_some_and(|min| min < answer_msg_id);
        drop(received);
        if have_it {
            self.ack_request_data.push(answer_msg_id);
        } else {
            self.resend_request_data.push(answer_msg_id);
        }
    }

    fn handle_one(&mut self, msg_id: i64, body: &[u8], server_salt: i64, bad_time: bool, now: u64) -> Result<Handled, Error> {
        if body.len() < 4 {
            return Err(Violation::BadLength { len: body.len() as u32 }.into());
        }
        let constructor = u32::from_le_bytes(word(&body[..4]));
        let rest = &body[4..];
        let skip_if_bad = if bad_time { Handled::Skip } else { Handled::Ok };
        debug!("[tdmtp] handling {} in msg {msg_id}", name_for_id(constructor).unwrap_or("update"));

        match constructor {
            GzipPacked::CONSTRUCTOR_ID => {
                let packed = GzipPacked::from_bytes(rest)?;
                let data = gz_inflate(&packed.packed_data)?;
                self.handle_one(msg_id, &data, server_salt, bad_time, now)
            }

            MsgContainer::CONSTRUCTOR_ID => {
                let container = MsgContainer::from_bytes(rest)?;
                let mut bad_time = bad_time;
                for inner in container.messages {
                    if !matches!(inner.msg_id & 3, 1 | 3) {
                        return Err(Violation::BadMsgIdParity { msg_id: inner.msg_id }.into());
                    }
                    if inner.body.len() < 4 || inner.body.len() % 4 != 0 {
                        return Err(Violation::BadContainer.into());
                    }
                    let need_ack = inner.seqno & 1 == 1;
                    if need_ack {
                        self.ack_request_data.push(inner.msg_id);
                    }
                    if self.data.received_ids().write().insert(inner.msg_id, need_ack) {
                        // Later messages are trusted only once the first one fixed the time.
                        match self.handle_one(inner.msg_id, &inner.body, server_salt, bad_time, now)? {
                            Handled::Ok => bad_time = false,
                            other => return Ok(other),
                        }
                    }
                }
                Ok(Handled::Ok)
            }

            MsgsAck::CONSTRUCTOR_ID => {
                let ack = MsgsAck::from_bytes(rest)?;
                if ack.msg_ids.is_empty() {
                    return Ok(skip_if_bad);
                }
                if bad_time && !self.requests_fix_time_salt(&ack.msg_ids, server_salt, msg_id, now) {
                    return Ok(Handled::Skip);
                }
                self.data.requests_acked(&ack.msg_ids, false);
                Ok(Handled::Ok)
            }

            BadMsgNotification::CONSTRUCTOR_ID => {
                let bad = BadMsgNotification::from_bytes(rest)?;
                info!("[tdmtp] bad_msg_notification for {}, code {}", bad.bad_msg_id, bad.error_code);
                if bad.bad_msg_id == self.ping_msg_id {
                    self.ping_id = 0;
                }
                let code = bad.error_code;
                let Some(sent) = self.was_sent(bad.bad_msg_id) else {
                    return Ok(skip_if_bad);
                };
                match code {
                    // msg_id too low / too high, or a broken container
                    16 | 17 | 64 => {
                        if server_salt != 0 {
                            self.data.set_salt(server_salt);
                        }
                        self.data.update_time(msg_id_time(msg_id), now);
                        self.data.resend(bad.bad_msg_id, 0, true, now);
                        Ok(Handled::Ok)
                    }
                    // seq_no out of step: only a new session helps
                    32 | 33 => {
                        if bad_time {
                            if server_salt != 0 {
                                self.data.set_salt(server_salt);
                            }
                            self.data.update_time(msg_id_time(msg_id), now);
                        }
                        Ok(Handled::ResetSession)
                    }
                    _ => {
                        warn!("[tdmtp] msg {} rejected with code {code}", bad.bad_msg_id);
                        if let Sent::Request(request_id) = sent {
                            self.data.cancel(request_id, bad.bad_msg_id);
                            self.data.deliver(request_id, Received::Failed(Error::ServerRejection { code }));
                        }
                        Ok(skip_if_bad)
                    }
                }
            }

            BadServerSalt::CONSTRUCTOR_ID => {
                let bad = BadServerSalt::from_bytes(rest)?;
                if bad.bad_msg_id == self.ping_msg_id {
                    self.ping_id = 0;
                } else if self.was_sent(bad.bad_msg_id).is_none() {
                    return Ok(skip_if_bad);
                }
                info!("[tdmtp] bad_server_salt for {}, new salt {}", bad.bad_msg_id, bad.new_server_salt);
                self.data.set_salt(bad.new_server_salt);
                self.data.update_time(msg_id_time(msg_id), now);
                self.mark_connected(now);
                self.data.resend(bad.bad_msg_id, 0, false, now);
                Ok(Handled::Ok)
            }

            MsgsStateReq::CONSTRUCTOR_ID => {
                if bad_time {
                    return Ok(Handled::Skip);
                }
                let req = MsgsStateReq::from_bytes(rest)?;
                let info: Vec<u8> = req.msg_ids.iter().map(|&id| self.data.msg_state(id)).collect();
                self.data.send_service(MsgsStateInfo { req_msg_id: msg_id, info }.to_bytes(), 0, now);
                Ok(Handled::Ok)
            }

            MsgsStateInfo::CONSTRUCTOR_ID => {
                let state = MsgsStateInfo::from_bytes(rest)?;
                let sent = self.data.have_sent().read().get(&state.req_msg_id).map(|r| r.body.clone());
                let Some(sent) = sent else {
                    return Ok(skip_if_bad);
                };
                if bad_time && !self.requests_fix_time_salt(&[state.req_msg_id], server_salt, msg_id, now) {
                    return Ok(Handled::Skip);
                }
                self.data.requests_acked(&[state.req_msg_id], true);
                let ids = match sent.get(..4).map(word) {
                    Some(id) if u32::from_le_bytes(id) == MsgsStateReq::CONSTRUCTOR_ID => {
                        MsgsStateReq::from_bytes(&sent[4..])?.msg_ids
                    }
                    Some(id) if u32::from_le_bytes(id) == MsgResendReq::CONSTRUCTOR_ID => {
                        MsgResendReq::from_bytes(&sent[4..])?.msg_ids
                    }
                    _ => return Ok(Handled::Ok),
                };
                if ids.len() != state.info.len() {
                    warn!("[tdmtp] msgs_state_info has {} states for {} ids", state.info.len(), ids.len());
                }
                let acked = self.data.apply_msgs_states(&ids, &state.info, now);
                self.data.requests_acked(&acked, false);
                Ok(Handled::Ok)
            }

            MsgsAllInfo::CONSTRUCTOR_ID => {
                if bad_time {
                    return Ok(Handled::Skip);
                }
                let all = MsgsAllInfo::from_bytes(rest)?;
                let acked = self.data.apply_msgs_states(&all.msg_ids, &all.info, now);
                self.data.requests_acked(&acked, false);
                Ok(Handled::Ok)
            }

            MsgDetailedInfo::CONSTRUCTOR_ID => {
                let detail = MsgDetailedInfo::from_bytes(rest)?;
                if bad_time && !self.requests_fix_time_salt(&[detail.msg_id], server_salt, msg_id, now) {
                    return Ok(Handled::Skip);
                }
                self.data.requests_acked(&[detail.msg_id], true);
                self.check_answer(detail.answer_msg_id);
                Ok(Handled::Ok)
            }

            MsgNewDetailedInfo::CONSTRUCTOR_ID => {
                if bad_time {
                    return Ok(Handled::Skip);
                }
                let detail = MsgNewDetailedInfo::from_bytes(rest)?;
                self.check_answer(detail.answer_msg_id);
                Ok(Handled::Ok)
            }

            MsgResendReq::CONSTRUCTOR_ID => {
                let req = MsgResendReq::from_bytes(rest)?;
                if req.msg_ids.is_empty() {
                    return Ok(skip_if_bad);
                }
                self.data.resend_many(&req.msg_ids, 0, false, true, now);
                Ok(Handled::Ok)
            }

            RpcResult::CONSTRUCTOR_ID => {
                let result = RpcResult::from_bytes(rest)?;
                let req_msg_id = result.req_msg_id;
                if bad_time && !self.requests_fix_time_salt(&[req_msg_id], server_salt, msg_id, now) {
                    return Ok(Handled::Skip);
                }
                self.data.requests_acked(&[req_msg_id], true);

                let mut response = result.result.0;
                if response.get(..4).map(word) == Some(GzipPacked::CONSTRUCTOR_ID.to_le_bytes()) {
                    response = gz_inflate(&GzipPacked::from_bytes(&response[4..])?.packed_data)?;
                }
                self.data.set_layer_inited(true);

                match self.was_sent(req_msg_id) {
                    Some(Sent::Request(request_id)) => {
                        debug!("[tdmtp] rpc_result for request {request_id}");
                        self.data.deliver(request_id, Received::Response(response));
                    }
                    _ => debug!("[tdmtp] rpc_result for unknown msg {req_msg_id}"),
                }
                Ok(Handled::Ok)
            }

            NewSessionCreated::CONSTRUCTOR_ID => {
                let created = NewSessionCreated::from_bytes(rest)?;
                if bad_time && !self.requests_fix_time_salt(&[created.first_msg_id], server_salt, msg_id, now) {
                    return Ok(Handled::Skip);
                }
                info!("[tdmtp] new session created, first msg {}", created.first_msg_id);
                self.data.set_salt(created.server_salt);
                let stale: Vec<i64> = self
                    .data
                    .have_sent()
                    .read()
                    .iter()
                    .filter(|&(&id, r)| r.request_id != 0 && id < created.first_msg_id)
                    .map(|(&id, _)| id)
                    .collect();
                for id in stale {
                    self.data.resend(id, 10, true, now);
                }
                let fake = self.data.next_fake_request_id();
                self.data.deliver(fake, Received::Update(body.to_vec()));
                Ok(Handled::Ok)
            }

            Ping::CONSTRUCTOR_ID => {
                if bad_time {
                    return Ok(Handled::Skip);
                }
                let ping = Ping::from_bytes(rest)?;
                self.data.send_service(Pong { msg_id, ping_id: ping.ping_id }.to_bytes(), 0, now);
                Ok(Handled::Ok)
            }

            Pong::CONSTRUCTOR_ID => {
                let pong = Pong::from_bytes(rest)?;
                let Some(sent) = self.was_sent(pong.msg_id) else {
                    return Ok(Handled::Skip);
                };
                if pong.ping_id == self.ping_id {
                    self.ping_id = 0;
                }
                if bad_time && !self.requests_fix_time_salt(&[pong.msg_id], server_salt, msg_id, now) {
                    return Ok(Handled::Skip);
                }
                self.data.requests_acked(&[pong.msg_id], true);
                if let Sent::Request(request_id) = sent {
                    self.data.deliver(request_id, Received::Response(body.to_vec()));
                }
                Ok(Handled::Ok)
            }

            _ => {
                if bad_time {
                    return Ok(Handled::ResetSession);
                }
                let fake = self.data.next_fake_request_id();
                self.data.deliver(fake, Received::Update(body.to_vec()));
                Ok(Handled::Ok)
            }
        }
    }
}

fn service(body: Vec<u8>, now: u64) -> Request {
    Request { sent_at: now, ..Request::new(body, RequestKind::Service) }
}

fn word(b: &[u8]) -> [u8; 4] { [b[0], b[1], b[2], b[3]] }

fn long(b: &[u8]) -> [u8; 8] { [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]] }

/// Inflate a `gzip_packed` payload. The result must be whole TL words.
fn gz_inflate(data: &[u8]) -> Result<Vec<u8>, Violation> {
    let mut out = Vec::new();
    if flate2::read::GzDecoder::new(data).read_to_end(&mut out).is_err() || out.is_empty() {
        out.clear();
        flate2::read::ZlibDecoder::new(data).read_to_end(&mut out).map_err(|_| Violation::BadGzip)?;
    }
    if out.is_empty() || out.len() % 4 != 0 {
        return Err(Violation::BadGzip);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn gzip_payloads_inflate() {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&[7u8; 64]).unwrap();
        let packed = enc.finish().unwrap();
        assert_eq!(gz_inflate(&packed).unwrap(), vec![7u8; 64]);
        assert_eq!(gz_inflate(&[1, 2, 3]), Err(Violation::BadGzip));
    }

    #[test]
    fn ping_timer_restarts_overdue_ping() {
        let data = Arc::new(SessionData::new().unwrap());
        let mut engine = Engine::new(data, EngineConfig::default());
        assert_eq!(engine.check_ping(0), PingCheck::Send);
        engine.ping_id = 5;
        engine.ping_send_at = 10_000;
        assert_eq!(engine.check_ping(20_000), PingCheck::Rearm(19_000));
        assert_eq!(engine.check_ping(10_000 + 28_001), PingCheck::Restart);
    }

    #[test]
    fn nothing_to_send_without_key() {
        let data = Arc::new(SessionData::new().unwrap());
        let mut engine = Engine::new(data, EngineConfig::default());
        assert_eq!(engine.prepare_frame(1_000), Ok(None));
    }
}
