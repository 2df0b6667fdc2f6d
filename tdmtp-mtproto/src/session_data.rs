//! State shared between a session and the connection that serves it.
//!
//! Every table sits behind its own [`RwLock`]; scalars share one small
//! [`Mutex`]. Methods never hold a lock while calling another method, and
//! when several tables are needed at once they are locked in declaration
//! order:
//!
//! `auth_key → to_send → have_sent → to_resend → were_acked →
//! received_ids → have_received → state_requests → state`
//!
//! All ids are the signed 64-bit values used by the TL schema.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use tdmtp_crypto::AuthKey;
use tdmtp_tl_types::types::MsgsStateInfo;
use tdmtp_tl_types::Serializable;

use crate::constants::{
    CHECK_RESEND_TIMEOUT, CHECK_RESEND_WAITING, CONTAINER_LIVES_SECS, IDS_BUFFER_SIZE,
    RESEND_THRESHOLD,
};
use crate::error::Error;
use crate::message::{msg_id_time, MsgIdGen, SeqNo};
use crate::request::{Request, RequestId, RequestKind};

/// Something waiting to be delivered to the session.
#[derive(Clone, Debug, PartialEq)]
pub enum Received {
    /// The `rpc_result` payload for a call.
    Response(Vec<u8>),
    /// The call will not get an answer.
    Failed(Error),
    /// An unsolicited message, stored under a negative id.
    Update(Vec<u8>),
}

/// Who sent the message a server reply refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sent {
    /// A call or queued service message.
    Request(RequestId),
    /// Engine bookkeeping: the in-flight ping, a container, an ack.
    Service,
}

// ─── Received ids ────────────────────────────────────────────────────────────

/// The last [`IDS_BUFFER_SIZE`] server msg ids and whether each needed an ack.
#[derive(Clone, Debug, Default)]
pub struct ReceivedIds {
    ids: BTreeMap<i64, bool>,
}

impl ReceivedIds {
    /// Record an id. Returns `false` for duplicates and for ids older than
    /// anything still remembered once the buffer is full.
    pub fn insert(&mut self, msg_id: i64, need_ack: bool) -> bool {
        if self.ids.len() >= IDS_BUFFER_SIZE && self.min().is_some_and(|min| msg_id < min) {
            return false;
        }
        if self.ids.contains_key(&msg_id) {
            return false;
        }
        self.ids.insert(msg_id, need_ack);
        true
    }

    pub fn lookup(&self, msg_id: i64) -> Option<bool> { self.ids.get(&msg_id).copied() }

    pub fn min(&self) -> Option<i64> { self.ids.keys().next().copied() }

    pub fn max(&self) -> Option<i64> { self.ids.keys().next_back().copied() }

    /// Drop the oldest ids beyond the buffer size.
    pub fn shrink(&mut self) {
        while self.ids.len() > IDS_BUFFER_SIZE {
            self.ids.pop_first();
        }
    }

    pub fn len(&self) -> usize { self.ids.len() }

    pub fn is_empty(&self) -> bool { self.ids.is_empty() }

    pub fn clear(&mut self) { self.ids.clear() }
}

// ─── Scalars ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct State {
    salt: i64,
    session: i64,
    /// Server time minus local time, seconds.
    time_offset: i32,
    layer_inited: bool,
    key_checked: bool,
    ids: MsgIdGen,
    seq: SeqNo,
    last_request_id: RequestId,
    last_fake_id: RequestId,
    send_wait: Option<u64>,
    session_reset: bool,
}

const FIRST_FAKE_ID: RequestId = -2_000_000_000;

pub(crate) fn random_i64() -> Result<i64, Error> {
    let mut b = [0u8; 8];
    tdmtp_crypto::fill_random(&mut b)?;
    Ok(i64::from_le_bytes(b))
}

// ─── SessionData ─────────────────────────────────────────────────────────────

/// Outstanding requests, received ids and the session scalars.
#[derive(Debug)]
pub struct SessionData {
    auth_key: RwLock<Option<Arc<AuthKey>>>,
    to_send: RwLock<BTreeMap<RequestId, Request>>,
    have_sent: RwLock<BTreeMap<i64, Request>>,
    to_resend: RwLock<BTreeMap<i64, RequestId>>,
    were_acked: RwLock<BTreeMap<i64, RequestId>>,
    received_ids: RwLock<ReceivedIds>,
    have_received: RwLock<BTreeMap<RequestId, Received>>,
    state_requests: RwLock<BTreeSet<i64>>,
    state: Mutex<State>,
}

impl SessionData {
    /// Empty tables and a random session id.
    pub fn new() -> Result<Self, Error> {
        let state = State { session: random_i64()?, ..State::default() };
        Ok(Self {
            auth_key: RwLock::new(None),
            to_send: RwLock::default(),
            have_sent: RwLock::default(),
            to_resend: RwLock::default(),
            were_acked: RwLock::default(),
            received_ids: RwLock::default(),
            have_received: RwLock::default(),
            state_requests: RwLock::default(),
            state: Mutex::new(state),
        })
    }

    // ── Key and scalars ──────────────────────────────────────────────────

    pub fn auth_key(&self) -> Option<Arc<AuthKey>> { self.auth_key.read().clone() }

    /// Read access for the duration of one encryption or decryption.
    pub fn auth_key_guard(&self) -> parking_lot::RwLockReadGuard<'_, Option<Arc<AuthKey>>> {
        self.auth_key.read()
    }

    /// Install a key. A different key starts a new session.
    pub fn set_auth_key(&self, key: Option<Arc<AuthKey>>) -> Result<bool, Error> {
        let mut current = self.auth_key.write();
        let changed = match (&*current, &key) {
            (Some(a), Some(b)) => a.key_id() != b.key_id(),
            (None, None) => false,
            _ => true,
        };
        if changed {
            let session = random_i64()?;
            let mut state = self.state.lock();
            state.session = session;
            state.seq = SeqNo::default();
            state.layer_inited = false;
            state.key_checked = false;
            debug!("[tdmtp] auth key replaced, new session {session}");
        }
        *current = key;
        Ok(changed)
    }

    pub fn salt(&self) -> i64 { self.state.lock().salt }

    pub fn set_salt(&self, salt: i64) { self.state.lock().salt = salt }

    pub fn session(&self) -> i64 { self.state.lock().session }

    pub fn time_offset(&self) -> i32 { self.state.lock().time_offset }

    /// Adopt `server_secs` as the current server time.
    pub fn update_time(&self, server_secs: i64, now: u64) {
        let offset = server_secs - (now / 1000) as i64;
        let offset = offset.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        let mut state = self.state.lock();
        if state.time_offset != offset {
            debug!("[tdmtp] time offset {} -> {offset}", state.time_offset);
            state.time_offset = offset;
        }
    }

    /// Local time corrected by the offset, seconds.
    pub fn server_now_secs(&self, now: u64) -> i64 {
        (now / 1000) as i64 + i64::from(self.time_offset())
    }

    pub fn layer_inited(&self) -> bool { self.state.lock().layer_inited }

    pub fn set_layer_inited(&self, inited: bool) { self.state.lock().layer_inited = inited }

    pub fn key_checked(&self) -> bool { self.state.lock().key_checked }

    pub fn set_key_checked(&self, checked: bool) { self.state.lock().key_checked = checked }

    /// Next outgoing msg id.
    pub fn msgid(&self, now: u64) -> i64 {
        let mut state = self.state.lock();
        let offset = state.time_offset;
        state.ids.next(now, offset)
    }

    pub fn next_seq_no(&self, content: bool) -> i32 { self.state.lock().seq.next(content) }

    /// Ids for calls cycle through `1..=i32::MAX`.
    pub fn next_request_id(&self) -> RequestId {
        let mut state = self.state.lock();
        state.last_request_id = if state.last_request_id >= RequestId::MAX {
            1
        } else {
            state.last_request_id + 1
        };
        state.last_request_id
    }

    /// Negative ids under which updates are delivered.
    pub fn next_fake_request_id(&self) -> RequestId {
        let mut state = self.state.lock();
        state.last_fake_id = if state.last_fake_id == 0 || state.last_fake_id >= -1 {
            FIRST_FAKE_ID
        } else {
            state.last_fake_id + 1
        };
        state.last_fake_id
    }

    /// Ask the connection to send within `ms_can_wait`.
    pub fn request_send(&self, ms_can_wait: u64) {
        let mut state = self.state.lock();
        state.send_wait = Some(state.send_wait.map_or(ms_can_wait, |w| w.min(ms_can_wait)));
    }

    /// The pending send deadline, if anything asked for one.
    pub fn take_send_wait(&self) -> Option<u64> { self.state.lock().send_wait.take() }

    /// Whether the session was reset since the last call.
    pub fn take_session_reset(&self) -> bool {
        std::mem::take(&mut self.state.lock().session_reset)
    }

    // ── Table access for the engine ──────────────────────────────────────

    pub(crate) fn to_send(&self) -> &RwLock<BTreeMap<RequestId, Request>> { &self.to_send }

    pub(crate) fn have_sent(&self) -> &RwLock<BTreeMap<i64, Request>> { &self.have_sent }

    pub(crate) fn to_resend(&self) -> &RwLock<BTreeMap<i64, RequestId>> { &self.to_resend }

    pub(crate) fn were_acked(&self) -> &RwLock<BTreeMap<i64, RequestId>> { &self.were_acked }

    pub(crate) fn received_ids(&self) -> &RwLock<ReceivedIds> { &self.received_ids }

    pub fn to_send_len(&self) -> usize { self.to_send.read().len() }

    pub fn have_sent_len(&self) -> usize { self.have_sent.read().len() }

    pub fn were_acked_len(&self) -> usize { self.were_acked.read().len() }

    /// Ids queued for `msgs_state_req`.
    pub fn add_state_requests(&self, ids: impl IntoIterator<Item = i64>) {
        self.state_requests.write().extend(ids);
    }

    pub fn take_state_requests(&self) -> Vec<i64> {
        std::mem::take(&mut *self.state_requests.write()).into_iter().collect()
    }

    /// Store a response, failure or update for delivery.
    pub fn deliver(&self, request_id: RequestId, payload: Received) {
        self.have_received.write().insert(request_id, payload);
    }

    /// Drain everything waiting for delivery, updates first in arrival order.
    pub fn take_received(&self) -> BTreeMap<RequestId, Received> {
        std::mem::take(&mut *self.have_received.write())
    }

    // ── Session operations ───────────────────────────────────────────────

    /// Queue a request and ask for it to be sent within `ms_can_wait`.
    ///
    /// A request without an id gets the next one. Returns the id.
    pub fn send_prepared(&self, mut request: Request, ms_can_wait: u64, now: u64) -> RequestId {
        request.sent_at = now;
        if request.request_id == 0 {
            request.request_id = self.next_request_id();
        }
        let request_id = request.request_id;
        self.to_send.write().insert(request_id, request);
        self.request_send(ms_can_wait);
        request_id
    }

    /// Queue a message nobody waits on.
    pub fn send_service(&self, body: Vec<u8>, ms_can_wait: u64, now: u64) -> RequestId {
        self.send_prepared(Request::new(body, RequestKind::Service), ms_can_wait, now)
    }

    /// Move a sent message back to the send queue.
    ///
    /// Containers resend their contents; our own state requests are simply
    /// dropped. With `force_container` the message waits for the next
    /// container instead of going out on its own.
    pub fn resend(&self, msg_id: i64, ms_can_wait: u64, force_container: bool, now: u64) {
        self.resend_one(msg_id, ms_can_wait, force_container, false, now);
    }

    /// [`resend`](Self::resend) for each id; with `send_state_info`, ids we
    /// do not know are reported to the server as unknown.
    pub fn resend_many(&self, ids: &[i64], ms_can_wait: u64, force_container: bool, send_state_info: bool, now: u64) {
        for &id in ids {
            self.resend_one(id, ms_can_wait, force_container, send_state_info, now);
        }
    }

    fn resend_one(&self, msg_id: i64, ms_can_wait: u64, force_container: bool, send_state_info: bool, now: u64) {
        let Some(mut request) = self.have_sent.write().remove(&msg_id) else {
            if send_state_info {
                debug!("[tdmtp] resend of unknown msg {msg_id} requested, reporting");
                let info = MsgsStateInfo { req_msg_id: msg_id, info: vec![1] };
                self.send_service(info.to_bytes(), 0, now);
            }
            return;
        };
        match &request.kind {
            RequestKind::Container(inner) => {
                debug!("[tdmtp] resending container {msg_id} with {} messages", inner.len());
                for &id in inner {
                    self.resend_one(id, 10, true, false, now);
                }
            }
            RequestKind::StateRequest => {}
            _ => {
                debug!("[tdmtp] resending msg {msg_id} (request {})", request.request_id);
                request.sent_at = if force_container { 0 } else { now };
                let request_id = request.request_id;
                self.to_send.write().insert(request_id, request);
                self.to_resend.write().insert(msg_id, request_id);
                self.request_send(ms_can_wait);
            }
        }
    }

    /// Resend every request still waiting for an ack, in fresh containers.
    pub fn resend_all(&self, now: u64) {
        let ids: Vec<i64> = self
            .have_sent
            .read()
            .iter()
            .filter(|(_, r)| r.request_id != 0)
            .map(|(&id, _)| id)
            .collect();
        debug!("[tdmtp] resending all {} sent requests", ids.len());
        for id in ids {
            self.resend_one(id, 10, true, false, now);
        }
    }

    /// Periodic sweep of have-sent.
    ///
    /// Small requests unanswered for [`CHECK_RESEND_TIMEOUT`] are resent,
    /// bigger ones get their state queried instead. Containers and state
    /// requests older than [`CONTAINER_LIVES_SECS`] are dropped.
    pub fn check_requests_by_timer(&self, now: u64) {
        let now_secs = self.server_now_secs(now);
        let mut resend = Vec::new();
        let mut query = Vec::new();
        let mut expired = Vec::new();
        {
            let mut have_sent = self.have_sent.write();
            for (&id, request) in have_sent.iter_mut() {
                if request.sent_at > 0 {
                    if request.sent_at + CHECK_RESEND_TIMEOUT < now {
                        if request.body.len() < RESEND_THRESHOLD {
                            resend.push(id);
                        } else {
                            request.sent_at = now;
                            query.push(id);
                        }
                    }
                } else if msg_id_time(id) + CONTAINER_LIVES_SECS < now_secs {
                    expired.push(id);
                }
            }
            for id in &expired {
                if let Some(request) = have_sent.remove(id) {
                    if request.awaits_response() {
                        self.have_received.write().insert(request.request_id, Received::Failed(Error::Timeout));
                    }
                }
            }
        }
        if !expired.is_empty() {
            debug!("[tdmtp] dropped {} expired containers", expired.len());
        }
        if !query.is_empty() {
            self.add_state_requests(query);
            self.request_send(CHECK_RESEND_WAITING);
        }
        for id in resend {
            self.resend(id, CHECK_RESEND_WAITING, false, now);
        }
    }

    /// Forget a request, sent or not.
    pub fn cancel(&self, request_id: RequestId, msg_id: i64) {
        self.to_send.write().remove(&request_id);
        if msg_id != 0 {
            self.have_sent.write().remove(&msg_id);
            self.to_resend.write().remove(&msg_id);
            self.were_acked.write().remove(&msg_id);
        }
    }

    /// Forget a call by id alone, looking up the message it went out in.
    pub fn cancel_request(&self, request_id: RequestId) {
        let msg_id = self
            .have_sent
            .read()
            .iter()
            .find(|&(_, r)| r.request_id == request_id)
            .map_or(0, |(&id, _)| id);
        self.cancel(request_id, msg_id);
        self.have_received.write().remove(&request_id);
    }

    /// Drop all outstanding requests, failing each call with `error`.
    pub fn clear(&self, error: Error) {
        let mut failed = BTreeSet::new();
        {
            let mut to_send = self.to_send.write();
            let mut have_sent = self.have_sent.write();
            let mut to_resend = self.to_resend.write();
            let mut were_acked = self.were_acked.write();
            failed.extend(to_send.values().filter(|r| r.awaits_response()).map(|r| r.request_id));
            failed.extend(have_sent.values().filter(|r| r.awaits_response()).map(|r| r.request_id));
            failed.extend(to_resend.values().copied());
            failed.extend(were_acked.values().copied());
            to_send.clear();
            have_sent.clear();
            to_resend.clear();
            were_acked.clear();
        }
        self.received_ids.write().clear();
        {
            let mut have_received = self.have_received.write();
            for id in failed.into_iter().filter(|&id| id > 0) {
                have_received.insert(id, Received::Failed(error.clone()));
            }
        }
        self.state_requests.write().clear();
    }

    /// Who sent `msg_id`, if it was us.
    pub fn was_sent(&self, msg_id: i64) -> Option<Sent> {
        if let Some(request) = self.have_sent.read().get(&msg_id) {
            return Some(match request.request_id {
                0 => Sent::Service,
                id => Sent::Request(id),
            });
        }
        if let Some(&id) = self.to_resend.read().get(&msg_id) {
            return Some(Sent::Request(id));
        }
        self.were_acked.read().get(&msg_id).map(|&id| Sent::Request(id))
    }

    /// The server has our messages `ids`.
    ///
    /// Calls stay in have-sent until answered unless `by_response`; service
    /// messages move to were-acked right away. Acking a container acks its
    /// contents. Were-acked keeps the newest [`IDS_BUFFER_SIZE`] entries;
    /// older calls fail with [`Error::Timeout`].
    pub fn requests_acked(&self, ids: &[i64], by_response: bool) {
        let mut evicted = Vec::new();
        {
            let mut to_send = self.to_send.write();
            let mut have_sent = self.have_sent.write();
            let mut to_resend = self.to_resend.write();
            let mut were_acked = self.were_acked.write();

            let mut pending: Vec<i64> = ids.iter().rev().copied().collect();
            while let Some(id) = pending.pop() {
                if let Some(request) = have_sent.get(&id) {
                    if let RequestKind::Container(inner) = &request.kind {
                        pending.extend(inner.iter().rev());
                        have_sent.remove(&id);
                    } else if by_response || !request.awaits_response() {
                        let request_id = request.request_id;
                        have_sent.remove(&id);
                        were_acked.insert(id, request_id);
                    } else {
                        debug!("[tdmtp] ignoring ack for {id}, request {} needs a response", request.request_id);
                    }
                } else if let Some(&request_id) = to_resend.get(&id) {
                    let moves = by_response
                        || to_send.get(&request_id).is_none_or(|r| !r.awaits_response());
                    if moves {
                        to_send.remove(&request_id);
                        to_resend.remove(&id);
                        were_acked.insert(id, request_id);
                    }
                }
            }

            while were_acked.len() > IDS_BUFFER_SIZE {
                if let Some((id, request_id)) = were_acked.pop_first() {
                    evicted.push((id, request_id));
                }
            }
        }
        if !evicted.is_empty() {
            warn!("[tdmtp] were-acked overflow, evicting {} entries", evicted.len());
            let mut have_received = self.have_received.write();
            for (_, request_id) in evicted.into_iter().filter(|&(_, r)| r > 0) {
                have_received.entry(request_id).or_insert(Received::Failed(Error::Timeout));
            }
        }
    }

    /// Apply the server's view of our messages (`msgs_state_info`,
    /// `msgs_all_info`). Returns the ids the server has received; ids it
    /// lost are resent.
    pub fn apply_msgs_states(&self, ids: &[i64], states: &[u8], now: u64) -> Vec<i64> {
        let mut acked = Vec::new();
        let mut resend = Vec::new();
        {
            let have_sent = self.have_sent.read();
            let to_resend = self.to_resend.read();
            for (&id, &state) in ids.iter().zip(states) {
                let received = state & 7 == 4;
                if have_sent.contains_key(&id) {
                    if received {
                        acked.push(id);
                    } else {
                        resend.push(id);
                    }
                } else if to_resend.contains_key(&id) && received {
                    acked.push(id);
                }
            }
        }
        for id in resend {
            self.resend(id, 10, true, now);
        }
        acked
    }

    /// One state byte for a server msg id, as reported in `msgs_state_info`.
    pub fn msg_state(&self, msg_id: i64) -> u8 {
        let answered = self.were_acked.read().contains_key(&msg_id);
        let received = self.received_ids.read();
        match (received.min(), received.max()) {
            (Some(min), _) if msg_id < min => 0x01,
            (_, Some(max)) if msg_id > max => 0x03,
            (None, None) => 0x03,
            _ => match received.lookup(msg_id) {
                None => 0x02,
                Some(need_ack) => {
                    let mut state = 0x04;
                    if answered {
                        state |= 0x80;
                    }
                    state | if need_ack { 0x08 } else { 0x10 }
                }
            },
        }
    }

    /// Move a request that already carried an id to `limit`, or to a newer
    /// id if `limit` is taken in have-sent, to-resend or were-acked. Table
    /// entries and container lists follow the request to its new id.
    pub fn replace_msg_id(&self, request: &mut Request, limit: i64, now: u64) -> i64 {
        let old = request.msg_id;
        if old == 0 {
            request.msg_id = limit;
            return limit;
        }
        let mut have_sent = self.have_sent.write();
        let mut to_resend = self.to_resend.write();
        let mut were_acked = self.were_acked.write();
        let mut new_id = limit;
        while have_sent.contains_key(&new_id)
            || to_resend.contains_key(&new_id)
            || were_acked.contains_key(&new_id)
        {
            new_id = self.msgid(now);
        }
        debug!("[tdmtp] replacing msg id {old} with {new_id}");
        if let Some(request_id) = to_resend.remove(&old) {
            to_resend.insert(new_id, request_id);
        }
        if let Some(request_id) = were_acked.remove(&old) {
            were_acked.insert(new_id, request_id);
        }
        if let Some(mut sent) = have_sent.remove(&old) {
            sent.msg_id = new_id;
            have_sent.insert(new_id, sent);
        }
        for sent in have_sent.values_mut() {
            if let RequestKind::Container(inner) = &mut sent.kind {
                inner.iter_mut().filter(|id| **id == old).for_each(|id| *id = new_id);
            }
        }
        request.msg_id = new_id;
        new_id
    }

    /// Start a new session on the same key.
    ///
    /// Sent ids newer than a fresh msg id are replaced, seq numbers are
    /// reassigned in id order (keeping their ack bit), and the state queue
    /// is cleared. The engine drops its own pending acks and resend requests.
    pub fn reset_session(&self, now: u64) -> Result<(), Error> {
        let session = random_i64()?;
        let new_id = self.msgid(now);

        let mut to_send = self.to_send.write();
        let mut have_sent = self.have_sent.write();
        let mut to_resend = self.to_resend.write();
        let mut were_acked = self.were_acked.write();
        let mut state = self.state.lock();

        let mut used: BTreeSet<i64> = have_sent.keys().chain(to_resend.keys()).chain(were_acked.keys()).copied().collect();
        let offset = state.time_offset;
        let fresh = |state: &mut State, used: &mut BTreeSet<i64>| loop {
            let id = state.ids.next(now, offset);
            if used.insert(id) {
                break id;
            }
        };

        let mut replaced = BTreeMap::new();
        for (&id, request) in have_sent.iter() {
            if !request.is_container() && id > new_id {
                replaced.insert(id, fresh(&mut *state, &mut used));
            }
        }
        for (&id, request_id) in to_resend.iter() {
            if id > new_id && to_send.get(request_id).is_some_and(|r| r.msg_id == id) {
                replaced.insert(id, fresh(&mut *state, &mut used));
            }
        }

        for (&old, &new) in &replaced {
            if let Some(mut request) = have_sent.remove(&old) {
                request.msg_id = new;
                have_sent.insert(new, request);
            }
            if let Some(request_id) = to_resend.remove(&old) {
                to_resend.insert(new, request_id);
                if let Some(request) = to_send.get_mut(&request_id) {
                    request.msg_id = new;
                }
            }
            if let Some(request_id) = were_acked.remove(&old) {
                were_acked.insert(new, request_id);
            }
        }

        // Renumber everything that carries an id, oldest first.
        let mut seq = SeqNo::default();
        let mut order: Vec<(i64, bool)> = have_sent
            .values()
            .filter(|r| !r.is_container())
            .chain(to_send.values())
            .filter(|r| r.msg_id != 0)
            .map(|r| (r.msg_id, r.seq_no & 1 == 1))
            .collect();
        order.sort_unstable();
        let seq_nos: BTreeMap<i64, i32> = order.into_iter().map(|(id, ack)| (id, seq.next(ack))).collect();
        for request in have_sent.values_mut().chain(to_send.values_mut()) {
            if let RequestKind::Container(inner) = &mut request.kind {
                inner.iter_mut().for_each(|id| *id = replaced.get(id).copied().unwrap_or(*id));
            } else if let Some(&seq_no) = seq_nos.get(&request.msg_id) {
                request.seq_no = seq_no;
            }
        }

        warn!("[tdmtp] session reset: {} -> {session}, {} ids replaced", state.session, replaced.len());
        state.session = session;
        state.seq = seq;
        state.layer_inited = false;
        state.session_reset = true;
        drop(state);
        drop(were_acked);
        drop(to_resend);
        drop(have_sent);
        drop(to_send);

        self.state_requests.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> SessionData { SessionData::new().unwrap() }

    fn sent(data: &SessionData, body: Vec<u8>, now: u64) -> (RequestId, i64) {
        let request_id = data.next_request_id();
        let msg_id = data.msgid(now);
        let mut request = Request::call(body);
        request.request_id = request_id;
        request.msg_id = msg_id;
        request.seq_no = data.next_seq_no(true);
        request.sent_at = now;
        data.have_sent().write().insert(msg_id, request);
        (request_id, msg_id)
    }

    #[test]
    fn request_ids_wrap_to_one() {
        let data = data();
        data.state.lock().last_request_id = RequestId::MAX;
        assert_eq!(data.next_request_id(), 1);
        assert_eq!(data.next_fake_request_id(), FIRST_FAKE_ID);
        assert_eq!(data.next_fake_request_id(), FIRST_FAKE_ID + 1);
    }

    #[test]
    fn received_ids_reject_duplicates_and_stale() {
        let mut ids = ReceivedIds::default();
        assert!(ids.insert(5, true));
        assert!(!ids.insert(5, false));
        for i in 0..IDS_BUFFER_SIZE as i64 {
            ids.insert(100 + i * 4, false);
        }
        ids.shrink();
        assert_eq!(ids.len(), IDS_BUFFER_SIZE);
        assert!(!ids.insert(1, true));
        assert_eq!(ids.min(), Some(100));
    }

    #[test]
    fn ack_keeps_calls_until_answered() {
        let data = data();
        let (request_id, msg_id) = sent(&data, vec![0; 8], 1_000_000);
        data.requests_acked(&[msg_id], false);
        assert_eq!(data.was_sent(msg_id), Some(Sent::Request(request_id)));
        assert_eq!(data.have_sent_len(), 1);
        data.requests_acked(&[msg_id], true);
        assert_eq!(data.have_sent_len(), 0);
        assert_eq!(data.were_acked_len(), 1);
        assert_eq!(data.was_sent(msg_id), Some(Sent::Request(request_id)));
    }

    #[test]
    fn container_ack_acks_contents() {
        let data = data();
        let (_, a) = sent(&data, vec![0; 8], 1_000_000);
        let (_, b) = sent(&data, vec![0; 8], 1_000_000);
        let container_id = data.msgid(1_000_000);
        let container = Request::new(Vec::new(), RequestKind::Container(vec![a, b]));
        data.have_sent().write().insert(container_id, Request { msg_id: container_id, ..container });
        data.requests_acked(&[container_id], true);
        assert_eq!(data.have_sent_len(), 0);
        assert_eq!(data.were_acked_len(), 2);
    }

    #[test]
    fn were_acked_eviction_fails_oldest() {
        let data = data();
        let mut first = None;
        for _ in 0..=IDS_BUFFER_SIZE {
            let (request_id, msg_id) = sent(&data, vec![0; 8], 1_000_000);
            first.get_or_insert(request_id);
            data.requests_acked(&[msg_id], true);
        }
        assert_eq!(data.were_acked_len(), IDS_BUFFER_SIZE);
        let received = data.take_received();
        assert_eq!(received.len(), 1);
        assert_eq!(received.get(&first.unwrap()), Some(&Received::Failed(Error::Timeout)));
    }

    #[test]
    fn resend_moves_back_to_queue() {
        let data = data();
        let (request_id, msg_id) = sent(&data, vec![0; 8], 1_000_000);
        data.resend(msg_id, 0, true, 1_000_500);
        assert_eq!(data.have_sent_len(), 0);
        assert_eq!(data.to_send_len(), 1);
        assert_eq!(data.was_sent(msg_id), Some(Sent::Request(request_id)));
        assert_eq!(data.to_send().read()[&request_id].sent_at, 0);
        assert_eq!(data.take_send_wait(), Some(0));
    }

    #[test]
    fn unknown_resend_reports_state() {
        let data = data();
        data.resend_many(&[12345], 0, false, true, 1_000_000);
        let queue = data.to_send().read();
        let (_, request) = queue.iter().next().unwrap();
        assert_eq!(request.constructor(), 0x04deb57d);
        assert_eq!(request.kind, RequestKind::Service);
    }

    #[test]
    fn timer_resends_small_and_queries_big() {
        let data = data();
        let (_, small) = sent(&data, vec![0; 8], 1_000_000);
        let (_, big) = sent(&data, vec![0; RESEND_THRESHOLD], 1_000_000);
        data.check_requests_by_timer(1_000_000 + CHECK_RESEND_TIMEOUT + 1);
        assert!(data.have_sent().read().get(&small).is_none());
        assert!(data.have_sent().read().contains_key(&big));
        assert_eq!(data.take_state_requests(), vec![big]);
    }

    #[test]
    fn timer_drops_old_containers() {
        let data = data();
        let id = data.msgid(1_000_000);
        data.have_sent().write().insert(id, Request { msg_id: id, ..Request::new(Vec::new(), RequestKind::Container(vec![])) });
        data.check_requests_by_timer(1_000_000 + (CONTAINER_LIVES_SECS as u64 + 2) * 1000);
        assert_eq!(data.have_sent_len(), 0);
    }

    #[test]
    fn msg_state_bytes() {
        let data = data();
        {
            let mut ids = data.received_ids().write();
            ids.insert(100, true);
            ids.insert(200, false);
        }
        assert_eq!(data.msg_state(50), 0x01);
        assert_eq!(data.msg_state(300), 0x03);
        assert_eq!(data.msg_state(150), 0x02);
        assert_eq!(data.msg_state(100), 0x0c);
        assert_eq!(data.msg_state(200), 0x14);
    }

    #[test]
    fn reset_session_renumbers() {
        let data = data();
        let before = data.session();
        let (_, a) = sent(&data, vec![0; 8], 1_000_000);
        let (_, b) = sent(&data, vec![0; 8], 1_000_000);
        data.add_state_requests([a]);
        data.reset_session(1_000_000).unwrap();
        assert_ne!(data.session(), before);
        assert!(data.take_session_reset());
        assert!(data.take_state_requests().is_empty());
        let have_sent = data.have_sent().read();
        let seqs: Vec<i32> = have_sent.values().map(|r| r.seq_no).collect();
        assert_eq!(seqs, vec![1, 3]);
        assert!(have_sent.contains_key(&a) && have_sent.contains_key(&b));
    }

    #[test]
    fn replace_moves_pending_resend() {
        let data = data();
        let (request_id, old) = sent(&data, vec![0; 8], 1_000_000);
        data.resend(old, 0, false, 1_000_000);
        let mut request = data.to_send().write().remove(&request_id).unwrap();
        let limit = data.msgid(1_000_000);
        assert_eq!(data.replace_msg_id(&mut request, limit, 1_000_000), limit);
        assert_eq!(request.msg_id, limit);
        assert_eq!(data.was_sent(old), None);
        assert_eq!(data.was_sent(limit), Some(Sent::Request(request_id)));
    }

    #[test]
    fn clear_fails_everything() {
        let data = data();
        let (request_id, _) = sent(&data, vec![0; 8], 1_000_000);
        let queued = data.send_prepared(Request::call(vec![0; 4]), 0, 1_000_000);
        data.clear(Error::Transport("logout".into()));
        let received = data.take_received();
        assert_eq!(received.len(), 2);
        assert!(matches!(received.get(&request_id), Some(Received::Failed(_))));
        assert!(matches!(received.get(&queued), Some(Received::Failed(_))));
        assert_eq!(data.have_sent_len() + data.to_send_len(), 0);
    }
}
