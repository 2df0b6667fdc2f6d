//! Sans-IO MTProto authorization key generation.
//!
//! # Flow
//!
//! ```text
//! let mut hs = Handshake::new(HandshakeContext::default());
//! let mut frame = hs.start(now)?;
//! loop {
//!     // send frame, receive reply
//!     match hs.handle(&reply, now)? {
//!         Step::Send(next) => frame = next,
//!         Step::Done(finished) => break, // finished.auth_key is ready
//!     }
//! }
//! ```
//!
//! The free functions `step1` .. `finish` are the individual transitions
//! and work on bare TL objects; [`Handshake`] wraps them in the plaintext
//! envelope and keeps the state between round trips.

use std::fmt;

use log::{debug, info, warn};
use num_bigint::BigUint;
use tdmtp_crypto::{aes, factorize, fill_random, generate_key_data_from_nonce, prime, rsa, sha1, AuthKey, CryptoError};
use tdmtp_tl_types::{enums, functions, types, Cursor, Deserializable, Serializable};

use crate::constants::MAX_DH_ATTEMPTS;
use crate::error::Violation;
use crate::message::{Message, MsgIdGen};

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors that can occur during auth key generation.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    InvalidNonce         { got: [u8; 16], expected: [u8; 16] },
    InvalidPqSize        { size: usize },
    UnknownFingerprints  { fingerprints: Vec<i64> },
    DhParamsFail,
    InvalidServerNonce   { got: [u8; 16], expected: [u8; 16] },
    EncryptedResponseNotPadded { len: usize },
    InvalidDhInnerData   { error: tdmtp_tl_types::deserialize::Error },
    InvalidDhPrime       { g: i32 },
    GParameterOutOfRange { which: &'static str },
    DhGenFail,
    TooManyRetries       { attempts: u32 },
    InvalidAnswerHash    { got: [u8; 20], expected: [u8; 20] },
    InvalidNewNonceHash  { got: [u8; 16], expected: [u8; 16] },
    /// A reply arrived while no request was outstanding.
    UnexpectedReply,
    Envelope(Violation),
    Decode(tdmtp_tl_types::deserialize::Error),
    Crypto(CryptoError),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNonce { got, expected }
                => write!(f, "nonce mismatch: got {got:?}, expected {expected:?}"),
            Self::InvalidPqSize { size }
                => write!(f, "pq size {size} invalid (expected at most 8)"),
            Self::UnknownFingerprints { fingerprints }
                => write!(f, "no known fingerprint in {fingerprints:?}"),
            Self::DhParamsFail
                => write!(f, "server returned DH params failure"),
            Self::InvalidServerNonce { got, expected }
                => write!(f, "server_nonce mismatch: got {got:?}, expected {expected:?}"),
            Self::EncryptedResponseNotPadded { len }
                => write!(f, "encrypted answer len {len} is not 16-byte aligned"),
            Self::InvalidDhInnerData { error }
                => write!(f, "DH inner data deserialization error: {error}"),
            Self::InvalidDhPrime { g }
                => write!(f, "dh_prime rejected for g={g}"),
            Self::GParameterOutOfRange { which }
                => write!(f, "{which} outside the safe DH range"),
            Self::DhGenFail   => write!(f, "DH gen failed"),
            Self::TooManyRetries { attempts }
                => write!(f, "DH gen retry requested {attempts} times"),
            Self::InvalidAnswerHash { got, expected }
                => write!(f, "answer hash mismatch: got {got:?}, expected {expected:?}"),
            Self::InvalidNewNonceHash { got, expected }
                => write!(f, "new nonce hash mismatch: got {got:?}, expected {expected:?}"),
            Self::UnexpectedReply => write!(f, "reply without a pending request"),
            Self::Envelope(v) => write!(f, "bad plaintext envelope: {v}"),
            Self::Decode(e) => write!(f, "undecodable reply: {e}"),
            Self::Crypto(e) => write!(f, "crypto: {e}"),
        }
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self { Self::Crypto(e) }
}

impl From<Violation> for Error {
    fn from(v: Violation) -> Self { Self::Envelope(v) }
}

impl From<tdmtp_tl_types::deserialize::Error> for Error {
    fn from(e: tdmtp_tl_types::deserialize::Error) -> Self { Self::Decode(e) }
}

// ─── Trusted keys ────────────────────────────────────────────────────────────

const BUILTIN_PEM: &str = "-----BEGIN RSA PUBLIC KEY-----
MIIBCgKCAQEAwVACPi9w23mF3tBkdZz+zwrzKOaaQdr01vAbU4E1pvkfj4sqDsm6
lyDONS789sVoD/xCS9Y0hkkC3gtL1tSfTlgCMOOul9lcixlEKzwKENj1Yz/s7daS
an9tqw3bfUV/nqgbhGX81v/+7RFAEd+RwFnK7a+XYl9sluzHRyVVaTTveB2GazTw
Efzk2DWgkBluml8OREmvfraX3bkHZJTKX4EQSjBbbdJ2ZXIsRrYOXfaA+xayEGB+
8hdlLmAjbCVfaigxX0CDqWeR1yFL9kwd9P0NsZRPsmoqVwMbMu7mStFai6aIhc3n
Slv8kg9qv1m6XHVQY3PnEw+QQtqSIXklHwIDAQAB
-----END RSA PUBLIC KEY-----";

// fingerprint -3414540481677951611
const BUILTIN_N: &str = "29379598170669337022986177149456128565388431120058863768162556424047512191330847455146576344487764408661701890505066208632169112269581063774293102577308490531282748465986139880977280302242772832972539403531316010870401287642763009136156734339538042419388722777357134487746169093539093850251243897188928735903389451772730245253062963384108812842079887538976360465290946139638691491496062099570836476454855996319192747663615955633778034897140982517446405334423701359108810182097749467210509584293428076654573384828809574217079944388301239431309115013843331317877374435868468779972014486325557807783825502498215169806323";

/// The RSA keys the client trusts, looked up by fingerprint.
#[derive(Clone, Debug)]
pub struct HandshakeContext {
    keys: Vec<(i64, rsa::Key)>,
}

impl HandshakeContext {
    /// Trust exactly `keys`.
    pub fn new(keys: impl IntoIterator<Item = rsa::Key>) -> Self {
        Self { keys: keys.into_iter().map(|k| (k.fingerprint(), k)).collect() }
    }

    /// Add a key from a PKCS#1 PEM block.
    pub fn with_pem(mut self, pem: &str) -> Result<Self, CryptoError> {
        let key = rsa::Key::from_pem(pem)?;
        self.keys.push((key.fingerprint(), key));
        Ok(self)
    }

    pub fn fingerprints(&self) -> impl Iterator<Item = i64> + '_ {
        self.keys.iter().map(|(fp, _)| *fp)
    }

    /// RSA key by server fingerprint.
    pub fn key_for_fingerprint(&self, fp: i64) -> Option<&rsa::Key> {
        self.keys.iter().find(|(k, _)| *k == fp).map(|(_, key)| key)
    }
}

impl Default for HandshakeContext {
    /// The production keys.
    fn default() -> Self {
        let keys = rsa::Key::from_pem(BUILTIN_PEM)
            .ok()
            .into_iter()
            .chain(rsa::Key::new(BUILTIN_N, "65537"));
        Self::new(keys)
    }
}

// ─── Step state ──────────────────────────────────────────────────────────────

/// State after step 1.
#[derive(Clone, Debug)]
pub struct Step1 { nonce: [u8; 16] }

/// State after step 2.
#[derive(Clone, Debug)]
pub struct Step2 {
    nonce:        [u8; 16],
    server_nonce: [u8; 16],
    new_nonce:    [u8; 32],
}

/// Validated server DH parameters, kept for `dh_gen_retry`.
#[derive(Clone, Debug)]
struct ServerDh {
    g:        BigUint,
    dh_prime: BigUint,
    g_a:      BigUint,
    key:      [u8; 32],
    iv:       [u8; 32],
}

/// State after step 3.
#[derive(Clone, Debug)]
pub struct Step3 {
    nonce:        [u8; 16],
    server_nonce: [u8; 16],
    new_nonce:    [u8; 32],
    server:       ServerDh,
    auth_key:     AuthKey,
    time_offset:  i32,
    attempt:      u32,
}

/// The final output of a successful auth key handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct Finished {
    /// The 256-byte authorization key.
    pub auth_key:    [u8; 256],
    /// Clock skew in seconds relative to the server.
    pub time_offset: i32,
    /// Initial server salt.
    pub first_salt:  i64,
}

/// Result of the last round trip.
#[derive(Debug)]
pub enum DhGen {
    Ok(Finished),
    /// Send `set_client_DH_params` again with a fresh `b`.
    Retry(Step3),
}

// ─── Step 1: req_pq ──────────────────────────────────────────────────────────

/// Generate a `req_pq` request. Returns the request + opaque state.
pub fn step1() -> Result<(functions::ReqPq, Step1), Error> {
    let mut buf = [0u8; 16];
    fill_random(&mut buf)?;
    Ok(do_step1(&buf))
}

fn do_step1(random: &[u8; 16]) -> (functions::ReqPq, Step1) {
    let nonce = *random;
    (functions::ReqPq { nonce }, Step1 { nonce })
}

// ─── Step 2: req_DH_params ───────────────────────────────────────────────────

/// Process `ResPQ` and generate `req_DH_params`.
pub fn step2(
    ctx:      &HandshakeContext,
    data:     Step1,
    response: enums::ResPq,
) -> Result<(functions::ReqDhParams, Step2), Error> {
    let mut rnd = [0u8; 32 + 255];
    fill_random(&mut rnd)?;
    do_step2(ctx, data, response, &rnd)
}

fn do_step2(
    ctx:      &HandshakeContext,
    data:     Step1,
    response: enums::ResPq,
    random:   &[u8; 32 + 255],
) -> Result<(functions::ReqDhParams, Step2), Error> {
    let Step1 { nonce } = data;
    let enums::ResPq::ResPq(res_pq) = response;

    check_nonce(&res_pq.nonce, &nonce)?;

    let fingerprint = res_pq.server_public_key_fingerprints
        .iter()
        .copied()
        .find(|&fp| ctx.key_for_fingerprint(fp).is_some())
        .ok_or_else(|| Error::UnknownFingerprints {
            fingerprints: res_pq.server_public_key_fingerprints.clone()
        })?;
    let key = ctx.key_for_fingerprint(fingerprint).ok_or(Error::UnknownFingerprints {
        fingerprints: vec![fingerprint],
    })?;

    if res_pq.pq.is_empty() || res_pq.pq.len() > 8 {
        return Err(Error::InvalidPqSize { size: res_pq.pq.len() });
    }
    let pq = res_pq.pq.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    let (p, q) = factorize(pq)?;
    debug!("[tdmtp] pq {pq} = {p} * {q}");

    let mut new_nonce = [0u8; 32];
    new_nonce.copy_from_slice(&random[..32]);
    let mut padding = [0u8; 255];
    padding.copy_from_slice(&random[32..]);

    let p_bytes = trim_be(p);
    let q_bytes = trim_be(q);

    let pq_inner = types::PQInnerData {
        pq: res_pq.pq.clone(),
        p: p_bytes.clone(),
        q: q_bytes.clone(),
        nonce,
        server_nonce: res_pq.server_nonce,
        new_nonce,
    }
    .to_bytes();

    let ciphertext = rsa::encrypt_padded(&pq_inner, key, &padding)?;

    Ok((
        functions::ReqDhParams {
            nonce,
            server_nonce: res_pq.server_nonce,
            p: p_bytes,
            q: q_bytes,
            public_key_fingerprint: fingerprint,
            encrypted_data: ciphertext,
        },
        Step2 { nonce, server_nonce: res_pq.server_nonce, new_nonce },
    ))
}

fn trim_be(v: u64) -> Vec<u8> {
    let b = v.to_be_bytes();
    let skip = b.iter().position(|&x| x != 0).unwrap_or(7);
    b[skip..].to_vec()
}

// ─── Step 3: set_client_DH_params ────────────────────────────────────────────

/// Process `ServerDhParams` and generate `set_client_DH_params`.
///
/// `now` is local Unix time in seconds.
pub fn step3(
    data:     Step2,
    response: enums::ServerDhParams,
    now:      i32,
) -> Result<(functions::SetClientDhParams, Step3), Error> {
    let mut rnd = [0u8; 256 + 16];
    fill_random(&mut rnd)?;
    do_step3(data, response, &rnd, now)
}

fn do_step3(
    data:     Step2,
    response: enums::ServerDhParams,
    random:   &[u8; 256 + 16],
    now:      i32,
) -> Result<(functions::SetClientDhParams, Step3), Error> {
    let Step2 { nonce, server_nonce, new_nonce } = data;

    let mut server_dh_ok = match response {
        enums::ServerDhParams::Fail(f) => {
            check_nonce(&f.nonce, &nonce)?;
            check_server_nonce(&f.server_nonce, &server_nonce)?;
            let digest = sha1!(&new_nonce);
            let mut expected_hash = [0u8; 16];
            expected_hash.copy_from_slice(&digest[4..]);
            check_new_nonce_hash(&f.new_nonce_hash, &expected_hash)?;
            return Err(Error::DhParamsFail);
        }
        enums::ServerDhParams::Ok(x) => x,
    };

    check_nonce(&server_dh_ok.nonce, &nonce)?;
    check_server_nonce(&server_dh_ok.server_nonce, &server_nonce)?;

    let len = server_dh_ok.encrypted_answer.len();
    if len % 16 != 0 || len < 24 {
        return Err(Error::EncryptedResponseNotPadded { len });
    }

    let (key, iv) = generate_key_data_from_nonce(&server_nonce, &new_nonce);
    aes::ige_decrypt(&mut server_dh_ok.encrypted_answer, &key, &iv)?;
    let plain = server_dh_ok.encrypted_answer;

    let mut got_hash = [0u8; 20];
    got_hash.copy_from_slice(&plain[..20]);
    let mut cursor = Cursor::from_slice(&plain[20..]);

    let enums::ServerDhInnerData::ServerDhInnerData(inner) =
        enums::ServerDhInnerData::deserialize(&mut cursor)
            .map_err(|error| Error::InvalidDhInnerData { error })?;

    let expected_hash = sha1!(&plain[20..20 + cursor.pos()]);
    if got_hash != expected_hash {
        return Err(Error::InvalidAnswerHash { got: got_hash, expected: expected_hash });
    }

    check_nonce(&inner.nonce, &nonce)?;
    check_server_nonce(&inner.server_nonce, &server_nonce)?;

    if inner.dh_prime.len() != 256 || inner.g_a.len() != 256 || !prime::is_good_prime(&inner.dh_prime, inner.g) {
        return Err(Error::InvalidDhPrime { g: inner.g });
    }
    let server = ServerDh {
        g: BigUint::from(inner.g.unsigned_abs()),
        dh_prime: BigUint::from_bytes_be(&inner.dh_prime),
        g_a: BigUint::from_bytes_be(&inner.g_a),
        key,
        iv,
    };
    if !prime::check_dh_range(&server.g_a, &server.dh_prime) {
        return Err(Error::GParameterOutOfRange { which: "g_a" });
    }
    let time_offset = inner.server_time.wrapping_sub(now);

    client_dh(nonce, server_nonce, new_nonce, server, time_offset, 1, 0, random)
}

/// Pick `b` and build `set_client_DH_params` for `server`.
#[allow(clippy::too_many_arguments)]
fn client_dh(
    nonce:        [u8; 16],
    server_nonce: [u8; 16],
    new_nonce:    [u8; 32],
    server:       ServerDh,
    time_offset:  i32,
    attempt:      u32,
    retry_id:     i64,
    random:       &[u8; 256 + 16],
) -> Result<(functions::SetClientDhParams, Step3), Error> {
    let b = BigUint::from_bytes_be(&random[..256]);
    let g_b = server.g.modpow(&b, &server.dh_prime);
    if !prime::check_dh_range(&g_b, &server.dh_prime) {
        return Err(Error::GParameterOutOfRange { which: "g_b" });
    }
    let gab = server.g_a.modpow(&b, &server.dh_prime);

    let client_dh_inner = types::ClientDhInnerData {
        nonce,
        server_nonce,
        retry_id,
        g_b: g_b.to_bytes_be(),
    }
    .to_bytes();

    let digest = sha1!(&client_dh_inner);
    let pad_len = (16 - ((20 + client_dh_inner.len()) % 16)) % 16;

    let mut hashed = Vec::with_capacity(20 + client_dh_inner.len() + pad_len);
    hashed.extend_from_slice(&digest);
    hashed.extend_from_slice(&client_dh_inner);
    hashed.extend_from_slice(&random[256..256 + pad_len]);

    aes::ige_encrypt(&mut hashed, &server.key, &server.iv)?;

    let mut key_bytes = [0u8; 256];
    let gab_bytes = gab.to_bytes_be();
    key_bytes[256 - gab_bytes.len()..].copy_from_slice(&gab_bytes);

    Ok((
        functions::SetClientDhParams {
            nonce,
            server_nonce,
            encrypted_data: hashed,
        },
        Step3 {
            nonce,
            server_nonce,
            new_nonce,
            server,
            auth_key: AuthKey::from_bytes(key_bytes),
            time_offset,
            attempt,
        },
    ))
}

/// Answer `dh_gen_retry` with a fresh `b` and `retry_id = aux_hash`.
pub fn retry(data: Step3) -> Result<(functions::SetClientDhParams, Step3), Error> {
    let mut rnd = [0u8; 256 + 16];
    fill_random(&mut rnd)?;
    do_retry(data, &rnd)
}

fn do_retry(data: Step3, random: &[u8; 256 + 16]) -> Result<(functions::SetClientDhParams, Step3), Error> {
    if data.attempt >= MAX_DH_ATTEMPTS {
        return Err(Error::TooManyRetries { attempts: data.attempt });
    }
    let retry_id = data.auth_key.aux_hash();
    let Step3 { nonce, server_nonce, new_nonce, server, time_offset, attempt, .. } = data;
    client_dh(nonce, server_nonce, new_nonce, server, time_offset, attempt + 1, retry_id, random)
}

// ─── finish: create_key ──────────────────────────────────────────────────────

/// Check the server's verdict on our `g_b`.
pub fn finish(data: Step3, response: enums::SetClientDhParamsAnswer) -> Result<DhGen, Error> {
    struct DhData { nonce: [u8; 16], server_nonce: [u8; 16], hash: [u8; 16], num: u8 }

    let dh = match response {
        enums::SetClientDhParamsAnswer::DhGenOk(x) =>
            DhData { nonce: x.nonce, server_nonce: x.server_nonce, hash: x.new_nonce_hash1, num: 1 },
        enums::SetClientDhParamsAnswer::DhGenRetry(x) =>
            DhData { nonce: x.nonce, server_nonce: x.server_nonce, hash: x.new_nonce_hash2, num: 2 },
        enums::SetClientDhParamsAnswer::DhGenFail(x) =>
            DhData { nonce: x.nonce, server_nonce: x.server_nonce, hash: x.new_nonce_hash3, num: 3 },
    };

    check_nonce(&dh.nonce, &data.nonce)?;
    check_server_nonce(&dh.server_nonce, &data.server_nonce)?;

    let expected_hash = data.auth_key.calc_new_nonce_hash(&data.new_nonce, dh.num);
    check_new_nonce_hash(&dh.hash, &expected_hash)?;

    match dh.num {
        1 => {
            let mut salt = [0u8; 8];
            for ((dst, a), b) in salt.iter_mut().zip(&data.new_nonce[..8]).zip(&data.server_nonce[..8]) {
                *dst = a ^ b;
            }
            Ok(DhGen::Ok(Finished {
                auth_key: data.auth_key.to_bytes(),
                time_offset: data.time_offset,
                first_salt: i64::from_le_bytes(salt),
            }))
        }
        2 => Ok(DhGen::Retry(data)),
        _ => Err(Error::DhGenFail),
    }
}

// ─── Driver ──────────────────────────────────────────────────────────────────

/// Where a [`Handshake`] is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    PqSent,
    DhParamsSent,
    DhGenSent,
    Established,
    Failed,
}

/// What to do after a reply.
#[derive(Debug)]
pub enum Step {
    /// Send this plaintext frame next.
    Send(Vec<u8>),
    Done(Finished),
}

enum Pending {
    None,
    Pq(Step1),
    DhParams(Step2),
    DhGen(Box<Step3>),
}

/// The key exchange over plaintext messages.
pub struct Handshake {
    ctx: HandshakeContext,
    ids: MsgIdGen,
    pending: Pending,
    state: State,
}

impl Handshake {
    pub fn new(ctx: HandshakeContext) -> Self {
        Self { ctx, ids: MsgIdGen::new(), pending: Pending::None, state: State::Idle }
    }

    pub fn state(&self) -> State { self.state }

    /// First frame: `req_pq`. Restarts the exchange if one was running.
    pub fn start(&mut self, now: u64) -> Result<Vec<u8>, Error> {
        let (req, step) = self.guard(step1())?;
        self.pending = Pending::Pq(step);
        self.state = State::PqSent;
        Ok(self.wrap(&req, now))
    }

    /// Feed the server's plaintext reply.
    pub fn handle(&mut self, frame: &[u8], now: u64) -> Result<Step, Error> {
        let body = self.guard(Message::from_plaintext_bytes(frame).map_err(Error::from))?.body;
        let result = self.advance(&body, now);
        self.guard(result)
    }

    fn advance(&mut self, body: &[u8], now: u64) -> Result<Step, Error> {
        let now_secs = (now / 1000) as i32;
        match std::mem::replace(&mut self.pending, Pending::None) {
            Pending::None => Err(Error::UnexpectedReply),
            Pending::Pq(step) => {
                let (req, step) = step2(&self.ctx, step, enums::ResPq::from_bytes(body)?)?;
                debug!("[tdmtp] req_DH_params with key {}", req.public_key_fingerprint);
                self.pending = Pending::DhParams(step);
                self.state = State::DhParamsSent;
                Ok(Step::Send(self.wrap(&req, now)))
            }
            Pending::DhParams(step) => {
                let (req, step) = step3(step, enums::ServerDhParams::from_bytes(body)?, now_secs)?;
                self.pending = Pending::DhGen(Box::new(step));
                self.state = State::DhGenSent;
                Ok(Step::Send(self.wrap(&req, now)))
            }
            Pending::DhGen(step) => match finish(*step, enums::SetClientDhParamsAnswer::from_bytes(body)?)? {
                DhGen::Ok(done) => {
                    info!("[tdmtp] auth key created, time offset {}s", done.time_offset);
                    self.state = State::Established;
                    Ok(Step::Done(done))
                }
                DhGen::Retry(step) => {
                    warn!("[tdmtp] dh_gen_retry after attempt {}", step.attempt);
                    let (req, step) = retry(step)?;
                    self.pending = Pending::DhGen(Box::new(step));
                    Ok(Step::Send(self.wrap(&req, now)))
                }
            },
        }
    }

    fn wrap(&mut self, req: &impl Serializable, now: u64) -> Vec<u8> {
        Message::plaintext(self.ids.next(now, 0), req.to_bytes()).to_plaintext_bytes()
    }

    fn guard<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            warn!("[tdmtp] handshake failed: {e}");
            self.pending = Pending::None;
            self.state = State::Failed;
        }
        result
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn check_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else {
        Err(Error::InvalidNonce { got: *got, expected: *expected })
    }
}
fn check_server_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else {
        Err(Error::InvalidServerNonce { got: *got, expected: *expected })
    }
}
fn check_new_nonce_hash(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected { Ok(()) } else {
        Err(Error::InvalidNewNonceHash { got: *got, expected: *expected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res_pq(nonce: [u8; 16], fingerprints: Vec<i64>) -> enums::ResPq {
        enums::ResPq::ResPq(types::ResPq {
            nonce,
            server_nonce: [2; 16],
            pq: 0x17ED48941A08F981u64.to_be_bytes().to_vec(),
            server_public_key_fingerprints: fingerprints,
        })
    }

    #[test]
    fn default_context_trusts_builtin_keys() {
        let ctx = HandshakeContext::default();
        let fps: Vec<i64> = ctx.fingerprints().collect();
        assert_eq!(fps, vec![0xc3b42b026ce86b21u64 as i64, -3414540481677951611]);
    }

    #[test]
    fn step2_factors_pq_and_picks_known_key() {
        let (_, s1) = do_step1(&[1; 16]);
        let ctx = HandshakeContext::default();
        let resp = res_pq([1; 16], vec![42, -3414540481677951611]);
        let (req, _) = do_step2(&ctx, s1, resp, &[0; 287]).unwrap();
        assert_eq!(req.p, 1229739323u32.to_be_bytes());
        assert_eq!(req.q, 1402015859u32.to_be_bytes());
        assert_eq!(req.public_key_fingerprint, -3414540481677951611);
        assert_eq!(req.encrypted_data.len(), 256);
    }

    #[test]
    fn step2_rejects_unknown_keys_and_foreign_nonce() {
        let ctx = HandshakeContext::default();
        let (_, s1) = do_step1(&[1; 16]);
        assert_eq!(
            do_step2(&ctx, s1.clone(), res_pq([1; 16], vec![7]), &[0; 287]).unwrap_err(),
            Error::UnknownFingerprints { fingerprints: vec![7] }
        );
        assert!(matches!(
            do_step2(&ctx, s1, res_pq([9; 16], vec![7]), &[0; 287]),
            Err(Error::InvalidNonce { .. })
        ));
    }

    #[test]
    fn dh_params_fail_is_verified_then_reported() {
        let step = Step2 { nonce: [1; 16], server_nonce: [2; 16], new_nonce: [3; 32] };
        let hash = sha1!(&[3u8; 32]);
        let mut new_nonce_hash = [0u8; 16];
        new_nonce_hash.copy_from_slice(&hash[4..]);
        let fail = enums::ServerDhParams::Fail(types::ServerDhParamsFail {
            nonce: [1; 16],
            server_nonce: [2; 16],
            new_nonce_hash,
        });
        assert_eq!(do_step3(step.clone(), fail, &[0; 272], 0).unwrap_err(), Error::DhParamsFail);

        let bad = enums::ServerDhParams::Fail(types::ServerDhParamsFail {
            nonce: [1; 16],
            server_nonce: [2; 16],
            new_nonce_hash: [0; 16],
        });
        assert!(matches!(do_step3(step, bad, &[0; 272], 0), Err(Error::InvalidNewNonceHash { .. })));
    }

    #[test]
    fn misaligned_answer_rejected() {
        let step = Step2 { nonce: [1; 16], server_nonce: [2; 16], new_nonce: [3; 32] };
        let ok = enums::ServerDhParams::Ok(types::ServerDhParamsOk {
            nonce: [1; 16],
            server_nonce: [2; 16],
            encrypted_answer: vec![0; 20],
        });
        assert_eq!(do_step3(step, ok, &[0; 272], 0).unwrap_err(), Error::EncryptedResponseNotPadded { len: 20 });
    }

    #[test]
    fn reply_before_start_fails_the_handshake() {
        let mut hs = Handshake::new(HandshakeContext::default());
        let frame = Message::plaintext(0x1001, vec![0; 4]).to_plaintext_bytes();
        assert_eq!(hs.handle(&frame, 0).unwrap_err(), Error::UnexpectedReply);
        assert_eq!(hs.state(), State::Failed);
    }
}
