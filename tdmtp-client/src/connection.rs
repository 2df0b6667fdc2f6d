//! The connection worker: one tokio task per session.
//!
//! The worker owns the transport and the [`Engine`], creates or loads the
//! auth key, and drives every timer (send deadline, ping, receive timeout,
//! old-connection mark, resend sweep) from a single `select!` loop. It talks
//! to the rest of the client only through [`SessionData`] and channels.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tdmtp_crypto::AuthKey;
use tdmtp_mtproto::authentication::{Handshake, HandshakeContext, Step};
use tdmtp_mtproto::constants::PING_SEND_AFTER_SECS;
use tdmtp_mtproto::{Engine, EngineConfig, Error, Outcome, PingCheck, Received, RequestId, SessionData};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::dc_options::{DcOptions, Endpoints};
use crate::errors::InvocationError;
use crate::key_store::{DcKey, KeyBook};
use crate::transport::{Connector, Transport, TransportError};
use crate::ProtocolConfig;

// ─── Public state ─────────────────────────────────────────────────────────────

/// What the connection of a session is doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnecting after this many ms.
    Waiting(u64),
}

pub(crate) enum Command {
    /// Something was queued; check the send deadline.
    Wake,
    /// Drop the connection and start over.
    Reconnect,
}

pub(crate) type Deliveries = BTreeMap<RequestId, Received>;

// ─── Clock ────────────────────────────────────────────────────────────────────

/// Unix milliseconds that advance with tokio's clock, so paused-time tests
/// move the protocol clock too.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Clock {
    base:  u64,
    start: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        let base = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64);
        Self { base, start: Instant::now() }
    }

    pub(crate) fn now(&self) -> u64 { self.base + self.start.elapsed().as_millis() as u64 }
}

fn ms(n: u64) -> Duration { Duration::from_millis(n) }

async fn sleep_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ─── Dual-stack connect ───────────────────────────────────────────────────────

/// Connect over IPv4 and IPv6 at once.
///
/// IPv4 wins outright. If IPv6 answers first, IPv4 still gets `grace` to
/// catch up before IPv6 is taken. A failed family leaves the other one
/// to finish on its own.
pub(crate) async fn race<C: Connector>(
    connector: &C,
    endpoints: &Endpoints,
    try_ipv6: bool,
    grace: Duration,
) -> Result<(C::Transport, SocketAddr), TransportError> {
    let v6 = endpoints.v6.filter(|_| try_ipv6);
    match (endpoints.v4, v6) {
        (None, None) => Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "no endpoint for this DC").into()),
        (Some(addr), None) | (None, Some(addr)) => Ok((connector.connect(addr).await?, addr)),
        (Some(a4), Some(a6)) => {
            let f4 = connector.connect(a4);
            let f6 = connector.connect(a6);
            tokio::pin!(f4, f6);
            tokio::select! {
                r4 = &mut f4 => match r4 {
                    Ok(t4) => Ok((t4, a4)),
                    Err(e) => {
                        debug!("[tdmtp] IPv4 connect to {a4} failed: {e}");
                        Ok((f6.await?, a6))
                    }
                },
                r6 = &mut f6 => match r6 {
                    Ok(t6) => match tokio::time::timeout(grace, &mut f4).await {
                        Ok(Ok(t4)) => Ok((t4, a4)),
                        _ => Ok((t6, a6)),
                    },
                    Err(e) => {
                        debug!("[tdmtp] IPv6 connect to {a6} failed: {e}");
                        Ok((f4.await?, a4))
                    }
                },
            }
        }
    }
}

// ─── Worker ───────────────────────────────────────────────────────────────────

/// Everything a worker needs besides its channels.
pub(crate) struct WorkerSetup<C> {
    pub dc_id:      i32,
    pub connector:  Arc<C>,
    pub dc_options: Arc<DcOptions>,
    pub try_ipv6:   bool,
    pub handshake:  HandshakeContext,
    pub keys:       Arc<KeyBook>,
    pub protocol:   ProtocolConfig,
    pub engine:     EngineConfig,
}

pub(crate) struct Worker<C: Connector> {
    dc_id:      i32,
    connector:  Arc<C>,
    dc_options: Arc<DcOptions>,
    try_ipv6:   bool,
    handshake:  HandshakeContext,
    keys:       Arc<KeyBook>,
    protocol:   ProtocolConfig,
    data:       Arc<SessionData>,
    engine:     Engine,
    backoff:    Backoff,
    clock:      Clock,
    commands:   mpsc::UnboundedReceiver<Command>,
    deliveries: mpsc::UnboundedSender<Deliveries>,
    state:      watch::Sender<ConnectionState>,
    cancel:     CancellationToken,
}

enum Exit {
    Shutdown,
    Restart { may_be_bad_key: bool },
}

impl<C: Connector> Worker<C> {
    pub(crate) fn new(
        setup: WorkerSetup<C>,
        data: Arc<SessionData>,
        clock: Clock,
        commands: mpsc::UnboundedReceiver<Command>,
        deliveries: mpsc::UnboundedSender<Deliveries>,
        state: watch::Sender<ConnectionState>,
        cancel: CancellationToken,
    ) -> Self {
        let mut engine_config = setup.engine;
        engine_config.http_wait = setup.connector.protocol() == crate::dc_options::Protocol::Http;
        Self {
            dc_id: setup.dc_id,
            connector: setup.connector,
            dc_options: setup.dc_options,
            try_ipv6: setup.try_ipv6,
            handshake: setup.handshake,
            keys: setup.keys,
            protocol: setup.protocol,
            engine: Engine::new(Arc::clone(&data), engine_config),
            data,
            backoff: Backoff::new(),
            clock,
            commands,
            deliveries,
            state,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            match self.connection().await {
                Exit::Shutdown => break,
                Exit::Restart { may_be_bad_key } => {
                    self.restart(may_be_bad_key);
                    let delay = self.backoff.next_retry();
                    self.publish(ConnectionState::Waiting(delay));
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = sleep(ms(delay)) => {}
                    }
                }
            }
        }
        self.engine.on_disconnect();
        self.data.clear(Error::Transport("session closed".into()));
        self.deliver();
        self.publish(ConnectionState::Disconnected);
        debug!("[tdmtp] dc {} worker stopped", self.dc_id);
    }

    fn publish(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn deliver(&self) {
        let received = self.data.take_received();
        if !received.is_empty() && self.deliveries.send(received).is_err() {
            debug!("[tdmtp] dc {} has no dispatcher, dropping deliveries", self.dc_id);
        }
    }

    /// Put the stored key of this DC into the session, if it has none.
    fn load_key(&self) {
        if self.data.auth_key().is_some() {
            return;
        }
        match self.keys.key_for(self.dc_id) {
            Ok(Some(stored)) => {
                let now = self.clock.now();
                if let Err(e) = self.data.set_auth_key(Some(Arc::new(stored.to_auth_key()))) {
                    warn!("[tdmtp] dc {}: cannot install stored key: {e}", self.dc_id);
                    return;
                }
                self.data.set_salt(stored.salt);
                self.data.update_time((now / 1000) as i64 + i64::from(stored.time_offset), now);
                debug!("[tdmtp] dc {} uses the key from {}", self.dc_id, self.keys.name());
            }
            Ok(None) => {}
            Err(e) => warn!("[tdmtp] dc {}: reading {} failed: {e}", self.dc_id, self.keys.name()),
        }
    }

    fn restart(&mut self, may_be_bad_key: bool) {
        if may_be_bad_key && !self.data.key_checked() && self.data.auth_key().is_some() {
            warn!("[tdmtp] dc {} refused an unchecked auth key, creating a new one", self.dc_id);
            if let Err(e) = self.data.set_auth_key(None) {
                warn!("[tdmtp] dc {}: dropping the key failed: {e}", self.dc_id);
            }
            self.data.set_salt(0);
            if let Err(e) = self.keys.forget(self.dc_id) {
                warn!("[tdmtp] dc {}: forgetting the key failed: {e}", self.dc_id);
            }
        }
        if let Err(e) = self.engine.restart(self.clock.now()) {
            warn!("[tdmtp] dc {}: session reset failed: {e}", self.dc_id);
        }
        self.deliver();
    }

    /// One connection, from connect to teardown.
    async fn connection(&mut self) -> Exit {
        self.publish(ConnectionState::Connecting);
        self.load_key();

        let endpoints = self.dc_options.lookup(self.dc_id, self.connector.protocol(), false);
        let timeout = ms(self.backoff.connect_timeout());
        let attempt = race(&*self.connector, &endpoints, self.try_ipv6, self.protocol.ipv4_grace);
        let (mut transport, addr) = tokio::select! {
            _ = self.cancel.cancelled() => return Exit::Shutdown,
            result = tokio::time::timeout(timeout, attempt) => match result {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => {
                    warn!("[tdmtp] dc {} connect failed: {e}", self.dc_id);
                    return Exit::Restart { may_be_bad_key: false };
                }
                Err(_) => {
                    warn!("[tdmtp] dc {} connect timed out after {timeout:?}", self.dc_id);
                    self.backoff.on_connect_timeout();
                    return Exit::Restart { may_be_bad_key: false };
                }
            },
        };
        info!("[tdmtp] dc {} transport up ({addr})", self.dc_id);
        self.backoff.on_connected();

        if self.data.auth_key().is_none() {
            let cancel = self.cancel.clone();
            let created = tokio::select! {
                _ = cancel.cancelled() => return Exit::Shutdown,
                result = tokio::time::timeout(self.protocol.handshake_timeout, self.create_key(&mut transport)) => result,
            };
            match created {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("[tdmtp] dc {} key exchange failed: {e}", self.dc_id);
                    return Exit::Restart { may_be_bad_key: false };
                }
                Err(_) => {
                    warn!("[tdmtp] dc {} key exchange timed out", self.dc_id);
                    return Exit::Restart { may_be_bad_key: false };
                }
            }
        }

        if let Err(e) = self.engine.on_key_ready(self.clock.now()) {
            warn!("[tdmtp] dc {}: {e}", self.dc_id);
            return Exit::Restart { may_be_bad_key: false };
        }
        if self.engine.is_connected() {
            self.publish(ConnectionState::Connected);
        }
        self.pump(&mut transport).await
    }

    /// Run the DH exchange over a fresh transport and install the key.
    async fn create_key(&mut self, transport: &mut C::Transport) -> Result<(), InvocationError> {
        info!("[tdmtp] dc {} creating an auth key", self.dc_id);
        let mut handshake = Handshake::new(self.handshake.clone());
        transport.send(handshake.start(self.clock.now())?).await?;
        let done = loop {
            let frame = transport.recv().await?;
            if frame.is_empty() {
                continue;
            }
            match handshake.handle(&frame, self.clock.now())? {
                Step::Send(next) => transport.send(next).await?,
                Step::Done(done) => break done,
            }
        };

        let now = self.clock.now();
        let key = AuthKey::from_bytes(done.auth_key).with_dc(self.dc_id);
        self.data.set_auth_key(Some(Arc::new(key)))?;
        self.data.set_salt(done.first_salt);
        self.data.update_time((now / 1000) as i64 + i64::from(done.time_offset), now);
        let stored = DcKey {
            dc_id:       self.dc_id,
            auth_key:    done.auth_key,
            salt:        done.first_salt,
            time_offset: done.time_offset,
        };
        if let Err(e) = self.keys.remember(stored) {
            warn!("[tdmtp] dc {}: saving the key to {} failed: {e}", self.dc_id, self.keys.name());
        }
        Ok(())
    }

    /// The encrypted session loop.
    async fn pump(&mut self, transport: &mut C::Transport) -> Exit {
        let long_poll = transport.needs_http_wait();
        let mut send_at: Option<Instant> = None;
        let mut ping_at: Option<Instant> = None;
        // Deadline for an answer, with the local time the triggering send went out.
        let mut receive_by: Option<(Instant, u64)> = None;
        let mut old_at = Instant::now() + self.protocol.old_connection_after;
        let resend_every = self.protocol.resend_check_interval;
        let mut resend_check = tokio::time::interval_at(Instant::now() + resend_every, resend_every);
        resend_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if self.engine.config().is_main {
            ping_at = Some(Instant::now() + ms(PING_SEND_AFTER_SECS * 1000));
        }

        loop {
            if let Some(wait) = self.data.take_send_wait() {
                let at = Instant::now() + ms(wait);
                send_at = Some(send_at.map_or(at, |current| current.min(at)));
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Exit::Shutdown,

                command = self.commands.recv() => match command {
                    None => return Exit::Shutdown,
                    Some(Command::Wake) => {}
                    Some(Command::Reconnect) => {
                        info!("[tdmtp] dc {} reconnecting on request", self.dc_id);
                        return Exit::Restart { may_be_bad_key: false };
                    }
                },

                frame = transport.recv() => {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("[tdmtp] dc {} transport failed: {e}", self.dc_id);
                            return Exit::Restart { may_be_bad_key: e.server_code() == Some(-404) };
                        }
                    };
                    if frame.is_empty() {
                        self.data.request_send(0);
                        continue;
                    }
                    let now = self.clock.now();
                    let rtt = receive_by.take().map(|(_, sent)| now.saturating_sub(sent));
                    self.backoff.on_received(rtt);
                    old_at = Instant::now() + self.protocol.old_connection_after;

                    let outcome = self.engine.handle_frame(&frame, now);
                    self.deliver();
                    if self.data.take_session_reset() {
                        info!("[tdmtp] dc {} session reset, new session {}", self.dc_id, self.data.session());
                    }
                    match outcome {
                        Outcome::Ok => {}
                        Outcome::Restart(e) => {
                            warn!("[tdmtp] dc {} restarting: {e}", self.dc_id);
                            return Exit::Restart { may_be_bad_key: false };
                        }
                        Outcome::ResetSessionThenRestart => {
                            warn!("[tdmtp] dc {} restarting with a new session", self.dc_id);
                            return Exit::Restart { may_be_bad_key: false };
                        }
                    }
                    if self.engine.is_connected() {
                        self.publish(ConnectionState::Connected);
                    }
                    if long_poll {
                        self.data.request_send(0);
                    }
                }

                _ = sleep_opt(send_at) => {
                    send_at = None;
                    let now = self.clock.now();
                    let out = match self.engine.prepare_frame(now) {
                        Ok(Some(out)) => out,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("[tdmtp] dc {} cannot build a frame: {e}", self.dc_id);
                            return Exit::Restart { may_be_bad_key: false };
                        }
                    };
                    if let Some(delay) = out.ping_timer {
                        ping_at = Some(Instant::now() + ms(delay));
                    }
                    let len = out.frame.len();
                    if let Err(e) = transport.send(out.frame).await {
                        warn!("[tdmtp] dc {} send failed: {e}", self.dc_id);
                        return Exit::Restart { may_be_bad_key: e.server_code() == Some(-404) };
                    }
                    if out.needs_any_response && receive_by.is_none() {
                        let budget = self.backoff.receive_budget(len);
                        receive_by = Some((Instant::now() + ms(budget), now));
                    }
                }

                _ = sleep_opt(ping_at) => {
                    ping_at = None;
                    match self.engine.check_ping(self.clock.now()) {
                        PingCheck::Restart => return Exit::Restart { may_be_bad_key: false },
                        PingCheck::Rearm(delay) => ping_at = Some(Instant::now() + ms(delay)),
                        PingCheck::Send => {}
                    }
                }

                _ = sleep_opt(receive_by.map(|(at, _)| at)) => {
                    warn!(
                        "[tdmtp] dc {} got nothing in {} ms, reconnecting",
                        self.dc_id,
                        self.backoff.wait_for_received()
                    );
                    self.backoff.on_receive_timeout();
                    return Exit::Restart { may_be_bad_key: false };
                }

                _ = sleep_until(old_at), if !self.backoff.is_old() => {
                    debug!("[tdmtp] dc {} connection is old", self.dc_id);
                    self.backoff.mark_old();
                }

                _ = resend_check.tick() => {
                    self.data.check_requests_by_timer(self.clock.now());
                    self.deliver();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryConnector;

    fn addr(s: &str) -> SocketAddr { s.parse().unwrap() }

    fn both() -> Endpoints {
        Endpoints { v4: Some(addr("10.0.0.1:443")), v6: Some(addr("[2001:db8::1]:443")) }
    }

    const GRACE: Duration = Duration::from_millis(1_000);

    #[tokio::test(start_paused = true)]
    async fn ipv4_wins_outright() {
        let (connector, _accepted) = MemoryConnector::new();
        let connector = connector.with_delay(addr("[2001:db8::1]:443"), ms(10));
        let (_, winner) = race(&connector, &both(), true, GRACE).await.unwrap();
        assert_eq!(winner, addr("10.0.0.1:443"));
    }

    #[tokio::test(start_paused = true)]
    async fn ipv4_may_catch_up_within_the_grace_window() {
        let (connector, _accepted) = MemoryConnector::new();
        let connector = connector.with_delay(addr("10.0.0.1:443"), ms(500));
        let started = Instant::now();
        let (_, winner) = race(&connector, &both(), true, GRACE).await.unwrap();
        assert_eq!(winner, addr("10.0.0.1:443"));
        assert!(started.elapsed() < GRACE);
    }

    #[tokio::test(start_paused = true)]
    async fn ipv6_is_taken_after_the_grace_window() {
        let (connector, _accepted) = MemoryConnector::new();
        let connector = connector.with_delay(addr("10.0.0.1:443"), ms(5_000));
        let started = Instant::now();
        let (_, winner) = race(&connector, &both(), true, GRACE).await.unwrap();
        assert_eq!(winner, addr("[2001:db8::1]:443"));
        assert!(started.elapsed() >= GRACE);
    }

    #[tokio::test(start_paused = true)]
    async fn a_refused_family_leaves_the_other() {
        let (connector, _accepted) = MemoryConnector::new();
        let connector = connector
            .refusing(addr("10.0.0.1:443"))
            .with_delay(addr("[2001:db8::1]:443"), ms(50));
        let (_, winner) = race(&connector, &both(), true, GRACE).await.unwrap();
        assert_eq!(winner, addr("[2001:db8::1]:443"));

        assert!(race(&connector, &both(), false, GRACE).await.is_err());
    }

    #[tokio::test]
    async fn no_endpoint_is_an_error() {
        let (connector, _accepted) = MemoryConnector::new();
        assert!(race(&connector, &Endpoints::default(), true, GRACE).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn clock_follows_tokio_time() {
        let clock = Clock::new();
        let before = clock.now();
        tokio::time::advance(ms(1_500)).await;
        assert_eq!(clock.now() - before, 1_500);
    }
}
