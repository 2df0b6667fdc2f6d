//! # tdmtp-client
//!
//! Async runtime for the sans-IO core in `tdmtp-mtproto`.
//!
//! ## Features
//! - TCP transports (abridged, intermediate, full) and HTTP long-polling
//! - One worker task per session: auth key creation, reconnect with backoff,
//!   IPv4/IPv6 race, ping keepalive, adaptive receive timeout
//! - [`Session::submit`] for raw calls, [`Client::invoke`] for typed ones
//! - `FLOOD_WAIT` and internal-error retries through a [`RetryPolicy`]
//! - DC migration and auth key persistence through a [`KeyStore`]
//!
//! ```rust,no_run
//! # async fn f() -> Result<(), tdmtp_client::InvocationError> {
//! let client = tdmtp_client::Client::connect(tdmtp_client::Config {
//!     api_id: 12345,
//!     ..Default::default()
//! })
//! .await?;
//! let answer = client.invoke_raw(vec![/* serialized TL function */]).await?;
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

mod backoff;
mod connection;
mod dc_options;
mod errors;
mod key_store;
mod retry;
mod session;
pub mod transport;
mod transport_http;

pub use backoff::Backoff;
pub use connection::ConnectionState;
pub use dc_options::{DcFlags, DcOptions, Endpoints, Protocol};
pub use errors::{InvocationError, RpcError};
#[cfg(feature = "sqlite")]
pub use key_store::SqliteStore;
pub use key_store::{BinaryFileStore, DcKey, InMemoryStore, KeyStore, PersistedKeys};
pub use retry::{AutoSleep, NoRetries, RetryContext, RetryPolicy};
pub use session::{ResponseFuture, Session};
pub use transport::{Connector, DefaultConnector, TcpConnector, TcpTransport, Transport, TransportError};
pub use transport_http::{HttpConnector, HttpTransport};

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tdmtp_mtproto::authentication::HandshakeContext;
use tdmtp_mtproto::constants::{CHECK_RESEND_TIMEOUT, CONNECTION_OLD_TIMEOUT, IPV4_CONNECTION_WAIT_TIMEOUT};
use tdmtp_mtproto::EngineConfig;
use tdmtp_tl_types::{Deserializable, RemoteCall, Serializable, LAYER};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use connection::WorkerSetup;
use key_store::KeyBook;
use session::UpdateSinks;

/// How many `*_MIGRATE_N` answers one call may follow before giving up.
const MAX_MIGRATIONS: u32 = 3;

// ─── TransportKind ────────────────────────────────────────────────────────────

/// Which MTProto transport [`Client::connect`] opens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// `0xef` marker, length in 4-byte words. Smallest overhead.
    #[default]
    Abridged,
    /// `0xeeeeeeee` marker, 4-byte length prefix.
    Intermediate,
    /// Length, sequence number and CRC32 around every packet.
    Full,
    /// `POST /api` long-polling; no persistent socket.
    Http,
}

// ─── ProtocolConfig ───────────────────────────────────────────────────────────

/// Timing knobs of the connection worker.
#[derive(Clone, Debug)]
pub struct ProtocolConfig {
    /// Give up on an auth key exchange after this long.
    pub handshake_timeout:     Duration,
    /// How often pending requests are checked for a needed resend.
    pub resend_check_interval: Duration,
    /// A connection with no traffic for this long is considered old.
    pub old_connection_after:  Duration,
    /// How long IPv4 may still win after IPv6 connected first.
    pub ipv4_grace:            Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            handshake_timeout:     Duration::from_secs(15),
            resend_check_interval: Duration::from_millis(CHECK_RESEND_TIMEOUT),
            old_connection_after:  Duration::from_millis(CONNECTION_OLD_TIMEOUT),
            ipv4_grace:            Duration::from_millis(IPV4_CONNECTION_WAIT_TIMEOUT),
        }
    }
}

// ─── Config ───────────────────────────────────────────────────────────────────

/// Configuration for [`Client::connect`].
#[derive(Clone)]
pub struct Config {
    pub api_id:         i32,
    pub device_model:   String,
    pub system_version: String,
    pub app_version:    String,
    pub lang_code:      String,
    /// Layer sent in `invokeWithLayer` (default: the schema's).
    pub layer:          i32,
    /// Which MTProto transport to use (default: Abridged).
    pub transport:      TransportKind,
    pub dc_options:     DcOptions,
    /// DC to start on when the key store has no home DC yet.
    pub home_dc:        i32,
    /// Race IPv6 endpoints against IPv4 ones (default: false).
    pub try_ipv6:       bool,
    pub retry_policy:   Arc<dyn RetryPolicy>,
    /// Auth key persistence (default: binary file `"tdmtp.keys"`).
    pub key_store:      Arc<dyn KeyStore>,
    /// RSA keys and DH checks for new auth keys.
    pub handshake:      HandshakeContext,
    pub protocol:       ProtocolConfig,
}

impl Default for Config {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            api_id:         0,
            device_model:   engine.device_model,
            system_version: engine.system_version,
            app_version:    engine.app_version,
            lang_code:      engine.lang_code,
            layer:          LAYER,
            transport:      TransportKind::Abridged,
            dc_options:     DcOptions::bootstrap(),
            home_dc:        2,
            try_ipv6:       false,
            retry_policy:   Arc::new(AutoSleep::default()),
            key_store:      Arc::new(BinaryFileStore::new("tdmtp.keys")),
            handshake:      HandshakeContext::default(),
            protocol:       ProtocolConfig::default(),
        }
    }
}

impl Config {
    fn engine(&self) -> EngineConfig {
        EngineConfig {
            api_id:         self.api_id,
            device_model:   self.device_model.clone(),
            system_version: self.system_version.clone(),
            app_version:    self.app_version.clone(),
            lang_code:      self.lang_code.clone(),
            layer:          self.layer,
            is_main:        true,
            http_wait:      false,
        }
    }
}

// ─── UpdateStream ─────────────────────────────────────────────────────────────

/// Server-initiated messages (`updates`, `updateShort`, ...) as raw TL bytes.
pub struct UpdateStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl UpdateStream {
    /// Wait for the next update. Returns `None` once the client disconnected.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

struct ClientInner<C> {
    home:         Mutex<Arc<Session>>,
    connector:    Arc<C>,
    dc_options:   Arc<DcOptions>,
    keys:         Arc<KeyBook>,
    retry_policy: Arc<dyn RetryPolicy>,
    handshake:    HandshakeContext,
    protocol:     ProtocolConfig,
    engine:       EngineConfig,
    try_ipv6:     bool,
    updates:      UpdateSinks,
    cancel:       CancellationToken,
}

/// A connection to the home DC. Cheap to clone.
pub struct Client<C: Connector = DefaultConnector> {
    inner: Arc<ClientInner<C>>,
}

impl<C: Connector> Clone for Client<C> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl Client {
    /// Connect with the transport named in `config.transport`.
    pub async fn connect(config: Config) -> Result<Self, InvocationError> {
        let connector = DefaultConnector::new(config.transport);
        Self::with_connector(config, connector).await
    }
}

impl<C: Connector> Client<C> {
    /// Connect through a custom [`Connector`].
    ///
    /// Returns once the worker is started; the first call waits for the
    /// connection (and the auth key, if none is stored).
    pub async fn with_connector(config: Config, connector: C) -> Result<Self, InvocationError> {
        let keys = Arc::new(KeyBook::new(Arc::clone(&config.key_store)));
        let home_dc = match keys.load() {
            Ok(stored) if stored.home_dc_id != 0 => stored.home_dc_id,
            Ok(_) => config.home_dc,
            Err(e) => {
                warn!("[tdmtp] reading {} failed ({e}), starting on dc {}", keys.name(), config.home_dc);
                config.home_dc
            }
        };
        info!("[tdmtp] starting on dc {home_dc} (keys in {})", keys.name());

        let engine = config.engine();
        let updates = UpdateSinks::default();
        let cancel = CancellationToken::new();
        let connector = Arc::new(connector);
        let dc_options = Arc::new(config.dc_options);
        let setup = WorkerSetup {
            dc_id:      home_dc,
            connector:  Arc::clone(&connector),
            dc_options: Arc::clone(&dc_options),
            try_ipv6:   config.try_ipv6,
            handshake:  config.handshake.clone(),
            keys:       Arc::clone(&keys),
            protocol:   config.protocol.clone(),
            engine:     engine.clone(),
        };
        let home = Session::spawn(setup, Arc::clone(&updates), &cancel)?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                home: Mutex::new(Arc::new(home)),
                connector,
                dc_options,
                keys,
                retry_policy: config.retry_policy,
                handshake: config.handshake,
                protocol: config.protocol,
                engine,
                try_ipv6: config.try_ipv6,
                updates,
                cancel,
            }),
        })
    }

    /// The session of the home DC.
    pub fn session(&self) -> Arc<Session> { Arc::clone(&self.inner.home.lock()) }

    pub fn home_dc(&self) -> i32 { self.inner.home.lock().dc_id() }

    /// Watch the home connection. A migration swaps the session, so take a
    /// fresh receiver afterwards.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> { self.inner.home.lock().state() }

    /// Return an [`UpdateStream`] that yields every update from now on.
    pub fn stream_updates(&self) -> UpdateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.updates.lock().push(tx);
        UpdateStream { rx }
    }

    // ── Invoke ─────────────────────────────────────────────────────────────

    /// Invoke a TL function and decode its answer.
    pub async fn invoke<R: RemoteCall>(&self, request: &R) -> Result<R::Return, InvocationError> {
        let body = self.invoke_raw(request.to_bytes()).await?;
        R::Return::from_bytes(&body).map_err(Into::into)
    }

    /// Invoke a serialized TL function, following migrations and retrying
    /// as the [`RetryPolicy`] allows.
    pub async fn invoke_raw(&self, body: Vec<u8>) -> Result<Vec<u8>, InvocationError> {
        let mut fail_count   = NonZeroU32::MIN;
        let mut slept_so_far = Duration::default();
        let mut migrations   = 0;
        let mut layer_resent = false;
        loop {
            let session = self.session();
            let error = match session.submit(body.clone()).await {
                Ok(answer) => return Ok(answer),
                Err(InvocationError::Migrate(dc_id)) if migrations < MAX_MIGRATIONS => {
                    migrations += 1;
                    self.migrate_to(dc_id)?;
                    continue;
                }
                Err(InvocationError::Rpc(e)) if e.needs_layer() && !layer_resent => {
                    info!("[tdmtp] dc {} answered {}, resending with initConnection", session.dc_id(), e.name);
                    layer_resent = true;
                    session.data().set_layer_inited(false);
                    continue;
                }
                Err(e) => e,
            };
            let ctx = RetryContext { fail_count, slept_so_far, error };
            match self.inner.retry_policy.should_retry(&ctx) {
                ControlFlow::Continue(delay) => {
                    sleep(delay).await;
                    slept_so_far += delay;
                    fail_count = fail_count.saturating_add(1);
                }
                ControlFlow::Break(()) => return Err(ctx.error),
            }
        }
    }

    // ── DC migration ───────────────────────────────────────────────────────

    /// Make `dc_id` the home DC: start a session there and drop the old one.
    pub fn migrate_to(&self, dc_id: i32) -> Result<(), InvocationError> {
        if self.home_dc() == dc_id {
            return Ok(());
        }
        if !self.inner.dc_options.has(dc_id) {
            return Err(InvocationError::Transport(format!("no address known for dc {dc_id}")));
        }
        info!("[tdmtp] migrating to dc {dc_id}");
        let setup = WorkerSetup {
            dc_id,
            connector:  Arc::clone(&self.inner.connector),
            dc_options: Arc::clone(&self.inner.dc_options),
            try_ipv6:   self.inner.try_ipv6,
            handshake:  self.inner.handshake.clone(),
            keys:       Arc::clone(&self.inner.keys),
            protocol:   self.inner.protocol.clone(),
            engine:     self.inner.engine.clone(),
        };
        let session = Arc::new(Session::spawn(setup, Arc::clone(&self.inner.updates), &self.inner.cancel)?);
        let old = std::mem::replace(&mut *self.inner.home.lock(), session);
        old.shutdown();
        if let Err(e) = self.inner.keys.set_home_dc(dc_id) {
            warn!("[tdmtp] saving home dc {dc_id} to {} failed: {e}", self.inner.keys.name());
        }
        Ok(())
    }

    /// Stop every worker. Pending calls fail and update streams end.
    pub fn disconnect(&self) {
        self.inner.cancel.cancel();
        self.inner.updates.lock().clear();
    }
}
