//! MTProto over HTTP long-polling.
//!
//! Every outgoing frame is the body of a `POST http://ip:port/api`. The
//! response body is either empty, one encrypted frame, or a 4-byte negative
//! transport error code. The server holds a request open while an
//! `http_wait` inside it allows, so replies to earlier requests arrive on
//! whichever poll is pending. A poll that ends without data yields an
//! empty frame so the caller knows to open another.

use std::net::SocketAddr;

use tdmtp_mtproto::FrameError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dc_options::Protocol;
use crate::transport::{Connector, Transport, TransportError};

type Inbound = Result<Vec<u8>, TransportError>;

#[derive(Clone, Default)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new() -> Self { Self::default() }
}

impl Connector for HttpConnector {
    type Transport = HttpTransport;

    async fn connect(&self, addr: SocketAddr) -> Result<HttpTransport, TransportError> {
        Ok(HttpTransport::new(self.client.clone(), addr))
    }

    fn protocol(&self) -> Protocol { Protocol::Http }
}

/// A virtual connection: a URL plus the polls currently in flight.
pub struct HttpTransport {
    client: reqwest::Client,
    url:    String,
    tx:     mpsc::UnboundedSender<Inbound>,
    rx:     mpsc::UnboundedReceiver<Inbound>,
    cancel: CancellationToken,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { client, url: format!("http://{addr}/api"), tx, rx, cancel: CancellationToken::new() }
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) { self.cancel.cancel(); }
}

async fn post(client: reqwest::Client, url: String, frame: Vec<u8>) -> Result<Vec<u8>, TransportError> {
    let response = client
        .post(&url)
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .body(frame)
        .send()
        .await
        .map_err(|e| TransportError::Http(e.to_string()))?;
    let status = response.status();
    let body = response.bytes().await.map_err(|e| TransportError::Http(e.to_string()))?;
    if let &[a, b, c, d] = &body[..] {
        let code = i32::from_le_bytes([a, b, c, d]);
        if code < 0 {
            return Err(FrameError::Server { code }.into());
        }
    }
    if !status.is_success() {
        return Err(TransportError::Http(format!("status {status}")));
    }
    Ok(body.to_vec())
}

impl Transport for HttpTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let (client, url, tx, cancel) = (self.client.clone(), self.url.clone(), self.tx.clone(), self.cancel.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = post(client, url, frame) => {
                    if matches!(&result, Ok(body) if body.is_empty()) {
                        debug!("[tdmtp] HTTP poll ended without data");
                    }
                    let _ = tx.send(result);
                }
            }
        });
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        self.rx.recv().await.unwrap_or(Err(TransportError::Closed))
    }

    fn needs_http_wait(&self) -> bool { true }
}
