//! Dial, version handshake, reconnect and per-call timeout (C9).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::{ServerHost, VERSION};
use crate::error::{HsyncError, Result};
use crate::protocol::{Call, Reply, Request, Response};
use crate::transport;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub struct ConnectionManager {
    host: ServerHost,
    stream: Mutex<Option<TcpStream>>,
    next_id: AtomicU64,
    connect_count: AtomicU64,
}

impl ConnectionManager {
    pub fn new(host: ServerHost) -> Self {
        Self {
            host,
            stream: Mutex::new(None),
            next_id: AtomicU64::new(1),
            connect_count: AtomicU64::new(0),
        }
    }

    pub fn connect_count(&self) -> u64 {
        self.connect_count.load(Ordering::Relaxed)
    }

    async fn dial(&self) -> Result<TcpStream> {
        let n = self.connect_count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(host = %self.host.host, attempt = n, "connecting");
        let mut stream = TcpStream::connect(&self.host.host)
            .await
            .map_err(|e| HsyncError::Network(e.to_string()))?;
        transport::client_handshake(&mut stream)
            .await
            .map_err(|e| HsyncError::Network(e.to_string()))?;
        tracing::info!(host = %self.host.host, "connected");
        Ok(stream)
    }

    async fn ensure_connected(&self) -> tokio::sync::MutexGuard<'_, Option<TcpStream>> {
        loop {
            let mut guard = self.stream.lock().await;
            if guard.is_some() {
                return guard;
            }
            match self.dial().await {
                Ok(s) => {
                    *guard = Some(s);
                    return guard;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "not connected, reconnecting...");
                    drop(guard);
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }

    /// Perform the version handshake: fatal if the server's version tag
    /// does not match ours.
    pub async fn verify_version(&self) -> Result<()> {
        match self.call(Call::Version(VERSION.to_string())).await? {
            Reply::Version(server_version) => {
                if server_version != VERSION {
                    return Err(HsyncError::VersionMismatch {
                        client: VERSION.to_string(),
                        server: server_version,
                    });
                }
                Ok(())
            }
            _ => Err(HsyncError::Protocol("unexpected reply to Version".into())),
        }
    }

    /// Every call: ensure connected, apply a 30s deadline that force-closes
    /// the socket on expiry, and on shutdown/timeout/network errors nil the
    /// connection and retry from the top within this same invocation.
    pub async fn call(&self, call: Call) -> Result<Reply> {
        loop {
            let mut guard = self.ensure_connected().await;
            let stream = guard.as_mut().expect("connected");
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let method = call.method_name();
            let req = Request {
                id,
                call: call.clone(),
            };
            let round_trip = async {
                transport::write_frame(stream, &crate::protocol::encode(&req)).await?;
                match transport::read_frame(stream).await? {
                    Some(bytes) => crate::protocol::decode::<Response>(&bytes),
                    None => Err(HsyncError::Network("connection closed".into())),
                }
            };

            match tokio::time::timeout(CALL_TIMEOUT, round_trip).await {
                Ok(Ok(resp)) if resp.id == id => {
                    return resp.result.map_err(HsyncError::Protocol);
                }
                Ok(Ok(_mismatched)) => {
                    tracing::warn!(method, "call reply id mismatch, dropping connection");
                    *guard = None;
                }
                Ok(Err(e)) => {
                    tracing::warn!(method, error = %e, "call failed");
                    *guard = None;
                }
                Err(_) => {
                    tracing::warn!(method, "call timeout");
                    *guard = None;
                }
            }
        }
    }
}
