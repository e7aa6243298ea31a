//! In-process stream hub
//!
//! Implements [`StreamDialer`] with `tokio::io::duplex` pipes so stream-only
//! networks can run entirely inside one process (tests, simulations).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use super::abstraction::{normalize_url, Address, RawStreamPair};
use super::bluetooth::StreamDialer;

const DEFAULT_PIPE_BUFFER: usize = 64 * 1024;

struct Endpoint {
    url: String,
    service: String,
    accept: Option<mpsc::Sender<RawStreamPair>>,
}

pub struct MemoryHub {
    endpoints: Mutex<HashMap<String, Endpoint>>,
    buffer: usize,
    dials: AtomicUsize,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_PIPE_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
            dials: AtomicUsize::new(0),
        }
    }

    /// Make `url` discoverable without accepting anything. Dialing it fails.
    pub fn advertise(&self, url: &str, service_name: &str) {
        self.endpoints.lock().insert(
            normalize_url(url).to_string(),
            Endpoint {
                url: url.to_string(),
                service: service_name.to_string(),
                accept: None,
            },
        );
    }

    /// Take `url` off the air
    pub fn remove(&self, url: &str) {
        self.endpoints.lock().remove(normalize_url(url));
    }

    /// Successful dials so far
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamDialer for MemoryHub {
    async fn listen(
        &self,
        local: &Address,
        service_name: &str,
    ) -> io::Result<mpsc::Receiver<RawStreamPair>> {
        let key = local.normalized_url().to_string();
        let mut endpoints = self.endpoints.lock();
        if let Some(existing) = endpoints.get(&key) {
            if existing.accept.as_ref().is_some_and(|tx| !tx.is_closed()) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} is already listening", key),
                ));
            }
        }
        let (tx, rx) = mpsc::channel(32);
        endpoints.insert(
            key,
            Endpoint {
                url: local.url.clone(),
                service: service_name.to_string(),
                accept: Some(tx),
            },
        );
        Ok(rx)
    }

    async fn dial(&self, url: &str) -> io::Result<RawStreamPair> {
        let accept = self
            .endpoints
            .lock()
            .get(normalize_url(url))
            .and_then(|endpoint| endpoint.accept.clone())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, format!("no listener at {}", url))
            })?;

        let (near, far) = tokio::io::duplex(self.buffer);
        accept
            .send(RawStreamPair::from_stream(far))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener gone"))?;
        self.dials.fetch_add(1, Ordering::SeqCst);
        debug!(%url, "memory link dialed");
        Ok(RawStreamPair::from_stream(near).with_peer(Address::new(url, 0, "")))
    }

    async fn discover(&self, service_name: &str) -> io::Result<Vec<String>> {
        let mut urls: Vec<String> = self
            .endpoints
            .lock()
            .values()
            .filter(|endpoint| endpoint.service == service_name)
            .map(|endpoint| endpoint.url.clone())
            .collect();
        urls.sort();
        Ok(urls)
    }
}
