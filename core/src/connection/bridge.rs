//! Connection bridging and stream adaptation
//!
//! `connect` splices two connections full-duplex, which is how an MSD relays
//! a connection between networks. `connection_to_streams` exposes a
//! connection as a plain byte stream for consumers that only speak bytes.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tracing::{debug, warn};

use super::{Connection, ConnectionEvent, ConnectionListener, ListenerId};
use crate::message::{attr, Message};

/// Shared state of one splice
struct Splice {
    a: Connection,
    b: Connection,
    ids: Mutex<Option<(ListenerId, ListenerId)>>,
}

impl Splice {
    fn other(&self, connection: &Connection) -> &Connection {
        if connection.same_as(&self.a) {
            &self.b
        } else {
            &self.a
        }
    }

    fn unregister(&self) {
        if let Some((a_id, b_id)) = self.ids.lock().take() {
            self.a.remove_listener(a_id);
            self.b.remove_listener(b_id);
        }
    }

    async fn tear_down(&self) {
        self.unregister();
        let _ = self.a.close().await;
        let _ = self.b.close().await;
    }
}

struct SpliceListener {
    splice: Arc<Splice>,
}

#[async_trait]
impl ConnectionListener for SpliceListener {
    async fn on_event(&self, connection: &Connection, event: &ConnectionEvent) {
        let other = self.splice.other(connection);
        match event {
            ConnectionEvent::Received(msg) | ConnectionEvent::Error(msg) => {
                let mut forwarded = msg.clone();
                // the tag belongs to the inbound link only
                forwarded.remove_attribute(attr::VIRTUAL);
                if let Err(err) = other.send(forwarded).await {
                    warn!(
                        from = connection.serial(),
                        to = other.serial(),
                        error = %err,
                        "bridge forward failed"
                    );
                    let notice = Message::error(&err.to_string());
                    if !connection.is_closed() {
                        let _ = connection.send(notice).await;
                    } else if !other.is_closed() {
                        let _ = other.send(notice).await;
                    }
                    self.splice.tear_down().await;
                }
            }
            ConnectionEvent::Closed => {
                debug!(
                    closed = connection.serial(),
                    other = other.serial(),
                    "bridge side closed"
                );
                self.splice.unregister();
                if !other.is_closed() {
                    let _ = other.close().await;
                }
            }
            ConnectionEvent::Sent(_) => {}
        }
    }
}

/// Splice `a` and `b` together: traffic received on either side is sent on
/// the other and closing either side closes both. Background readers are
/// started on both connections.
pub fn connect(a: &Connection, b: &Connection) {
    let splice = Arc::new(Splice {
        a: a.clone(),
        b: b.clone(),
        ids: Mutex::new(None),
    });
    let a_id = a.add_listener(Arc::new(SpliceListener {
        splice: splice.clone(),
    }));
    let b_id = b.add_listener(Arc::new(SpliceListener {
        splice: splice.clone(),
    }));
    *splice.ids.lock() = Some((a_id, b_id));

    debug!(a = a.serial(), b = b.serial(), "connections bridged");
    a.spawn_reader();
    b.spawn_reader();
}

/// Expose `connection` as a byte stream.
///
/// Inbound payloads are written into a buffer of `buffer` bytes; whatever
/// does not fit is discarded with a warning. Bytes written to the stream are
/// sent as data messages of at most `buffer` bytes. Shutting down the write
/// half closes the connection.
pub fn connection_to_streams(
    connection: Connection,
    buffer: usize,
) -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
    let buffer = buffer.max(1);
    let (outer, inner) = tokio::io::duplex(buffer);
    let (mut inner_read, mut inner_write) = tokio::io::split(inner);

    let inbound = connection.clone();
    tokio::spawn(async move {
        loop {
            match inbound.receive().await {
                Ok(Some(msg)) => {
                    let payload = msg.payload();
                    if payload.is_empty() {
                        continue;
                    }
                    match inner_write.write(payload).now_or_never() {
                        Some(Ok(written)) if written == payload.len() => {}
                        Some(Ok(written)) => {
                            warn!(
                                connection = inbound.serial(),
                                dropped = payload.len() - written,
                                "stream buffer full, discarding overflow"
                            );
                        }
                        Some(Err(_)) => break,
                        None => {
                            warn!(
                                connection = inbound.serial(),
                                dropped = payload.len(),
                                "stream buffer full, discarding overflow"
                            );
                        }
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        let _ = inner_write.shutdown().await;
    });

    let outbound = connection;
    tokio::spawn(async move {
        let mut chunk = vec![0u8; buffer];
        loop {
            match inner_read.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Err(err) = outbound.send(Message::data(chunk[..n].to_vec())).await {
                        debug!(connection = outbound.serial(), error = %err, "stream writer stopped");
                        break;
                    }
                }
            }
        }
        let _ = outbound.close().await;
    });

    tokio::io::split(outer)
}
