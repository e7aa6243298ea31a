//! Connection events and listener delivery
//!
//! Events are handed to a per-connection dispatcher task so the operation that
//! raised them never waits on a listener. Each event carries the listener set
//! as it was when the event was raised.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::Connection;
use crate::message::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Sent(Message),
    Received(Message),
    /// An ERROR-typed message arrived; it is still returned by `receive`
    Error(Message),
    Closed,
}

impl ConnectionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionEvent::Sent(_) => "SENT",
            ConnectionEvent::Received(_) => "RECEIVED",
            ConnectionEvent::Error(_) => "ERROR",
            ConnectionEvent::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[async_trait]
pub trait ConnectionListener: Send + Sync {
    async fn on_event(&self, connection: &Connection, event: &ConnectionEvent);
}

/// Registration handle returned by `Connection::add_listener`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

pub(crate) struct EventJob {
    pub connection: Connection,
    pub listeners: Vec<Arc<dyn ConnectionListener>>,
    pub event: ConnectionEvent,
}

/// Lifecycle of the dispatcher task
pub(crate) enum Dispatch {
    Idle,
    Running(mpsc::UnboundedSender<EventJob>),
    /// CLOSED was queued; nothing else is delivered
    Finished,
}

impl Dispatch {
    /// Queue a job, starting the dispatcher on first use
    pub fn submit(&mut self, job: EventJob) {
        match self {
            Dispatch::Finished => {}
            Dispatch::Running(tx) => {
                let _ = tx.send(job);
            }
            Dispatch::Idle => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    return;
                };
                let (tx, rx) = mpsc::unbounded_channel();
                runtime.spawn(run_dispatcher(rx));
                let _ = tx.send(job);
                *self = Dispatch::Running(tx);
            }
        }
    }

    /// Queue the final job and release the channel
    pub fn finish(&mut self, job: Option<EventJob>) {
        if let Some(job) = job {
            self.submit(job);
        }
        *self = Dispatch::Finished;
    }
}

async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<EventJob>) {
    while let Some(job) = rx.recv().await {
        for listener in &job.listeners {
            listener.on_event(&job.connection, &job.event).await;
        }
    }
}
