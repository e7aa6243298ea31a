//! Delivery strategies behind a `Connection`

use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::inbox::Inbox;
use super::Connection;
use crate::error::ConnErr;
use crate::message::{Codec, Message};
use crate::transport::abstraction::{Address, RawReader, RawWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Physical,
    Virtual,
    Local,
}

pub(crate) enum Link {
    Physical(PhysicalLink),
    Virtual(VirtualLink),
    Local(LocalLink),
}

impl Link {
    pub fn kind(&self) -> LinkKind {
        match self {
            Link::Physical(_) => LinkKind::Physical,
            Link::Virtual(_) => LinkKind::Virtual,
            Link::Local(_) => LinkKind::Local,
        }
    }
}

/// Frames messages directly onto a raw byte stream
pub(crate) struct PhysicalLink {
    reader: Mutex<Option<BufReader<RawReader>>>,
    writer: Mutex<Option<RawWriter>>,
    codec: Codec,
    pub peer: Option<Address>,
}

impl PhysicalLink {
    pub fn new(
        reader: BufReader<RawReader>,
        writer: RawWriter,
        peer: Option<Address>,
        codec: Codec,
    ) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            codec,
            peer,
        }
    }

    pub async fn write(&self, msg: &Message) -> Result<(), ConnErr> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ConnErr::Closed)?;
        self.codec.write_message(writer, msg).await?;
        Ok(())
    }

    pub async fn read(&self) -> Result<Message, ConnErr> {
        let mut reader = self.reader.lock().await;
        let reader = reader.as_mut().ok_or(ConnErr::Closed)?;
        Ok(self.codec.read_message(reader).await?)
    }

    /// Shut the write half down and drop both halves
    pub async fn release(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
    }
}

/// One logical channel multiplexed over a parent physical connection
pub(crate) struct VirtualLink {
    pub parent: Connection,
    pub id: String,
    pub inbox: Inbox,
}

/// In-process loopback: sends go straight into the peer's inbox
pub(crate) struct LocalLink {
    pub inbox: Arc<Inbox>,
    pub peer: Arc<Inbox>,
}
