//! The seam between the protocol core and whatever carries the bytes.
//!
//! A transport only has to push bytes out and deliver inbound frames, one
//! [`LinkEvent::Frame`] per notification, already reassembled at the link
//! layer. Connection loss is reported on the same channel so that it is
//! ordered with respect to the frames that preceded it.

use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Something emitted by the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One inbound notification.
    Frame(Vec<u8>),
    /// The peripheral went away.
    Disconnected,
    /// The radio (or the adapter) was switched off.
    PoweredOff,
}

/// Write side of a link that permits a single outstanding round trip.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes one frame. Errors surface as [`crate::Error::WriteFailed`].
    async fn write(&self, frame: &[u8]) -> Result<()>;

    /// Tears the link down. The default does nothing.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// An open link: where to write, and where inbound events arrive.
pub struct Link {
    pub transport: Arc<dyn Transport>,
    pub events: UnboundedReceiver<LinkEvent>,
}

impl Link {
    pub fn new(transport: Arc<dyn Transport>, events: UnboundedReceiver<LinkEvent>) -> Self {
        Self { transport, events }
    }
}

/// Channel a transport feeds its [`LinkEvent`]s into.
pub fn event_channel() -> (UnboundedSender<LinkEvent>, UnboundedReceiver<LinkEvent>) {
    mpsc::unbounded_channel()
}
