//! Outbound record publishing.

use crate::error::PublishError;
use async_trait::async_trait;
use p2p_wire::WireRecord;
use tokio::sync::mpsc;
use tracing::debug;

/// Accepts ordered batches of outbound records
#[async_trait]
pub trait WirePublisher: Send + Sync {
    /// Publish `records` in order
    async fn publish(&self, records: Vec<WireRecord>) -> Result<(), PublishError>;
}

/// Publisher feeding an in-process channel
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<WireRecord>,
}

impl ChannelPublisher {
    /// Create a publisher and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WireRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publisher over an existing sender
    pub fn from_sender(tx: mpsc::UnboundedSender<WireRecord>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl WirePublisher for ChannelPublisher {
    async fn publish(&self, records: Vec<WireRecord>) -> Result<(), PublishError> {
        for record in records {
            debug!(
                "Publishing {} {} -> {} session={}",
                record.message.kind(),
                record.header.source,
                record.header.destination,
                record.header.session_id
            );
            self.tx.send(record).map_err(|_| PublishError::Closed)?;
        }
        Ok(())
    }
}
