//! Messages waiting for a session to be negotiated.

use crate::error::SessionManagerError;
use crate::publisher::WirePublisher;
use crate::session::Session;
use crate::types::{OutboundMessage, SessionCounterparties};
use async_trait::async_trait;
use dashmap::DashMap;
use p2p_wire::WireRecord;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Turns an application message into a wire record on a session
#[async_trait]
pub trait MessageRecorder: Send + Sync {
    /// Seal `message` on `session` and do the bookkeeping of a send
    async fn record_message(
        &self,
        message: &OutboundMessage,
        session: &Session,
    ) -> Result<WireRecord, SessionManagerError>;
}

type Queue = Arc<Mutex<VecDeque<OutboundMessage>>>;

/// Per-counterparties FIFO of messages awaiting negotiation
#[derive(Default)]
pub struct PendingMessageQueue {
    queues: DashMap<SessionCounterparties, Queue>,
}

impl PendingMessageQueue {
    /// Create an empty queue set
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, counterparties: &SessionCounterparties) -> Queue {
        self.queues
            .entry(counterparties.clone())
            .or_insert_with(Default::default)
            .clone()
    }

    /// Append a message for `counterparties`
    pub async fn queue_message(
        &self,
        counterparties: &SessionCounterparties,
        message: OutboundMessage,
    ) {
        let queue = self.queue(counterparties);
        let mut queue = queue.lock().await;
        queue.push_back(message);
        debug!(
            "Queued message for {} ({} waiting)",
            counterparties,
            queue.len()
        );
    }

    /// Append only if messages are already waiting for the pair, so a later
    /// message cannot overtake them. Hands the message back otherwise.
    pub async fn queue_if_pending(
        &self,
        counterparties: &SessionCounterparties,
        message: OutboundMessage,
    ) -> Option<OutboundMessage> {
        let Some(queue) = self.queues.get(counterparties).map(|q| q.clone()) else {
            return Some(message);
        };
        let mut queue = queue.lock().await;
        if queue.is_empty() {
            return Some(message);
        }
        queue.push_back(message);
        None
    }

    /// Number of messages waiting for the pair
    pub async fn pending_count(&self, counterparties: &SessionCounterparties) -> usize {
        match self.queues.get(counterparties).map(|q| q.clone()) {
            Some(queue) => queue.lock().await.len(),
            None => 0,
        }
    }

    /// Flush the messages of exactly `counterparties` onto `session`, in
    /// enqueue order. On failure the unpublished remainder goes back to the
    /// front of the queue; records already published stay published.
    pub async fn session_negotiated(
        &self,
        recorder: &dyn MessageRecorder,
        publisher: &dyn WirePublisher,
        counterparties: &SessionCounterparties,
        session: &Session,
    ) -> Result<usize, SessionManagerError> {
        let Some(shared) = self.queues.get(counterparties).map(|q| q.clone()) else {
            return Ok(0);
        };
        // Held for the whole flush so concurrent sends line up behind it
        let mut queue = shared.lock().await;
        if queue.is_empty() {
            drop(queue);
            drop(shared);
            self.discard_if_empty(counterparties);
            return Ok(0);
        }

        let drained: Vec<OutboundMessage> = queue.drain(..).collect();
        let mut records = Vec::with_capacity(drained.len());
        let mut failure = None;
        for message in &drained {
            match recorder.record_message(message, session).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let recorded = records.len();
        if let Err(e) = publisher.publish(records).await {
            warn!(
                "Flushing {} message(s) to {} failed: {}",
                drained.len(),
                counterparties,
                e
            );
            for message in drained.into_iter().rev() {
                queue.push_front(message);
            }
            return Err(e.into());
        }

        if let Some(e) = failure {
            warn!(
                "Recording message {} of {} for {} failed: {}",
                recorded + 1,
                drained.len(),
                counterparties,
                e
            );
            for message in drained.into_iter().skip(recorded).rev() {
                queue.push_front(message);
            }
            return Err(e);
        }

        debug!(
            "Flushed {} message(s) to {} on session {}",
            recorded,
            counterparties,
            session.id()
        );
        drop(queue);
        drop(shared);
        self.discard_if_empty(counterparties);
        Ok(recorded)
    }

    /// Forget the queue of a pair once it is empty and no caller holds it
    fn discard_if_empty(&self, counterparties: &SessionCounterparties) {
        let removed = self.queues.remove_if(counterparties, |_, queue| {
            Arc::strong_count(queue) == 1
                && queue.try_lock().map(|q| q.is_empty()).unwrap_or(false)
        });
        if removed.is_some() {
            debug!("Released empty queue for {}", counterparties);
        }
    }

    /// Pairs with a queue
    pub fn tracked_pairs(&self) -> usize {
        self.queues.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PublishError, SessionError};
    use crate::publisher::ChannelPublisher;
    use crate::session::{SessionDirection, SessionSnapshot};
    use p2p_wire::{HoldingIdentity, LinkHeader, LinkMessage, ProtocolMode, SessionId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records the payload as the message kind; fails on a chosen call
    struct TestRecorder {
        calls: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl TestRecorder {
        fn new(fail_on: Option<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on,
            }
        }
    }

    #[async_trait]
    impl MessageRecorder for TestRecorder {
        async fn record_message(
            &self,
            message: &OutboundMessage,
            session: &Session,
        ) -> Result<WireRecord, SessionManagerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if Some(call) == self.fail_on {
                return Err(SessionError::Encryption.into());
            }
            let data = session.seal(&message.message_id, &message.payload)?;
            Ok(WireRecord::new(
                LinkHeader {
                    source: message.counterparties.our_id.clone(),
                    destination: message.counterparties.counterparty_id.clone(),
                    session_id: session.id().clone(),
                },
                LinkMessage::Data(data),
            ))
        }
    }

    struct ClosedPublisher;

    #[async_trait]
    impl WirePublisher for ClosedPublisher {
        async fn publish(&self, _records: Vec<WireRecord>) -> Result<(), PublishError> {
            Err(PublishError::Closed)
        }
    }

    fn counterparties(serial: u64) -> SessionCounterparties {
        SessionCounterparties {
            serial,
            ..SessionCounterparties::new(
                HoldingIdentity::new("O=A", "G"),
                HoldingIdentity::new("O=B", "G"),
            )
        }
    }

    fn session() -> Session {
        Session::from_snapshot(SessionSnapshot {
            session_id: SessionId::random(),
            direction: SessionDirection::Outbound,
            our_identity: HoldingIdentity::new("O=A", "G"),
            peer_identity: HoldingIdentity::new("O=B", "G"),
            mode: ProtocolMode::AuthenticationOnly,
            send_key: [1u8; 32],
            receive_key: [2u8; 32],
        })
    }

    fn message(id: &str, c: &SessionCounterparties) -> OutboundMessage {
        OutboundMessage::new(id, id.as_bytes().to_vec(), c.clone())
    }

    fn message_id(record: &WireRecord) -> String {
        match &record.message {
            LinkMessage::Data(data) => data.message_id.clone(),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_flush_in_order_for_exact_counterparties() {
        let queue = PendingMessageQueue::new();
        let c = counterparties(1);
        let other = counterparties(2);

        for id in ["m1", "m2", "m3"] {
            queue.queue_message(&c, message(id, &c)).await;
        }
        queue.queue_message(&other, message("x1", &other)).await;

        let (publisher, mut rx) = ChannelPublisher::new();
        let flushed = queue
            .session_negotiated(&TestRecorder::new(None), &publisher, &c, &session())
            .await
            .unwrap();
        assert_eq!(flushed, 3);

        let published: Vec<String> = (0..3).map(|_| message_id(&rx.try_recv().unwrap())).collect();
        assert_eq!(published, vec!["m1", "m2", "m3"]);
        assert!(rx.try_recv().is_err());

        assert_eq!(queue.pending_count(&c).await, 0);
        assert_eq!(queue.pending_count(&other).await, 1);
    }

    #[tokio::test]
    async fn test_flushed_queue_is_released() {
        let queue = PendingMessageQueue::new();
        let (publisher, _rx) = ChannelPublisher::new();

        for n in 0..50 {
            let c = counterparties(n);
            queue.queue_message(&c, message("m1", &c)).await;
            queue
                .session_negotiated(&TestRecorder::new(None), &publisher, &c, &session())
                .await
                .unwrap();
        }
        assert_eq!(queue.tracked_pairs(), 0);

        // A failed flush keeps the queue
        let c = counterparties(1);
        queue.queue_message(&c, message("m1", &c)).await;
        let result = queue
            .session_negotiated(&TestRecorder::new(None), &ClosedPublisher, &c, &session())
            .await;
        assert!(result.is_err());
        assert_eq!(queue.tracked_pairs(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_requeues_remainder() {
        let queue = PendingMessageQueue::new();
        let c = counterparties(1);
        for id in ["m1", "m2", "m3"] {
            queue.queue_message(&c, message(id, &c)).await;
        }

        let (publisher, mut rx) = ChannelPublisher::new();
        let result = queue
            .session_negotiated(&TestRecorder::new(Some(1)), &publisher, &c, &session())
            .await;
        assert!(result.is_err());

        // m1 went out, m2 and m3 are back in order
        assert_eq!(message_id(&rx.try_recv().unwrap()), "m1");
        assert_eq!(queue.pending_count(&c).await, 2);

        queue
            .session_negotiated(&TestRecorder::new(None), &publisher, &c, &session())
            .await
            .unwrap();
        assert_eq!(message_id(&rx.try_recv().unwrap()), "m2");
        assert_eq!(message_id(&rx.try_recv().unwrap()), "m3");
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_everything() {
        let queue = PendingMessageQueue::new();
        let c = counterparties(1);
        queue.queue_message(&c, message("m1", &c)).await;
        queue.queue_message(&c, message("m2", &c)).await;

        let result = queue
            .session_negotiated(&TestRecorder::new(None), &ClosedPublisher, &c, &session())
            .await;
        assert!(result.is_err());
        assert_eq!(queue.pending_count(&c).await, 2);
    }

    #[tokio::test]
    async fn test_queue_if_pending() {
        let queue = PendingMessageQueue::new();
        let c = counterparties(1);

        assert!(queue.queue_if_pending(&c, message("m1", &c)).await.is_some());
        queue.queue_message(&c, message("m2", &c)).await;
        assert!(queue.queue_if_pending(&c, message("m3", &c)).await.is_none());
        assert_eq!(queue.pending_count(&c).await, 2);
    }
}
