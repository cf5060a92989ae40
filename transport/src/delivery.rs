use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use crate::message_header::{MessageFlags, MessageKind, PublicationId};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeliveryOutcome {
    /// The sample was written to the socket completely
    Delivered,
    /// The sample was discarded without being (completely) written
    Dropped,
}

/// The single notification for a sample handed to the transport. It resolves once every
///  message the sample was sent in is either delivered or dropped.
pub struct DeliveryReceipt {
    rx: oneshot::Receiver<DeliveryOutcome>,
}

impl DeliveryReceipt {
    pub async fn outcome(self) -> DeliveryOutcome {
        self.rx.await
            .unwrap_or(DeliveryOutcome::Dropped)
    }

    /// `None` if the sample is still pending
    pub fn try_outcome(&mut self) -> Option<DeliveryOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(DeliveryOutcome::Dropped),
        }
    }
}

/// Shared by all fragments of a sample: each fragment resolves once, and the notification fires
///  when the last fragment is resolved. If any fragment was dropped, so is the sample.
pub struct DeliveryTracker {
    unresolved: AtomicUsize,
    any_dropped: AtomicBool,
    notifier: Mutex<Option<oneshot::Sender<DeliveryOutcome>>>,
}

impl DeliveryTracker {
    pub fn new(num_fragments: usize) -> (Arc<DeliveryTracker>, DeliveryReceipt) {
        assert!(num_fragments > 0);

        let (tx, rx) = oneshot::channel();
        let tracker = DeliveryTracker {
            unresolved: AtomicUsize::new(num_fragments),
            any_dropped: AtomicBool::new(false),
            notifier: Mutex::new(Some(tx)),
        };
        (Arc::new(tracker), DeliveryReceipt { rx })
    }

    pub fn resolve(&self, outcome: DeliveryOutcome) {
        if outcome == DeliveryOutcome::Dropped {
            self.any_dropped.store(true, Ordering::Release);
        }

        if self.unresolved.fetch_sub(1, Ordering::AcqRel) == 1 {
            let final_outcome = if self.any_dropped.load(Ordering::Acquire) {
                DeliveryOutcome::Dropped
            }
            else {
                DeliveryOutcome::Delivered
            };

            if let Some(tx) = self.notifier.lock().unwrap().take() {
                // the application may have discarded the receipt
                let _ = tx.send(final_outcome);
            }
        }
    }
}

/// An element in the send strategy's queue, i.e. a single message on the wire
pub struct QueueElement {
    pub kind: MessageKind,
    pub flags: MessageFlags,
    pub publication_id: PublicationId,
    pub payload: Bytes,
    /// `None` for control messages nobody waits for
    pub tracker: Option<Arc<DeliveryTracker>>,
}

impl QueueElement {
    pub fn resolve(&self, outcome: DeliveryOutcome) {
        if let Some(tracker) = &self.tracker {
            tracker.resolve(outcome);
        }
    }
}

/// Splits a sample's payload into messages of at most `max_message_size` bytes, all sharing a
///  single tracker. A payload that fits is sent as a single unfragmented message.
pub fn fragment(publication_id: PublicationId, payload: Bytes, max_message_size: usize) -> (Vec<QueueElement>, DeliveryReceipt) {
    if payload.len() <= max_message_size {
        let (tracker, receipt) = DeliveryTracker::new(1);
        let element = QueueElement {
            kind: MessageKind::SampleData,
            flags: MessageFlags::empty(),
            publication_id,
            payload,
            tracker: Some(tracker),
        };
        return (vec![element], receipt);
    }

    let num_fragments = payload.len().div_ceil(max_message_size);
    let (tracker, receipt) = DeliveryTracker::new(num_fragments);

    let elements = (0..num_fragments)
        .map(|i| {
            let mut flags = MessageFlags::FRAGMENTED;
            if i == 0 {
                flags |= MessageFlags::FIRST_FRAGMENT;
            }
            if i == num_fragments - 1 {
                flags |= MessageFlags::LAST_FRAGMENT;
            }

            let end = usize::min(payload.len(), (i+1) * max_message_size);
            QueueElement {
                kind: MessageKind::SampleData,
                flags,
                publication_id,
                payload: payload.slice(i*max_message_size .. end),
                tracker: Some(tracker.clone()),
            }
        })
        .collect();

    (elements, receipt)
}
