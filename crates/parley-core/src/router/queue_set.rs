//! Per-target message buffering.

use crate::protocol::{InstanceId, Message};
use std::collections::{BTreeMap, VecDeque};

/// A receive that could not be answered when it was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingReceive {
    From(InstanceId),
    Any,
}

/// Messages addressed to one instance, queued per source.
///
/// Sources are kept ordered so that a receive from any instance
/// deterministically takes the lowest source id that has something queued.
#[derive(Debug, Default)]
pub(crate) struct QueueSet {
    queues: BTreeMap<InstanceId, VecDeque<Message>>,
    pending: Option<PendingReceive>,
}

impl QueueSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Buffer a message sent to this instance.
    pub(crate) fn push(&mut self, message: Message) {
        self.queues
            .entry(message.source)
            .or_default()
            .push_back(message);
    }

    /// Register a receive. Fails with the already pending one if there is one.
    pub(crate) fn register(&mut self, receive: PendingReceive) -> Result<(), PendingReceive> {
        match self.pending {
            Some(existing) => Err(existing),
            None => {
                self.pending = Some(receive);
                Ok(())
            }
        }
    }

    /// Whether a registered receive is still unanswered.
    pub(crate) fn is_waiting(&self) -> bool {
        self.pending.is_some()
    }

    /// Answer the pending receive if a matching message is queued.
    pub(crate) fn take_match(&mut self) -> Option<Message> {
        let source = match self.pending? {
            PendingReceive::From(source) => source,
            PendingReceive::Any => *self.queues.keys().next()?,
        };
        let message = self.dequeue(source)?;
        self.pending = None;
        Some(message)
    }

    /// Forget the pending receive (its instance is gone).
    pub(crate) fn cancel_pending(&mut self) {
        self.pending = None;
    }

    /// Number of buffered messages.
    pub(crate) fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Remove and return every buffered message, ordered by source.
    pub(crate) fn drain(&mut self) -> Vec<Message> {
        self.pending = None;
        std::mem::take(&mut self.queues)
            .into_values()
            .flatten()
            .collect()
    }

    fn dequeue(&mut self, source: InstanceId) -> Option<Message> {
        let queue = self.queues.get_mut(&source)?;
        let message = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&source);
        }
        message
    }
}
