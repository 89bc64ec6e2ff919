//! The time-ordered merge over all instances' request streams.
//!
//! Every instance is in one of three states. A free instance may issue a
//! request; before anything is dispatched the merge waits until every free
//! instance has either produced its next request or closed its stream. Only
//! then is the request with the smallest `(time, instance id)` dispatched.
//! A blocked instance has an unanswered receive and produces nothing until a
//! matching message arrives. A done instance has closed its stream.
//!
//! The merge ends when no instance is free. If some are still blocked at that
//! point they can never be woken, which is a deadlock.

use super::queue_set::{PendingReceive, QueueSet};
use super::Dispatch;
use crate::bridge::RequestItem;
use crate::error::{ParleyError, Result};
use crate::protocol::{InstanceId, Message, Request, Response};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstanceState {
    Free,
    Blocked,
    Done,
}

pub(crate) struct Merge {
    inputs: Vec<mpsc::Receiver<RequestItem>>,
    outputs: Vec<mpsc::Sender<Response>>,
    states: Vec<InstanceState>,
    next: Vec<Option<Request>>,
    queue_sets: Vec<QueueSet>,
    undelivered: Vec<Message>,
    history: Option<Vec<Dispatch>>,
    processed: u64,
    clock: Duration,
}

impl Merge {
    pub(crate) fn new(
        inputs: Vec<mpsc::Receiver<RequestItem>>,
        outputs: Vec<mpsc::Sender<Response>>,
        record_history: bool,
    ) -> Self {
        let n = inputs.len();
        Self {
            inputs,
            outputs,
            states: vec![InstanceState::Free; n],
            next: (0..n).map(|_| None).collect(),
            queue_sets: (0..n).map(|_| QueueSet::new()).collect(),
            undelivered: Vec::new(),
            history: record_history.then(Vec::new),
            processed: 0,
            clock: Duration::ZERO,
        }
    }

    /// Dispatch requests until every instance is done or an error stops the run.
    pub(crate) async fn run(&mut self) -> Result<()> {
        loop {
            self.fill().await?;
            let Some((id, request)) = self.take_earliest() else {
                return self.finish();
            };
            self.dispatch(id, request).await?;
        }
    }

    /// Wait for the next request of every free instance that has none buffered.
    async fn fill(&mut self) -> Result<()> {
        for id in 0..self.inputs.len() {
            if self.states[id] != InstanceState::Free || self.next[id].is_some() {
                continue;
            }
            match self.inputs[id].recv().await {
                Some(Ok(request)) => self.next[id] = Some(request),
                Some(Err(fault)) => return Err(ParleyError::from(fault).for_instance(id)),
                None => {
                    debug!("Instance {} finished", id);
                    self.states[id] = InstanceState::Done;
                }
            }
        }
        Ok(())
    }

    /// Remove the buffered request with the smallest `(time, id)`.
    fn take_earliest(&mut self) -> Option<(InstanceId, Request)> {
        let (_, id) = self
            .next
            .iter()
            .enumerate()
            .filter_map(|(id, request)| request.as_ref().map(|r| (r.time(), id)))
            .min()?;
        self.next[id].take().map(|request| (id, request))
    }

    async fn dispatch(&mut self, id: InstanceId, request: Request) -> Result<()> {
        let time = request.time();
        self.processed += 1;
        self.clock = self.clock.max(time);
        if let Some(history) = self.history.as_mut() {
            history.push(Dispatch {
                instance: id,
                time,
                kind: request.kind(),
            });
        }
        debug!("Dispatching at {:?} from instance {}: {}", time, id, request.describe());

        match request {
            Request::Send {
                target, payload, ..
            } => {
                self.queue_sets[target].push(Message {
                    source: id,
                    target,
                    send_time: time,
                    payload,
                });
                self.deliver(target).await;
                Ok(())
            }
            Request::Receive { source, .. } => {
                self.await_message(id, PendingReceive::From(source)).await
            }
            Request::ReceiveAny { .. } => self.await_message(id, PendingReceive::Any).await,
        }
    }

    async fn await_message(&mut self, id: InstanceId, receive: PendingReceive) -> Result<()> {
        if self.queue_sets[id].register(receive).is_err() {
            return Err(ParleyError::DuplicateReceive { target: id });
        }
        self.deliver(id).await;
        Ok(())
    }

    /// Answer `target`'s pending receive if a matching message is queued;
    /// otherwise leave it blocked.
    async fn deliver(&mut self, target: InstanceId) {
        match self.queue_sets[target].take_match() {
            Some(message) => {
                if let Err(mpsc::error::SendError(response)) =
                    self.outputs[target].send(Response { message }).await
                {
                    debug!("Instance {} went away before its message was delivered", target);
                    self.undelivered.push(response.message);
                }
                // A vanished bridge shows up as a closed input on the next fill.
                self.states[target] = InstanceState::Free;
            }
            None if self.queue_sets[target].is_waiting() => {
                self.states[target] = InstanceState::Blocked;
            }
            None => {}
        }
    }

    /// No instance is free any more; succeed unless some are stuck waiting.
    fn finish(&mut self) -> Result<()> {
        let mut blocked = Vec::new();
        for id in 0..self.states.len() {
            if self.states[id] != InstanceState::Blocked {
                continue;
            }
            if self.outputs[id].is_closed() {
                debug!("Blocked instance {} has already gone away", id);
                self.queue_sets[id].cancel_pending();
                self.states[id] = InstanceState::Done;
            } else {
                blocked.push(id);
            }
        }
        if blocked.is_empty() {
            Ok(())
        } else {
            warn!("Deadlock: instances {:?} are waiting for messages", blocked);
            Err(ParleyError::Deadlock { blocked })
        }
    }

    /// Release every channel and collect the messages nobody received.
    pub(crate) fn teardown(&mut self) -> Vec<Message> {
        self.outputs.clear();
        self.inputs.clear();
        let mut undelivered = std::mem::take(&mut self.undelivered);
        for queue_set in &mut self.queue_sets {
            undelivered.extend(queue_set.drain());
        }
        undelivered
    }

    pub(crate) fn processed(&self) -> u64 {
        self.processed
    }

    pub(crate) fn clock(&self) -> Duration {
        self.clock
    }

    pub(crate) fn take_history(&mut self) -> Option<Vec<Dispatch>> {
        self.history.take()
    }

    #[cfg(test)]
    pub(crate) fn states(&self) -> &[InstanceState] {
        &self.states
    }
}
