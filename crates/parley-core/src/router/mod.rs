//! Central message router.
//!
//! The router owns one request receiver and one response sender per
//! instance. It merges the request streams in virtual time order, buffers
//! sent messages per target and answers receives.
//!
//! ```no_run
//! # async fn demo() {
//! use parley_core::router::Router;
//!
//! let (router, channels) = Router::new(2);
//! // hand `channels[i]` to the bridge of instance i, then:
//! let report = router.run().await;
//! assert!(report.error.is_none());
//! # drop(channels);
//! # }
//! ```

mod merge;
mod queue_set;

use crate::bridge::{BridgeChannels, RequestItem};
use crate::config::LimitsConfig;
use crate::error::{ParleyError, Result};
use crate::protocol::{InstanceId, Message, RequestKind, Response};
use merge::Merge;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One dispatched request, as recorded in the router history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    pub instance: InstanceId,
    pub time: Duration,
    pub kind: RequestKind,
}

/// Outcome of a router run.
#[derive(Debug, Default)]
pub struct RouteReport {
    /// Why routing stopped early, if it did.
    pub error: Option<ParleyError>,
    /// Messages that were sent but never received.
    pub undelivered: Vec<Message>,
    /// Total requests dispatched.
    pub requests_processed: u64,
    /// Timestamp of the latest dispatched request.
    pub final_time: Duration,
    /// Dispatch order, when history recording is enabled.
    pub history: Option<Vec<Dispatch>>,
}

impl RouteReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Turn the report into the undelivered messages, or the routing error.
    pub fn into_result(self) -> Result<Vec<Message>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.undelivered),
        }
    }
}

/// Merges instance requests and delivers messages between instances.
pub struct Router {
    inputs: Vec<mpsc::Receiver<RequestItem>>,
    outputs: Vec<mpsc::Sender<Response>>,
    record_history: bool,
}

impl Router {
    /// Create a router for `node_count` instances together with the channel
    /// ends for their bridges, indexed by instance id.
    pub fn new(node_count: usize) -> (Self, Vec<BridgeChannels>) {
        let mut inputs = Vec::with_capacity(node_count);
        let mut outputs = Vec::with_capacity(node_count);
        let mut channels = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let (request_tx, request_rx) = mpsc::channel(LimitsConfig::CHANNEL_CAPACITY);
            let (response_tx, response_rx) = mpsc::channel(LimitsConfig::CHANNEL_CAPACITY);
            inputs.push(request_rx);
            outputs.push(response_tx);
            channels.push(BridgeChannels {
                requests: request_tx,
                responses: response_rx,
            });
        }
        let router = Self {
            inputs,
            outputs,
            record_history: false,
        };
        (router, channels)
    }

    /// Keep the order of dispatched requests in the report.
    pub fn record_history(mut self, enabled: bool) -> Self {
        self.record_history = enabled;
        self
    }

    pub fn node_count(&self) -> usize {
        self.inputs.len()
    }

    /// Route until every instance is done, a deadlock is detected or an
    /// instance faults.
    ///
    /// All response senders are dropped before this returns, so bridges
    /// still waiting for an answer see their channel close.
    pub async fn run(self) -> RouteReport {
        let node_count = self.node_count();
        debug!("Routing messages between {} instances", node_count);

        let mut merge = Merge::new(self.inputs, self.outputs, self.record_history);
        let error = merge.run().await.err();
        let undelivered = merge.teardown();

        let report = RouteReport {
            error,
            undelivered,
            requests_processed: merge.processed(),
            final_time: merge.clock(),
            history: merge.take_history(),
        };
        info!(
            "Router stopped after {} requests at {:?} ({} undelivered)",
            report.requests_processed,
            report.final_time,
            report.undelivered.len()
        );
        report
    }
}
