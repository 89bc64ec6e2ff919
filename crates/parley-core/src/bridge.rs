//! Per-instance bridge between the wire protocol and the router.
//!
//! A bridge owns one instance's pipe pair. It writes the session header,
//! then decodes requests one at a time, stamps them with the instance's
//! virtual time, hands them to the router and, for receives, waits for the
//! router's response and writes it back to the instance.
//!
//! # Virtual time
//!
//! The timestamp of a request is the clock the instance reported plus all the
//! time the instance has spent blocked so far. Blocking time grows whenever a
//! receive is answered by a message sent later (in virtual time) than the
//! receive was issued.
//!
//! # Instance exit
//!
//! Once the instance process has exited, the supervisor raises the bridge's
//! exit signal. Requests already written are still drained, but a receive is
//! no longer waited for. Messages the router hands over after that point, or
//! that cannot be written because the instance closed its end, are kept as
//! undelivered.

use crate::config::Quotas;
use crate::error::{InstanceFault, ParleyError, QuotaError, Result};
use crate::protocol::codec::{read_request, write_header, write_response};
use crate::protocol::{InstanceId, Message, Request, Response};
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Resolves once the exit signal is raised; never without one.
async fn exited(signal: &mut Option<watch::Receiver<bool>>) {
    let raised = match signal {
        Some(signal) => signal.wait_for(|exited| *exited).await.is_ok(),
        None => false,
    };
    if !raised {
        std::future::pending::<()>().await;
    }
}

/// What a bridge hands to the router: a request, or the fault that ended it.
pub type RequestItem = std::result::Result<Request, InstanceFault>;

/// Counters kept for one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    /// Virtual time spent waiting for messages.
    pub time_blocked: Duration,
    /// Virtual time of the latest request, blocking time included.
    pub last_request_time: Duration,
}

/// The bridge's ends of the two router channels.
#[derive(Debug)]
pub struct BridgeChannels {
    pub requests: mpsc::Sender<RequestItem>,
    pub responses: mpsc::Receiver<Response>,
}

/// Translates one instance's byte streams into router requests.
#[derive(Debug)]
pub struct InstanceBridge {
    id: InstanceId,
    node_count: usize,
    quotas: Quotas,
    trace: bool,
    stats: BridgeStats,
    exit_signal: Option<watch::Receiver<bool>>,
    undelivered: Vec<Message>,
}

impl InstanceBridge {
    /// Create a bridge for instance `id` of a run with `node_count` instances.
    pub fn new(id: InstanceId, node_count: usize, quotas: Quotas) -> Self {
        Self {
            id,
            node_count,
            quotas,
            trace: false,
            stats: BridgeStats::default(),
            exit_signal: None,
            undelivered: Vec::new(),
        }
    }

    /// Log every request and response.
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Stop waiting for responses once `exited` turns true.
    pub fn with_exit_signal(mut self, exited: watch::Receiver<bool>) -> Self {
        self.exit_signal = Some(exited);
        self
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Counters so far; final once [`run`](Self::run) has returned.
    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    /// Messages routed to this instance that it never read.
    pub fn take_undelivered(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.undelivered)
    }

    /// Serve the instance until it closes its request stream.
    ///
    /// A closed or broken pipe ends the bridge cleanly. Protocol and quota
    /// violations are forwarded to the router as faults and returned.
    pub async fn run<R, W>(&mut self, mut reader: R, mut writer: W, channels: BridgeChannels) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let BridgeChannels {
            requests,
            mut responses,
        } = channels;
        let mut exit_signal = self.exit_signal.take();

        match write_header(&mut writer, self.node_count, self.id).await {
            Err(e) if e.is_disconnect() => {
                debug!("Instance {} went away before reading its header", self.id);
                return Ok(());
            }
            other => other?,
        }

        loop {
            let mut request = match read_request(&mut reader, self.node_count).await {
                Ok(Some(request)) => request,
                Ok(None) => {
                    debug!("Instance {} closed its request stream", self.id);
                    return Ok(());
                }
                Err(e) if e.is_disconnect() => {
                    debug!("Instance {} request stream broke: {}", self.id, e);
                    return Ok(());
                }
                Err(ParleyError::Protocol(e)) => {
                    return Err(self.fail(&requests, InstanceFault::Protocol(e)).await);
                }
                Err(e) => return Err(e),
            };

            let time = (request.time() + self.stats.time_blocked).max(self.stats.last_request_time);
            request.set_time(time);
            self.stats.last_request_time = time;

            if self.trace {
                info!(
                    target: "parley::trace",
                    "At {:?} instance {}: {}",
                    time,
                    self.id,
                    request.describe()
                );
            }

            if let Request::Send { payload, .. } = &request {
                if let Err(e) = self.charge(payload.len()) {
                    return Err(self.fail(&requests, InstanceFault::Quota(e)).await);
                }
            }

            let expects_response = request.expects_response();
            if requests.send(Ok(request)).await.is_err() {
                return Err(ParleyError::RouterClosed);
            }
            if !expects_response {
                continue;
            }

            let response = tokio::select! {
                response = responses.recv() => response,
                _ = exited(&mut exit_signal) => {
                    debug!("Instance {} exited while waiting for a message", self.id);
                    // Anything routed from now on fails at the router instead.
                    responses.close();
                    while let Ok(response) = responses.try_recv() {
                        self.undelivered.push(response.message);
                    }
                    return Ok(());
                }
            };
            let message = match response {
                Some(response) => response.message,
                None => return Err(ParleyError::MissingResponse),
            };
            if message.send_time > time {
                self.stats.time_blocked += message.send_time - time;
            }
            if self.trace {
                info!(
                    target: "parley::trace",
                    "At {:?} instance {} received a message from instance {}",
                    message.send_time,
                    self.id,
                    message.source
                );
            }

            match write_response(&mut writer, &message).await {
                Err(e) if e.is_disconnect() => {
                    debug!("Instance {} went away before reading a response", self.id);
                    self.undelivered.push(message);
                    return Ok(());
                }
                other => other?,
            }
        }
    }

    /// Count one sent message against the quotas.
    fn charge(&mut self, bytes: usize) -> std::result::Result<(), QuotaError> {
        self.stats.messages_sent += 1;
        if self.stats.messages_sent > self.quotas.max_messages {
            return Err(QuotaError::MessageCount {
                limit: self.quotas.max_messages,
            });
        }
        self.stats.bytes_sent += bytes as u64;
        if self.stats.bytes_sent > self.quotas.max_bytes {
            return Err(QuotaError::MessageSize {
                limit: self.quotas.max_bytes,
            });
        }
        Ok(())
    }

    /// Tell the router about a fatal fault and produce the error to return.
    async fn fail(&self, requests: &mpsc::Sender<RequestItem>, fault: InstanceFault) -> ParleyError {
        debug!("Instance {} failed: {}", self.id, fault);
        // The router may already be gone; the caller still gets the error.
        let _ = requests.send(Err(fault.clone())).await;
        ParleyError::from(fault)
    }
}
