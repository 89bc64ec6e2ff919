//! Typed protocol values.

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Index of an instance within a run, in `[0, instances)`.
pub type InstanceId = usize;

/// A message in transit between two instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: InstanceId,
    pub target: InstanceId,
    /// Virtual time of the send request that created the message.
    pub send_time: Duration,
    pub payload: Bytes,
}

/// One decoded operation of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Send {
        target: InstanceId,
        payload: Bytes,
        time: Duration,
    },
    Receive {
        source: InstanceId,
        time: Duration,
    },
    ReceiveAny {
        time: Duration,
    },
}

/// Request discriminant, for logging and dispatch history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Send,
    Receive,
    ReceiveAny,
}

impl Request {
    /// Virtual timestamp of the request.
    pub fn time(&self) -> Duration {
        match self {
            Request::Send { time, .. }
            | Request::Receive { time, .. }
            | Request::ReceiveAny { time } => *time,
        }
    }

    /// Replace the virtual timestamp.
    pub fn set_time(&mut self, new_time: Duration) {
        match self {
            Request::Send { time, .. }
            | Request::Receive { time, .. }
            | Request::ReceiveAny { time } => *time = new_time,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Send { .. } => RequestKind::Send,
            Request::Receive { .. } => RequestKind::Receive,
            Request::ReceiveAny { .. } => RequestKind::ReceiveAny,
        }
    }

    /// Whether the instance waits for a [`Response`] after this request.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Request::Send { .. })
    }

    /// Human-readable description for traces.
    pub fn describe(&self) -> String {
        match self {
            Request::Send {
                target, payload, ..
            } => format!(
                "sending a message ({} bytes) to instance {}",
                payload.len(),
                target
            ),
            Request::Receive { source, .. } => {
                format!("receiving a message from instance {}", source)
            }
            Request::ReceiveAny { .. } => "receiving a message from any instance".to_string(),
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::Send => "send",
            RequestKind::Receive => "receive",
            RequestKind::ReceiveAny => "receive-any",
        };
        write!(f, "{}", name)
    }
}

/// Answer to a receive request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub message: Message,
}

/// Session header as seen by an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHeader {
    pub node_count: usize,
    pub node_id: InstanceId,
}
