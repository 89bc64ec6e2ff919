//! Error types for parley.
//!
//! Protocol and quota failures have their own small, cloneable enums so a
//! bridge can hand a copy of its fault to the router while still returning the
//! original to its supervisor. Everything else funnels into [`ParleyError`].

use crate::protocol::InstanceId;
use std::process::ExitStatus;
use thiserror::Error;

/// Malformed traffic on an instance's request stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid size of a message to be sent: {0}")]
    InvalidSize(i32),

    #[error("invalid target instance in a send request: {0}")]
    InvalidTarget(i32),

    #[error("invalid source instance in a receive request: {0}")]
    InvalidSource(i32),

    #[error("invalid operation type 0x{0:x}")]
    InvalidOpcode(u8),

    #[error("stream ended in the middle of {0}")]
    Truncated(&'static str),

    #[error("bad magic number: expected {expected}, got {found}")]
    BadMagic { expected: u32, found: u32 },

    #[error("invalid session header: instance {node_id} of {node_count}")]
    InvalidHeader { node_count: i32, node_id: i32 },
}

/// Per-instance sending limits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("limit of sent messages exceeded ({limit})")]
    MessageCount { limit: u64 },

    #[error("limit of total sent message size exceeded ({limit} bytes)")]
    MessageSize { limit: u64 },
}

/// A fatal condition detected by a bridge, forwarded to the router so the
/// whole merge stops at once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstanceFault {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Quota(#[from] QuotaError),
}

/// Main error type for parley.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("quota exceeded: {0}")]
    Quota(#[from] QuotaError),

    #[error("all unfinished instances are blocked (waiting: {blocked:?})")]
    Deadlock { blocked: Vec<InstanceId> },

    #[error("instance {id}: {source}")]
    Instance {
        id: InstanceId,
        #[source]
        source: Box<ParleyError>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("process exited with {0}")]
    InstanceExit(ExitStatus),

    #[error("instance {owner} has already started writing the output")]
    ContestOutput { owner: InstanceId },

    #[error("{count} sent message(s) were never received")]
    Undelivered { count: usize },

    #[error("instance {target} issued a receive while another one is still pending")]
    DuplicateReceive { target: InstanceId },

    #[error("router shut down before the request could be delivered")]
    RouterClosed,

    #[error("no response was received for a receive request")]
    MissingResponse,

    #[error("failed to launch {program}: {message}")]
    Launch { program: String, message: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for parley operations.
pub type Result<T> = std::result::Result<T, ParleyError>;

impl From<std::io::Error> for ParleyError {
    fn from(err: std::io::Error) -> Self {
        ParleyError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<InstanceFault> for ParleyError {
    fn from(fault: InstanceFault) -> Self {
        match fault {
            InstanceFault::Protocol(e) => ParleyError::Protocol(e),
            InstanceFault::Quota(e) => ParleyError::Quota(e),
        }
    }
}

impl ParleyError {
    /// Attach the id of the instance concerned.
    pub fn for_instance(self, id: InstanceId) -> Self {
        match self {
            already @ ParleyError::Instance { .. } => already,
            other => ParleyError::Instance {
                id,
                source: Box::new(other),
            },
        }
    }

    /// The instance this error is attributed to, if any.
    pub fn instance_id(&self) -> Option<InstanceId> {
        match self {
            ParleyError::Instance { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// The innermost error, looking through instance attribution.
    pub fn root(&self) -> &ParleyError {
        match self {
            ParleyError::Instance { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the root cause is a quota violation rather than bad protocol.
    pub fn is_quota(&self) -> bool {
        matches!(self.root(), ParleyError::Quota(_))
    }

    /// Whether the root cause is malformed protocol traffic.
    pub fn is_protocol(&self) -> bool {
        matches!(self.root(), ParleyError::Protocol(_))
    }

    /// Whether this IO error just means the other side of a pipe went away.
    ///
    /// Such errors end an instance's session; they are not failures by
    /// themselves.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ParleyError::Io {
                source: Some(err), ..
            } => is_disconnect(err),
            _ => false,
        }
    }

    /// Process exit code for the command-line front end.
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            ParleyError::Config { .. } => 2,
            _ => 1,
        }
    }
}

pub(crate) fn is_disconnect(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ParleyError::from(ProtocolError::InvalidOpcode(0x7f));
        assert_eq!(err.to_string(), "protocol error: invalid operation type 0x7f");
    }

    #[test]
    fn test_instance_attribution() {
        let err = ParleyError::from(QuotaError::MessageCount { limit: 1000 }).for_instance(3);
        assert_eq!(err.instance_id(), Some(3));
        assert!(err.is_quota());
        assert!(!err.is_protocol());
        assert_eq!(
            err.to_string(),
            "instance 3: quota exceeded: limit of sent messages exceeded (1000)"
        );

        // Re-attributing keeps the original instance.
        let err = err.for_instance(7);
        assert_eq!(err.instance_id(), Some(3));
    }

    #[test]
    fn test_fault_conversion_keeps_kind() {
        let fault = InstanceFault::from(ProtocolError::Truncated("a send header"));
        let err = ParleyError::from(fault);
        assert!(err.is_protocol());

        let fault = InstanceFault::from(QuotaError::MessageSize { limit: 8 });
        assert!(ParleyError::from(fault).is_quota());
    }

    #[test]
    fn test_disconnect_detection() {
        let err = ParleyError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(err.is_disconnect());

        let err = ParleyError::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!err.is_disconnect());
    }

    #[test]
    fn test_deadlock_display() {
        let err = ParleyError::Deadlock {
            blocked: vec![0, 2],
        };
        assert_eq!(
            err.to_string(),
            "all unfinished instances are blocked (waiting: [0, 2])"
        );
        assert_eq!(err.exit_code(), 1);
    }
}
