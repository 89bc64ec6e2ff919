//! Parley Core - run several instances of a program and route their messages.
//!
//! Every instance talks to the coordinator over a pair of pipes using a small
//! binary protocol: it can send a message to another instance, or receive the
//! next message from a given instance (or from any instance). Each request
//! carries the instance's own clock. The coordinator processes requests in
//! virtual time order, so a run is reproducible regardless of how the OS
//! schedules the processes, and it detects runs where every remaining
//! instance waits for a message that can never arrive.
//!
//! The pieces, bottom up:
//!
//! - [`protocol`]: wire format, codec and an instance-side client.
//! - [`bridge`]: per-instance translation between pipes and the router.
//! - [`router`]: the virtual-time merge and message delivery.
//! - [`instance`]: process launching and standard stream handling.
//! - `session`: one complete run (Unix only).
//!
//! # Example
//!
//! ```rust,ignore
//! use parley_core::{FanoutBuffer, LaunchSpec, RunConfig, Session};
//!
//! #[tokio::main]
//! async fn main() -> parley_core::Result<()> {
//!     let session = Session::new(RunConfig::new(4), LaunchSpec::new("./solution"));
//!     let summary = session.run(FanoutBuffer::from_bytes("input\n")).await;
//!     println!("Duration: {:?}", summary.duration());
//!     summary.into_result().map(|_| ())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod instance;
pub mod protocol;
pub mod router;
#[cfg(unix)]
pub mod session;

// Re-export commonly used types
pub use bridge::{BridgeChannels, BridgeStats, InstanceBridge};
pub use config::{LimitsConfig, ProtocolConfig, Quotas, RunConfig, UndeliveredPolicy};
pub use error::{InstanceFault, ParleyError, ProtocolError, QuotaError, Result};
pub use instance::{FanoutBuffer, OutputMode, OutputPlan, StderrMode};
#[cfg(unix)]
pub use instance::LaunchSpec;
pub use protocol::{InstanceId, Message, NodeClient, Request, RequestKind, Response};
pub use router::{Dispatch, RouteReport, Router};
#[cfg(unix)]
pub use session::{InstanceReport, RunSummary, Session};
