//! Instance wire protocol.
//!
//! Every instance talks to the coordinator over a pair of pipes using a small
//! little-endian binary protocol:
//!
//! ```text
//! coordinator -> instance, once:   [u32 magic][i32 node_count][i32 node_id]
//! instance -> coordinator, send:   [u8 3][i32 target][i32 time_ms][i32 len][len bytes]
//! instance -> coordinator, recv:   [u8 4][i32 source (-1 = any)][i32 time_ms]
//! coordinator -> instance, reply:  [u32 magic+1][i32 source][i32 len][len bytes]
//! ```
//!
//! - **types**: typed messages, requests and responses
//! - **codec**: coordinator-side framing
//! - **client**: instance-side framing

pub mod client;
pub mod codec;
pub mod types;

pub use client::NodeClient;
pub use codec::{read_request, write_header, write_response};
pub use types::{InstanceId, Message, Request, RequestKind, Response, SessionHeader};
