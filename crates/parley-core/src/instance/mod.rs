//! Instance processes and their standard streams.

pub mod fanout;
#[cfg(unix)]
pub mod launcher;
pub mod output;
#[cfg(unix)]
pub mod usage;

pub use fanout::{FanoutBuffer, FanoutReader};
#[cfg(unix)]
pub use launcher::{spawn_instance, LaunchSpec, SpawnedInstance};
pub use output::{default_prefix, output_file, OutputMode, OutputPlan, StderrMode};

use std::process::Stdio;

/// How each standard stream of a child is set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    Inherit,
    Piped,
    Null,
}

impl StdioMode {
    pub fn stdio(self) -> Stdio {
        match self {
            StdioMode::Inherit => Stdio::inherit(),
            StdioMode::Piped => Stdio::piped(),
            StdioMode::Null => Stdio::null(),
        }
    }
}

/// Standard stream setup for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceStdio {
    pub stdin: StdioMode,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
}

impl Default for InstanceStdio {
    fn default() -> Self {
        Self {
            stdin: StdioMode::Piped,
            stdout: StdioMode::Inherit,
            stderr: StdioMode::Inherit,
        }
    }
}

impl InstanceStdio {
    /// Stream setup matching an output plan, with stdin fed by the coordinator.
    pub fn for_plan(plan: &OutputPlan) -> Self {
        Self {
            stdin: StdioMode::Piped,
            stdout: plan.stdout_mode(),
            stderr: plan.stderr_mode(),
        }
    }
}
