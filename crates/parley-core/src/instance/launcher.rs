//! Process launching with the protocol pipes installed.
//!
//! Each instance gets two pipes besides its standard streams. The instance
//! reads receive responses on fd 3 and writes its requests on fd 4; the
//! coordinator keeps the opposite ends as non-blocking tokio pipe handles.
//!
//! All four pipe descriptors are created close-on-exec so that no instance
//! inherits another instance's pipes. Only the two descriptors installed at
//! fd 3 and fd 4 survive the `exec` of the child.

#![allow(unsafe_code)]

use super::InstanceStdio;
use crate::config::ProtocolConfig;
use crate::error::{ParleyError, Result};
use crate::protocol::InstanceId;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Lowest descriptor used when moving the child's pipe ends out of the way.
const SCRATCH_FD: RawFd = 10;

/// What to run for every instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Path to the program under test.
    pub program: PathBuf,
    /// Arguments passed to every instance.
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// The program path as shown in messages.
    pub fn display_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// A running instance and the coordinator's ends of its protocol pipes.
#[derive(Debug)]
pub struct SpawnedInstance {
    pub id: InstanceId,
    pub child: Child,
    /// Requests written by the instance to its fd 4.
    pub requests: pipe::Receiver,
    /// Responses read by the instance from its fd 3.
    pub responses: pipe::Sender,
}

/// A pipe whose both ends are close-on-exec.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(|e| ParleyError::Io {
        message: format!("failed to create a pipe: {}", e),
        source: Some(e.into()),
    })
}

/// A pipe whose both ends are close-on-exec.
///
/// Without `pipe2()` there is a short window in which a concurrent fork may
/// inherit the descriptors.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let (read, write) = nix::unistd::pipe().map_err(|e| ParleyError::Io {
        message: format!("failed to create a pipe: {}", e),
        source: Some(e.into()),
    })?;
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| {
            ParleyError::Io {
                message: format!("failed to set close-on-exec on a pipe: {}", e),
                source: Some(e.into()),
            }
        })?;
    }
    Ok((read, write))
}

/// Start instance `id` of the program.
///
/// The child is killed when the returned [`Child`] is dropped.
pub fn spawn_instance(spec: &LaunchSpec, id: InstanceId, stdio: InstanceStdio) -> Result<SpawnedInstance> {
    let (response_read, response_write) = cloexec_pipe()?;
    let (request_read, request_write) = cloexec_pipe()?;

    let child_input = response_read.as_raw_fd();
    let child_output = request_write.as_raw_fd();

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(stdio.stdin.stdio())
        .stdout(stdio.stdout.stdio())
        .stderr(stdio.stderr.stdio())
        .kill_on_drop(true);

    // SAFETY: the closure only calls fcntl() and dup2(), both async-signal-safe,
    // on descriptors that stay open in the parent until spawn() returns. It
    // allocates nothing and touches no locks.
    unsafe {
        cmd.pre_exec(move || {
            // Move both ends above the target slots first, so installing one
            // cannot clobber the other.
            let input = libc::fcntl(child_input, libc::F_DUPFD_CLOEXEC, SCRATCH_FD);
            if input == -1 {
                return Err(std::io::Error::last_os_error());
            }
            let output = libc::fcntl(child_output, libc::F_DUPFD_CLOEXEC, SCRATCH_FD);
            if output == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // dup2() clears close-on-exec on the new descriptor.
            if libc::dup2(input, ProtocolConfig::INSTANCE_INPUT_FD) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::dup2(output, ProtocolConfig::INSTANCE_OUTPUT_FD) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| launch_error(&spec.program, e))?;
    info!(
        "Started instance {} of {} (pid {:?})",
        id,
        spec.program.display(),
        child.id()
    );

    // The child holds its own copies now.
    drop(response_read);
    drop(request_write);

    let requests = pipe::Receiver::from_owned_fd(request_read)?;
    let responses = pipe::Sender::from_owned_fd(response_write)?;
    debug!("Protocol pipes of instance {} are ready", id);

    Ok(SpawnedInstance {
        id,
        child,
        requests,
        responses,
    })
}

fn launch_error(program: &Path, err: std::io::Error) -> ParleyError {
    ParleyError::Launch {
        program: program.display().to_string(),
        message: err.to_string(),
    }
}
