//! Handling of the instances' standard output and error.

use super::StdioMode;
use crate::error::{ParleyError, Result};
use crate::protocol::InstanceId;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::debug;

/// A writer shared between the forwarders of all instances.
pub type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Wrap a writer for sharing between forwarders.
pub fn shared_writer<W: AsyncWrite + Send + Unpin + 'static>(writer: W) -> SharedWriter {
    Arc::new(Mutex::new(Box::new(writer)))
}

/// Where the instances' standard output goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Only one instance may write; its output is passed through.
    #[default]
    Contest,
    /// Every instance writes straight to the coordinator's stream.
    All,
    /// Lines are prefixed with the stream name and instance id.
    Tagged,
    /// One file per instance.
    Files,
}

/// Where the instances' standard error goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StderrMode {
    #[default]
    All,
    Tagged,
    Files,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Contest => "contest",
            OutputMode::All => "all",
            OutputMode::Tagged => "tagged",
            OutputMode::Files => "files",
        }
    }
}

impl StderrMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StderrMode::All => "all",
            StderrMode::Tagged => "tagged",
            StderrMode::Files => "files",
        }
    }
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "contest" => Ok(OutputMode::Contest),
            "all" => Ok(OutputMode::All),
            "tagged" => Ok(OutputMode::Tagged),
            "files" => Ok(OutputMode::Files),
            other => Err(format!(
                "unknown output mode '{}' (expected contest, all, tagged or files)",
                other
            )),
        }
    }
}

impl FromStr for StderrMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "all" => Ok(StderrMode::All),
            "tagged" => Ok(StderrMode::Tagged),
            "files" => Ok(StderrMode::Files),
            other => Err(format!(
                "unknown output mode '{}' (expected all, tagged or files)",
                other
            )),
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for StderrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output base name used when none is given: the program path without its
/// extension.
pub fn default_prefix(program: &Path) -> PathBuf {
    program.with_extension("")
}

/// File receiving `stream` ("stdout" or "stderr") of instance `id`.
pub fn output_file(prefix: &Path, stream: &str, id: InstanceId) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(format!(".{}.{}", stream, id));
    PathBuf::from(name)
}

/// Standard output shared in contest mode: the first instance to write
/// becomes the owner, and nobody else may write afterwards.
struct ContestOutput {
    owner: OnceLock<InstanceId>,
    writer: SharedWriter,
}

#[derive(Clone)]
enum Sink {
    Inherit,
    Tagged { label: &'static str, writer: SharedWriter },
    Files { prefix: PathBuf, stream: &'static str },
    Contest(Arc<ContestOutput>),
}

impl Sink {
    fn stdio(&self) -> StdioMode {
        match self {
            Sink::Inherit => StdioMode::Inherit,
            _ => StdioMode::Piped,
        }
    }

    async fn forward<R: AsyncRead + Unpin>(&self, id: InstanceId, reader: R) -> Result<()> {
        match self {
            // Nothing to do: the child writes to our stream directly.
            Sink::Inherit => Ok(()),
            Sink::Tagged { label, writer } => forward_tagged(id, label, reader, writer).await,
            Sink::Files { prefix, stream } => {
                forward_to_file(&output_file(prefix, stream, id), reader).await
            }
            Sink::Contest(contest) => forward_contest(id, reader, contest).await,
        }
    }
}

/// Output handling for all instances of a run.
#[derive(Clone)]
pub struct OutputPlan {
    stdout: Sink,
    stderr: Sink,
}

impl fmt::Debug for OutputPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputPlan")
            .field("stdout", &self.stdout.stdio())
            .field("stderr", &self.stderr.stdio())
            .finish()
    }
}

impl Default for OutputPlan {
    fn default() -> Self {
        Self::inherit()
    }
}

impl OutputPlan {
    /// Let every instance write straight to the coordinator's streams.
    pub fn inherit() -> Self {
        Self {
            stdout: Sink::Inherit,
            stderr: Sink::Inherit,
        }
    }

    /// Plan writing to the coordinator's own stdout and stderr.
    pub fn new(stdout: OutputMode, stderr: StderrMode, prefix: impl Into<PathBuf>) -> Self {
        Self::with_writers(
            stdout,
            stderr,
            prefix,
            shared_writer(tokio::io::stdout()),
            shared_writer(tokio::io::stderr()),
        )
    }

    /// Plan writing to the given writers instead of the process streams.
    pub fn with_writers(
        stdout: OutputMode,
        stderr: StderrMode,
        prefix: impl Into<PathBuf>,
        out: SharedWriter,
        err: SharedWriter,
    ) -> Self {
        let prefix = prefix.into();
        let stdout = match stdout {
            OutputMode::All => Sink::Inherit,
            OutputMode::Tagged => Sink::Tagged {
                label: "STDOUT",
                writer: out,
            },
            OutputMode::Files => Sink::Files {
                prefix: prefix.clone(),
                stream: "stdout",
            },
            OutputMode::Contest => Sink::Contest(Arc::new(ContestOutput {
                owner: OnceLock::new(),
                writer: out,
            })),
        };
        let stderr = match stderr {
            StderrMode::All => Sink::Inherit,
            StderrMode::Tagged => Sink::Tagged {
                label: "STDERR",
                writer: err,
            },
            StderrMode::Files => Sink::Files {
                prefix,
                stream: "stderr",
            },
        };
        Self { stdout, stderr }
    }

    pub fn stdout_mode(&self) -> StdioMode {
        self.stdout.stdio()
    }

    pub fn stderr_mode(&self) -> StdioMode {
        self.stderr.stdio()
    }

    /// Forward instance `id`'s standard output until it is closed.
    pub async fn forward_stdout<R: AsyncRead + Unpin>(&self, id: InstanceId, reader: R) -> Result<()> {
        self.stdout.forward(id, reader).await
    }

    /// Forward instance `id`'s standard error until it is closed.
    pub async fn forward_stderr<R: AsyncRead + Unpin>(&self, id: InstanceId, reader: R) -> Result<()> {
        self.stderr.forward(id, reader).await
    }

    /// The instance owning the output in contest mode, once one has written.
    pub fn contest_owner(&self) -> Option<InstanceId> {
        match &self.stdout {
            Sink::Contest(contest) => contest.owner.get().copied(),
            _ => None,
        }
    }
}

async fn forward_tagged<R: AsyncRead + Unpin>(
    id: InstanceId,
    label: &str,
    reader: R,
    writer: &SharedWriter,
) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        if !line.ends_with(b"\n") {
            line.push(b'\n');
        }
        let mut out = writer.lock().await;
        out.write_all(format!("{} {}: ", label, id).as_bytes()).await?;
        out.write_all(&line).await?;
        out.flush().await?;
    }
}

async fn forward_to_file<R: AsyncRead + Unpin>(path: &Path, mut reader: R) -> Result<()> {
    let mut file = tokio::fs::File::create(path).await.map_err(|e| ParleyError::Io {
        message: format!("failed to create {}: {}", path.display(), e),
        source: Some(e),
    })?;
    let copied = tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;
    debug!("Wrote {} bytes to {}", copied, path.display());
    Ok(())
}

async fn forward_contest<R: AsyncRead + Unpin>(
    id: InstanceId,
    mut reader: R,
    contest: &ContestOutput,
) -> Result<()> {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let owner = *contest.owner.get_or_init(|| id);
        if owner != id {
            return Err(ParleyError::ContestOutput { owner });
        }
        let mut out = contest.writer.lock().await;
        out.write_all(&buf[..n]).await?;
        out.flush().await?;
    }
}
