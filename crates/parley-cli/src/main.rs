//! Parley - run several instances of a program and route their messages.
//!
//! Every instance gets the same standard input and talks to the others
//! through the coordinator on fds 3 and 4. Logs and the final report go to
//! stderr; stdout belongs to the instances.

mod report;

use anyhow::Result;
use clap::Parser;
use parley_core::instance::default_prefix;
use parley_core::{
    FanoutBuffer, LaunchSpec, LimitsConfig, OutputMode, OutputPlan, ParleyError, Quotas,
    RunConfig, RunSummary, Session, StderrMode, UndeliveredPolicy,
};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(about = "Runs several instances of a program and routes their messages")]
struct Args {
    /// Number of instances to run
    #[arg(short = 'n', long, default_value_t = 1)]
    instances: usize,

    /// Handling of the instances' stdout: contest, all, tagged or files
    #[arg(long, default_value = "contest")]
    stdout: OutputMode,

    /// Handling of the instances' stderr: all, tagged or files
    #[arg(long, default_value = "all")]
    stderr: StderrMode,

    /// Base name of the output files (defaults to the program name)
    #[arg(long)]
    prefix: Option<PathBuf>,

    /// Handling of messages nobody received: ignore, warn or fail
    #[arg(long, default_value = "warn")]
    unreceived: UndeliveredPolicy,

    /// Print per-instance statistics
    #[arg(long)]
    print_stats: bool,

    /// Print statistics as JSON instead of a table
    #[arg(long)]
    stats_json: bool,

    /// Log every request and response
    #[arg(long)]
    trace_comm: bool,

    /// Maximum number of messages one instance may send
    #[arg(long, default_value_t = LimitsConfig::MESSAGE_COUNT_LIMIT)]
    max_messages: u64,

    /// Maximum total payload bytes one instance may send
    #[arg(long, default_value_t = LimitsConfig::MESSAGE_BYTES_LIMIT)]
    max_message_bytes: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Program to run
    program: PathBuf,

    /// Arguments passed to every instance
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Args {
    fn run_config(&self) -> RunConfig {
        RunConfig::new(self.instances)
            .with_quotas(Quotas {
                max_messages: self.max_messages,
                max_bytes: self.max_message_bytes,
            })
            .with_trace(self.trace_comm)
            .with_undelivered(self.unreceived)
    }

    fn output_plan(&self) -> OutputPlan {
        let prefix = self
            .prefix
            .clone()
            .unwrap_or_else(|| default_prefix(&self.program));
        OutputPlan::new(self.stdout, self.stderr, prefix)
    }
}

fn print_report(args: &Args, summary: &RunSummary) -> std::io::Result<()> {
    let mut err = std::io::stderr().lock();
    report::write_duration(&mut err, summary)?;
    if args.stats_json {
        report::write_json(&mut err, summary)?;
    } else if args.print_stats {
        report::write_table(&mut err, &summary.instances)?;
    }
    Ok(())
}

async fn run(args: &Args) -> Result<()> {
    let launch = LaunchSpec::new(&args.program).with_args(args.args.iter().cloned());
    let session = Session::new(args.run_config(), launch).with_output(args.output_plan());

    let input = FanoutBuffer::new();
    let pump = input.clone();
    tokio::spawn(async move {
        if let Err(e) = pump.pump(tokio::io::stdin()).await {
            debug!("Stopped reading stdin: {}", e);
        }
    });

    let summary = session.run(input).await;
    if !summary.instances.is_empty() {
        print_report(args, &summary)?;
    }
    summary.into_result()?;
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<ParleyError>()
        .map(ParleyError::exit_code)
        .unwrap_or(1)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug {
        Level::DEBUG
    } else if args.trace_comm {
        Level::INFO
    } else {
        Level::WARN
    };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let code = match run(&args).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code(&e)
        }
    };

    // The stdin reader may still be blocked; do not wait for it.
    let _ = std::io::stdout().flush();
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["parley", "./solution"]);
        assert_eq!(args.instances, 1);
        assert_eq!(args.stdout, OutputMode::Contest);
        assert_eq!(args.stderr, StderrMode::All);
        assert_eq!(args.unreceived, UndeliveredPolicy::Warn);
        assert_eq!(args.run_config(), RunConfig::new(1));
        assert!(args.args.is_empty());
    }

    #[test]
    fn test_program_arguments_are_passed_through() {
        let args = Args::parse_from([
            "parley", "-n", "4", "--stdout", "tagged", "./solution", "--verbose", "-x",
        ]);
        assert_eq!(args.instances, 4);
        assert_eq!(args.stdout, OutputMode::Tagged);
        assert_eq!(args.program, PathBuf::from("./solution"));
        assert_eq!(args.args, vec!["--verbose", "-x"]);
    }

    #[test]
    fn test_quota_flags() {
        let args = Args::parse_from([
            "parley",
            "--max-messages",
            "5",
            "--max-message-bytes",
            "64",
            "--unreceived",
            "fail",
            "prog",
        ]);
        let config = args.run_config();
        assert_eq!(config.quotas.max_messages, 5);
        assert_eq!(config.quotas.max_bytes, 64);
        assert_eq!(config.undelivered, UndeliveredPolicy::Fail);
    }

    #[test]
    fn test_invalid_mode_is_rejected() {
        assert!(Args::try_parse_from(["parley", "--stdout", "loud", "prog"]).is_err());
    }

    #[test]
    fn test_exit_code_of_config_error() {
        let err = anyhow::Error::new(ParleyError::Config {
            message: "bad".to_string(),
        });
        assert_eq!(exit_code(&err), 2);
        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }
}
