//! A complete run: launch every instance, route their messages, supervise
//! them and summarize the outcome.
//!
//! The first fatal error anywhere in the run is latched and raises an abort
//! signal, upon which every supervisor kills its instance. Errors that are
//! only consequences of that shutdown (a bridge losing its router, a killed
//! child's exit status) are not reported.

use crate::bridge::{BridgeChannels, BridgeStats, InstanceBridge};
use crate::config::{Quotas, RunConfig, UndeliveredPolicy};
use crate::error::{ParleyError, Result};
use crate::instance::{
    spawn_instance, usage, FanoutBuffer, FanoutReader, InstanceStdio, LaunchSpec, OutputPlan,
    SpawnedInstance,
};
use crate::protocol::{InstanceId, Message};
use crate::router::{RouteReport, Router};
use futures::future::join_all;
use serde::Serialize;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Holds the first fatal error of a run and the abort signal.
struct FaultLatch {
    first: Mutex<Option<ParleyError>>,
    abort: watch::Sender<bool>,
}

impl FaultLatch {
    fn new() -> Self {
        let (abort, _) = watch::channel(false);
        Self {
            first: Mutex::new(None),
            abort,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<ParleyError>> {
        self.first
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `err` unless an earlier error is already latched, then abort.
    fn raise(&self, err: ParleyError) {
        {
            let mut first = self.slot();
            if first.is_none() {
                error!("Run failed: {}", err);
                *first = Some(err);
            } else {
                debug!("Ignoring error after abort: {}", err);
            }
        }
        self.abort.send_replace(true);
    }

    fn is_raised(&self) -> bool {
        *self.abort.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.abort.subscribe()
    }

    fn take(&self) -> Option<ParleyError> {
        self.slot().take()
    }
}

/// What happened to one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub id: InstanceId,
    pub stats: BridgeStats,
    /// User CPU time of the process, where the platform reports it.
    pub cpu_time: Option<Duration>,
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    #[serde(skip)]
    pub status: Option<ExitStatus>,
}

impl InstanceReport {
    /// Total virtual running time: the time of the instance's last request.
    pub fn virtual_time(&self) -> Duration {
        self.stats.last_request_time
    }
}

/// Outcome of a [`Session`].
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Reports of the instances that were started, by id.
    pub instances: Vec<InstanceReport>,
    /// Messages sent but never received.
    pub undelivered: Vec<Message>,
    pub requests_processed: u64,
    /// The first fatal error of the run.
    pub error: Option<ParleyError>,
}

impl RunSummary {
    fn failed(error: ParleyError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// The instance with the largest virtual time; the highest id on ties.
    pub fn longest_running(&self) -> Option<&InstanceReport> {
        self.instances.iter().max_by_key(|report| report.virtual_time())
    }

    /// Virtual duration of the whole run.
    pub fn duration(&self) -> Duration {
        self.longest_running()
            .map(InstanceReport::virtual_time)
            .unwrap_or_default()
    }

    /// The summary, or the run's error.
    pub fn into_result(mut self) -> Result<Self> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// Everything one instance supervisor needs.
struct InstanceContext {
    id: InstanceId,
    node_count: usize,
    quotas: Quotas,
    trace: bool,
    output: OutputPlan,
    stdin: FanoutReader,
    latch: Arc<FaultLatch>,
}

/// How an instance process ended.
struct Exit {
    status: Option<ExitStatus>,
    cpu_time: Option<Duration>,
}

/// Resolves once the run is aborted.
async fn aborted(abort: &mut watch::Receiver<bool>) {
    // The returned value guard is dropped here; it must not be held across
    // the caller's next await.
    let _ = abort.wait_for(|aborted| *aborted).await;
}

/// Read the CPU time of an exited child, then reap it. A failed exit is
/// fatal unless the run is already shutting down.
async fn collect_exit(id: InstanceId, child: &mut Child, latch: &FaultLatch) -> Exit {
    let cpu_time = usage::cpu_time(child).await;
    let status = match child.wait().await {
        Ok(status) => Some(status),
        Err(e) => {
            latch.raise(ParleyError::from(e).for_instance(id));
            None
        }
    };
    if let Some(status) = status {
        // A killed instance's status is a consequence, not a cause.
        if !status.success() && !latch.is_raised() {
            latch.raise(ParleyError::InstanceExit(status).for_instance(id));
        }
    }
    Exit { status, cpu_time }
}

impl InstanceContext {
    async fn supervise(
        self,
        spawned: SpawnedInstance,
        channels: BridgeChannels,
    ) -> (InstanceReport, Vec<Message>) {
        let InstanceContext {
            id,
            node_count,
            quotas,
            trace,
            output,
            stdin,
            latch,
        } = self;
        let SpawnedInstance {
            mut child,
            requests,
            responses,
            ..
        } = spawned;
        let mut abort = latch.subscribe();

        let feeding = child.stdin.take().map(|sink| tokio::spawn(stdin.copy_to(sink)));

        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let output = output.clone();
            let latch = latch.clone();
            forwarders.push(tokio::spawn(async move {
                if let Err(e) = output.forward_stdout(id, stdout).await {
                    latch.raise(e.for_instance(id));
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let output = output.clone();
            let latch = latch.clone();
            forwarders.push(tokio::spawn(async move {
                if let Err(e) = output.forward_stderr(id, stderr).await {
                    latch.raise(e.for_instance(id));
                }
            }));
        }

        let (exit_signal, exited) = watch::channel(false);
        let mut bridge = InstanceBridge::new(id, node_count, quotas)
            .with_trace(trace)
            .with_exit_signal(exited);
        let mut exit = None;
        let served = {
            let serve = bridge.run(requests, responses, channels);
            tokio::pin!(serve);
            // The process may die while its bridge waits on the router.
            let finished = tokio::select! {
                result = &mut serve => Some(result),
                waited = usage::wait_exited(&mut child) => {
                    if let Err(e) = waited {
                        debug!("Waiting for instance {} failed: {}", id, e);
                    }
                    exit = Some(collect_exit(id, &mut child, &latch).await);
                    None
                }
                _ = aborted(&mut abort) => None,
            };
            match finished {
                Some(result) => Some(result),
                None if exit.is_some() && !latch.is_raised() => {
                    // Drain what the instance wrote before exiting.
                    exit_signal.send_replace(true);
                    tokio::select! {
                        result = &mut serve => Some(result),
                        _ = aborted(&mut abort) => None,
                    }
                }
                None => None,
            }
        };
        match served {
            Some(Ok(())) => debug!("Instance {} closed its connection", id),
            Some(Err(e @ (ParleyError::MissingResponse | ParleyError::RouterClosed))) => {
                debug!("Instance {} was cut off by the router: {}", id, e);
            }
            Some(Err(e)) => latch.raise(e.for_instance(id)),
            None => debug!("Stopping instance {}", id),
        }

        let exit = match exit {
            Some(exit) => exit,
            None => {
                let waited = tokio::select! {
                    waited = usage::wait_exited(&mut child) => waited,
                    _ = aborted(&mut abort) => {
                        if let Err(e) = child.start_kill() {
                            debug!("Failed to kill instance {}: {}", id, e);
                        }
                        usage::wait_exited(&mut child).await
                    }
                };
                if let Err(e) = waited {
                    debug!("Waiting for instance {} failed: {}", id, e);
                }
                collect_exit(id, &mut child, &latch).await
            }
        };

        if let Some(feeding) = feeding {
            feeding.abort();
        }
        join_all(forwarders).await;

        let stats = bridge.stats();
        info!(
            "Instance {} finished at {:?} ({} messages, {} bytes sent, CPU time {:?})",
            id, stats.last_request_time, stats.messages_sent, stats.bytes_sent, exit.cpu_time
        );
        let report = InstanceReport {
            id,
            stats,
            cpu_time: exit.cpu_time,
            exit_code: exit.status.and_then(|s| s.code()),
            status: exit.status,
        };
        (report, bridge.take_undelivered())
    }
}

/// One run of a program as a group of communicating instances.
#[derive(Debug)]
pub struct Session {
    config: RunConfig,
    launch: LaunchSpec,
    output: OutputPlan,
}

impl Session {
    /// A session whose instances write directly to the coordinator's streams.
    pub fn new(config: RunConfig, launch: LaunchSpec) -> Self {
        Self {
            config,
            launch,
            output: OutputPlan::inherit(),
        }
    }

    pub fn with_output(mut self, output: OutputPlan) -> Self {
        self.output = output;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run all instances to completion, feeding each of them `stdin`.
    pub async fn run(self, stdin: FanoutBuffer) -> RunSummary {
        if let Err(e) = self.config.validate() {
            return RunSummary::failed(e);
        }
        let node_count = self.config.instances;
        info!(
            "Starting {} instance(s) of {}",
            node_count,
            self.launch.display_name()
        );

        let latch = Arc::new(FaultLatch::new());
        let (router, channels) = Router::new(node_count);
        let router_latch = latch.clone();
        let router = tokio::spawn(async move {
            let mut report = router.run().await;
            if let Some(e) = report.error.take() {
                router_latch.raise(e);
            }
            report
        });

        let stdio = InstanceStdio::for_plan(&self.output);
        let mut supervisors = Vec::with_capacity(node_count);
        // Instances never started simply look finished to the router.
        for (id, channels) in channels.into_iter().enumerate() {
            if latch.is_raised() {
                break;
            }
            let spawned = match spawn_instance(&self.launch, id, stdio) {
                Ok(spawned) => spawned,
                Err(e) => {
                    latch.raise(e.for_instance(id));
                    break;
                }
            };
            let context = InstanceContext {
                id,
                node_count,
                quotas: self.config.quotas,
                trace: self.config.trace,
                output: self.output.clone(),
                stdin: stdin.reader(),
                latch: latch.clone(),
            };
            supervisors.push(tokio::spawn(context.supervise(spawned, channels)));
        }

        let mut instances = Vec::with_capacity(supervisors.len());
        let mut unread = Vec::new();
        for (id, joined) in join_all(supervisors).await.into_iter().enumerate() {
            match joined {
                Ok((report, undelivered)) => {
                    instances.push(report);
                    unread.extend(undelivered);
                }
                Err(e) => latch.raise(
                    ParleyError::Other(format!("supervisor task failed: {}", e)).for_instance(id),
                ),
            }
        }
        let mut route = match router.await {
            Ok(route) => route,
            Err(e) => {
                latch.raise(ParleyError::Other(format!("router task failed: {}", e)));
                RouteReport::default()
            }
        };

        route.undelivered.extend(unread);
        let mut error = latch.take();
        report_undelivered(self.config.undelivered, &route.undelivered, &mut error);
        RunSummary {
            instances,
            undelivered: route.undelivered,
            requests_processed: route.requests_processed,
            error,
        }
    }
}

fn report_undelivered(
    policy: UndeliveredPolicy,
    undelivered: &[Message],
    error: &mut Option<ParleyError>,
) {
    if undelivered.is_empty() || policy == UndeliveredPolicy::Ignore {
        return;
    }
    for message in undelivered {
        warn!(
            "Message from instance {} to instance {} ({} bytes) was never received",
            message.source,
            message.target,
            message.payload.len()
        );
    }
    if policy == UndeliveredPolicy::Fail && error.is_none() {
        *error = Some(ParleyError::Undelivered {
            count: undelivered.len(),
        });
    }
}
