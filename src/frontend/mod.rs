//! The per-job frontend coordinator.
//!
//! A [`JobFrontend`] asks the scheduler for nodes, launches one backend per
//! assigned rank, waits for every backend to report ready, broadcasts
//! `commenceJob`, and then waits for every backend to finish. Any failure
//! along the way cancels the whole job.
//!
//! # Concurrency
//!
//! One receive loop handles every inbound message. Lease and timeout
//! callbacks run on their own tasks and take the same state mutex. Anything
//! that ends the job records its reason under the lock, releases it, and
//! only then cancels the shutdown token; the loop then exits and sends the
//! final message set exactly once.

pub mod launcher;
pub mod state;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{BackendProxy, ChannelEvent, ChannelGroup, ChannelId, Inbound, SchedulerProxy};
use crate::config::FrontendConfig;
use crate::error::{JobError, Result};
use crate::fileio::FileServer;
use crate::protocol::{BackendMessage, Message, SchedulerMessage};
use crate::resource::{LocalResources, ResourceCache, ResourceEntry, ResourceSource};

pub use launcher::{BackendLauncher, LaunchRequest, SshLauncher};
pub use state::{BackendSummary, FinalMessages, FrontendState, JobState};

/// How long the final message set may take to reach the wire.
const FLUSH_GRACE: Duration = Duration::from_secs(5);

const SCHEDULER_FAILED: &str = "Job Scheduler failed";

/// What happened to the job, returned when the frontend exits.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_number: Option<u64>,
    pub cancel_reason: Option<String>,
    pub procs: u32,
    pub finished: u32,
    pub backends: Vec<BackendSummary>,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.cancel_reason.is_none() && self.finished == self.procs
    }
}

enum Flow {
    Continue,
    Done,
}

struct Inner {
    config: FrontendConfig,
    port: u16,
    state: Mutex<FrontendState>,
    shutdown: CancellationToken,
    launcher: Arc<dyn BackendLauncher>,
    files: FileServer,
    local: Arc<LocalResources>,
    resources: ResourceCache,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

/// Cancels a running frontend from outside its receive loop.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Weak<Inner>,
}

impl CancelHandle {
    /// Cancels the job with `reason` unless it has already ended.
    pub async fn cancel(&self, reason: &str) {
        if let Some(inner) = self.inner.upgrade() {
            cancel(&inner, reason).await;
        }
    }
}

pub struct JobFrontend {
    inner: Arc<Inner>,
    group: ChannelGroup,
}

impl JobFrontend {
    /// Binds the backend listener and connects to the scheduler.
    pub async fn connect(config: FrontendConfig, launcher: Arc<dyn BackendLauncher>) -> Result<Self> {
        Self::connect_with_files(config, launcher, FileServer::new()).await
    }

    pub async fn connect_with_files(
        config: FrontendConfig,
        launcher: Arc<dyn BackendLauncher>,
        files: FileServer,
    ) -> Result<Self> {
        config.validate()?;
        let group = ChannelGroup::bind(config.listen_addr).await?;
        let port = group
            .local_addr()
            .map(|a| a.port())
            .ok_or_else(|| JobError::Config("frontend listener has no address".into()))?;
        let scheduler_addr = config.scheduler_addr();
        let scheduler = SchedulerProxy::new(group.connect(&scheduler_addr).await?);
        tracing::info!(scheduler = %scheduler_addr, port, "Frontend connected to scheduler");

        let state = FrontendState::new(config.procs, config.lease, scheduler);
        let local = Arc::new(LocalResources::new(config.classpath.clone()));
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                port,
                state: Mutex::new(state),
                shutdown: CancellationToken::new(),
                launcher,
                files,
                local,
                resources: ResourceCache::new(),
                timeout_task: Mutex::new(None),
            }),
            group,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.group.local_addr()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Runs the job to completion or cancellation.
    pub async fn run(mut self) -> Result<JobOutcome> {
        let inner = Arc::clone(&self.inner);
        start(&inner).await?;

        let mut proxies: HashMap<ChannelId, BackendProxy> = HashMap::new();
        loop {
            let inbound = tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => break,
                inbound = self.group.recv() => inbound,
            };
            let Some(inbound) = inbound else {
                cancel(&inner, "All channels closed").await;
                break;
            };
            match dispatch(&inner, &self.group, &mut proxies, inbound).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => break,
                Err(e) => cancel(&inner, &e.to_string()).await,
            }
        }

        let outcome = terminate(&inner).await;
        self.group.flush(FLUSH_GRACE).await;
        Ok(outcome)
    }
}

async fn start(inner: &Arc<Inner>) -> Result<()> {
    let config = &inner.config;
    {
        let mut state = inner.state.lock().await;
        let scheduler = state.scheduler().clone();
        scheduler.request_job(&config.user, config.nodes, config.procs, config.threads)?;

        let weak = Arc::downgrade(inner);
        state.scheduler_lease_mut().start(
            move || {
                if let Err(e) = scheduler.renew_lease() {
                    tracing::debug!(error = %e, "Scheduler lease renewal not sent");
                }
            },
            async move {
                if let Some(inner) = weak.upgrade() {
                    cancel(&inner, SCHEDULER_FAILED).await;
                }
            },
        );
    }
    tracing::info!(
        user = %config.user,
        nodes = config.nodes,
        procs = config.procs,
        threads = config.threads,
        main = %config.main_class,
        "Requested job"
    );

    if let Some(timeout) = config.job_timeout {
        let weak = Arc::downgrade(inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                let reason = format!("Job timed out after {} seconds", timeout.as_secs());
                cancel(&inner, &reason).await;
            }
        });
        *inner.timeout_task.lock().await = Some(handle);
    }
    Ok(())
}

/// Records `reason` if it is the first cause, then wakes the receive loop.
async fn cancel(inner: &Inner, reason: &str) {
    let first = inner.state.lock().await.cancel(reason);
    if first {
        report_cancel(reason);
    }
    inner.shutdown.cancel();
}

fn report_cancel(reason: &str) {
    tracing::error!(reason, "Job cancelled");
    eprintln!("Job cancelled: {reason}");
}

/// Declares `rank` failed, informs the scheduler, and cancels the job.
async fn backend_failed(inner: &Inner, rank: u32, cause: &str) {
    let (failed, scheduler, reason) = {
        let mut state = inner.state.lock().await;
        match state.backend_failed(rank) {
            Ok(Some(failed)) => {
                let reason = state.cancel_reason().unwrap_or_default().to_string();
                (failed, state.scheduler().clone(), reason)
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(rank, error = %e, "Failure reported for unknown rank");
                return;
            }
        }
    };
    tracing::warn!(rank, node = ?failed.node, cause, "Backend failed");
    if let Some(node) = &failed.node {
        if let Err(e) = scheduler.backend_failed(node) {
            tracing::debug!(error = %e, "backendFailed not sent");
        }
    }
    if failed.first_cause {
        report_cancel(&reason);
    }
    inner.shutdown.cancel();
}

async fn dispatch(
    inner: &Arc<Inner>,
    group: &ChannelGroup,
    proxies: &mut HashMap<ChannelId, BackendProxy>,
    inbound: Inbound,
) -> Result<Flow> {
    let channel = inbound.channel;
    let scheduler_channel = inner.state.lock().await.scheduler().channel();
    match inbound.event {
        ChannelEvent::Closed(error) => {
            proxies.remove(&channel);
            on_closed(inner, channel, scheduler_channel, error).await;
            Ok(Flow::Continue)
        }
        ChannelEvent::Message(Message::Scheduler(msg)) => {
            if channel != scheduler_channel {
                return Err(JobError::ProtocolViolation(format!(
                    "{} on channel {channel}, which is not the scheduler",
                    msg.name()
                )));
            }
            on_scheduler(inner, msg).await?;
            Ok(Flow::Continue)
        }
        ChannelEvent::Message(Message::Backend(msg)) => {
            let proxy = match proxies.get(&channel) {
                Some(proxy) => proxy.clone(),
                None => {
                    let Some(sender) = group.sender(channel).await else {
                        tracing::debug!(channel = %channel, method = msg.name(), "Message from closed channel");
                        return Ok(Flow::Continue);
                    };
                    let proxy = BackendProxy::new(sender);
                    proxies.insert(channel, proxy.clone());
                    proxy
                }
            };
            on_backend(inner, channel, proxy, msg).await
        }
        ChannelEvent::Message(Message::Frontend(msg)) => Err(JobError::ProtocolViolation(format!(
            "{} from another frontend on channel {channel}",
            msg.name()
        ))),
    }
}

async fn on_closed(
    inner: &Inner,
    channel: ChannelId,
    scheduler_channel: ChannelId,
    error: Option<JobError>,
) {
    if channel == scheduler_channel {
        if let Some(e) = &error {
            tracing::warn!(error = %e, "Scheduler channel failed");
        }
        cancel(inner, SCHEDULER_FAILED).await;
        return;
    }
    let rank = {
        let state = inner.state.lock().await;
        state.registry().rank_for_channel(channel).filter(|&rank| {
            state
                .registry()
                .get(rank)
                .is_ok_and(|p| !p.state.is_terminal())
        })
    };
    match (rank, error) {
        (Some(rank), error) => {
            let cause = error.map_or_else(|| "channel closed".to_string(), |e| e.to_string());
            backend_failed(inner, rank, &cause).await;
        }
        (None, Some(e)) => {
            tracing::warn!(channel = %channel, error = %e, "Unbound channel failed");
        }
        (None, None) => {
            tracing::debug!(channel = %channel, "Channel closed");
        }
    }
}

async fn on_scheduler(inner: &Arc<Inner>, msg: SchedulerMessage) -> Result<()> {
    match msg {
        SchedulerMessage::AssignJobNumber { job_number, host } => {
            inner
                .state
                .lock()
                .await
                .assign_job_number(job_number, &host)?;
            tracing::info!(job = job_number, host = %host, "Job number assigned");
        }
        SchedulerMessage::AssignBackend {
            name,
            host,
            launch,
            threads,
        } => {
            let request = {
                let mut state = inner.state.lock().await;
                let Some(rank) = state.assign_backend(&name, &host, threads)? else {
                    return Ok(());
                };
                let job_number = state.job_number().unwrap_or_default();
                let frontend_host = inner
                    .config
                    .advertised_host
                    .clone()
                    .or_else(|| state.frontend_host().map(str::to_string))
                    .unwrap_or_else(|| "localhost".to_string());

                let weak = Arc::downgrade(inner);
                let expire_weak = weak.clone();
                state.registry_mut().get_mut(rank)?.lease.start(
                    move || renew_backend(weak.clone(), rank),
                    async move {
                        if let Some(inner) = expire_weak.upgrade() {
                            backend_failed(&inner, rank, "lease expired").await;
                        }
                    },
                );

                LaunchRequest {
                    rank,
                    job_number,
                    name,
                    host,
                    launch,
                    threads,
                    frontend_addr: format!("{frontend_host}:{}", inner.port),
                    flags: inner.config.backend_flags.clone(),
                    frontend_comm: inner.config.has_frontend_comm,
                }
            };
            tracing::info!(rank = request.rank, node = %request.name, host = %request.host, "Backend assigned");

            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let rank = request.rank;
                if let Err(e) = inner.launcher.launch(request).await {
                    backend_failed(&inner, rank, &e.to_string()).await;
                }
            });
        }
        SchedulerMessage::RenewLease => {
            inner.state.lock().await.scheduler_lease_mut().renew();
        }
        SchedulerMessage::CancelJob { reason } => {
            cancel(inner, &reason).await;
        }
    }
    Ok(())
}

/// Renew timer callback for one rank.
fn renew_backend(weak: Weak<Inner>, rank: u32) {
    tokio::spawn(async move {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let state = inner.state.lock().await;
        if let Some(backend) = state.registry().get(rank).ok().and_then(|p| p.backend.as_ref()) {
            if let Err(e) = backend.renew_lease() {
                tracing::debug!(rank, error = %e, "Backend lease renewal not sent");
            }
        }
    });
}

async fn on_backend(
    inner: &Arc<Inner>,
    channel: ChannelId,
    proxy: BackendProxy,
    msg: BackendMessage,
) -> Result<Flow> {
    match msg {
        BackendMessage::BackendReady { rank, addresses } => {
            let mut state = inner.state.lock().await;
            tracing::info!(rank, middleware = %addresses.middleware, "Backend ready");
            let commence = match state.backend_ready(channel, rank, proxy, addresses) {
                Ok(commence) => commence,
                // A known rank that misreports its readiness is that rank failing.
                Err(e @ JobError::ProtocolViolation(_)) if rank < state.procs() => {
                    drop(state);
                    backend_failed(inner, rank, &e.to_string()).await;
                    return Ok(Flow::Continue);
                }
                Err(e) => return Err(e),
            };
            if let Some(commence) = commence {
                let frontend_comm = inner
                    .config
                    .has_frontend_comm
                    .then(|| frontend_comm_addr(inner, &state));
                tracing::info!(procs = commence.backends.len(), "All backends ready, commencing job");
                for backend in &commence.backends {
                    backend.commence_job(
                        commence.addresses.clone(),
                        frontend_comm.clone(),
                        &inner.config.main_class,
                        &inner.config.args,
                    )?;
                }
            }
        }
        BackendMessage::BackendFinished => {
            let mut state = inner.state.lock().await;
            let done = state.backend_finished(channel)?;
            tracing::info!(
                finished = state.finished_count(),
                procs = state.procs(),
                "Backend finished"
            );
            if done {
                return Ok(Flow::Done);
            }
        }
        BackendMessage::RenewLease => {
            let state = inner.state.lock().await;
            match state.registry().rank_for_channel(channel) {
                Some(rank) => state.registry().get(rank)?.lease.renew(),
                None => tracing::debug!(channel = %channel, "Renewal from unbound channel"),
            }
        }
        BackendMessage::CancelJob { reason } => {
            cancel(inner, &reason).await;
        }
        BackendMessage::RequestResource { name } => {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let content = serve_resource(&inner, &name).await;
                if let Err(e) = proxy.report_resource(&name, content) {
                    tracing::debug!(name = %name, error = %e, "reportResource not sent");
                }
            });
        }
        file_op => inner.files.handle(proxy, file_op).await,
    }
    Ok(Flow::Continue)
}

/// Looks `name` up on the classpath once; later requests hit the cache.
async fn serve_resource(inner: &Inner, name: &str) -> Option<bytes::Bytes> {
    let local = Arc::clone(&inner.local);
    let found = inner
        .resources
        .get_with(name, || async move {
            let content = local.find(name).await?;
            Ok::<_, JobError>(Some(ResourceEntry::from(content)))
        })
        .await;
    match found {
        Ok(entry) => {
            let content = entry.into_option();
            tracing::debug!(name, found = content.is_some(), "Serving resource");
            content
        }
        Err(e) => {
            tracing::warn!(name, error = %e, "Resource lookup failed");
            None
        }
    }
}

fn frontend_comm_addr(inner: &Inner, state: &FrontendState) -> String {
    let host = inner
        .config
        .advertised_host
        .as_deref()
        .or(state.frontend_host())
        .unwrap_or("localhost");
    format!("{host}:{}", inner.port)
}

/// Sends the final message set and builds the outcome.
async fn terminate(inner: &Inner) -> JobOutcome {
    if let Some(handle) = inner.timeout_task.lock().await.take() {
        handle.abort();
    }
    let (final_messages, outcome) = {
        let mut state = inner.state.lock().await;
        let final_messages = state.terminate();
        let outcome = JobOutcome {
            job_number: state.job_number(),
            cancel_reason: state.cancel_reason().map(str::to_string),
            procs: state.procs(),
            finished: state.finished_count(),
            backends: state.summary(),
        };
        (final_messages, outcome)
    };

    match final_messages {
        Some(FinalMessages::Cancel {
            reason,
            backends,
            scheduler,
        }) => {
            for backend in &backends {
                if let Err(e) = backend.cancel_job(&reason) {
                    tracing::debug!(channel = %backend.channel(), error = %e, "cancelJob not sent");
                }
            }
            if let Err(e) = scheduler.cancel_job(&reason) {
                tracing::debug!(error = %e, "cancelJob not sent to scheduler");
            }
        }
        Some(FinalMessages::Finished {
            backends,
            scheduler,
        }) => {
            for backend in &backends {
                if let Err(e) = backend.job_finished() {
                    tracing::debug!(channel = %backend.channel(), error = %e, "jobFinished not sent");
                }
            }
            if let Err(e) = scheduler.job_finished() {
                tracing::debug!(error = %e, "jobFinished not sent to scheduler");
            }
            tracing::info!(job = ?outcome.job_number, "Job finished");
        }
        None => {}
    }
    outcome
}
