//! The cluster's job scheduler role.
//!
//! The scheduler hands out job numbers, places each job's ranks on nodes,
//! and holds a lease with every job's frontend. It does not run backends
//! itself: each `assignBackend` tells the frontend where to launch one.

pub mod assigner;
pub mod job;
pub mod queue;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelEvent, ChannelGroup, ChannelId, JobProxy};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::lease::Lease;
use crate::protocol::{FrontendMessage, Message};

pub use assigner::NodeAssigner;
pub use job::{Job, JobRequest, JobStatus, Placement};
pub use queue::JobTable;

const FLUSH_GRACE: Duration = Duration::from_secs(2);

/// Events raised by the scheduler's own timers.
#[derive(Debug)]
enum SchedulerEvent {
    LeaseExpired(u64),
}

pub struct JobScheduler {
    config: SchedulerConfig,
    group: ChannelGroup,
    jobs: JobTable,
    nodes: NodeAssigner,
    frontends: HashMap<u64, JobProxy>,
    leases: HashMap<u64, Lease>,
    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    events_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
}

impl JobScheduler {
    pub async fn bind(config: SchedulerConfig) -> Result<Self> {
        config.lease.validate()?;
        let group = ChannelGroup::bind(config.listen_addr).await?;
        let nodes = NodeAssigner::new(config.nodes.iter().cloned());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            group,
            jobs: JobTable::new(),
            nodes,
            frontends: HashMap::new(),
            leases: HashMap::new(),
            events_tx,
            events_rx,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.group.local_addr()
    }

    pub fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    pub fn nodes(&self) -> &NodeAssigner {
        &self.nodes
    }

    /// Serves frontends until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            addr = ?self.local_addr(),
            nodes = self.config.nodes.len(),
            "Job scheduler started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                inbound = self.group.recv() => {
                    let Some(inbound) = inbound else { break };
                    match inbound.event {
                        ChannelEvent::Message(msg) => self.handle_message(inbound.channel, msg).await,
                        ChannelEvent::Closed(error) => self.handle_closed(inbound.channel, error),
                    }
                }
            }
        }

        let active: Vec<u64> = self.jobs.active_jobs().iter().map(|j| j.number).collect();
        for number in active {
            self.cancel_job(number, "Job Scheduler shutting down", true);
        }
        self.group.flush(FLUSH_GRACE).await;
        tracing::info!("Job scheduler stopped");
        Ok(())
    }

    async fn handle_message(&mut self, channel: ChannelId, msg: Message) {
        let msg = match msg {
            Message::Frontend(msg) => msg,
            other => {
                tracing::warn!(channel = %channel, role = %other.role(), method = other.name(), "Ignoring message not sent by a frontend");
                return;
            }
        };
        match msg {
            FrontendMessage::RequestJob {
                user,
                nodes,
                procs,
                threads,
            } => {
                let request = JobRequest {
                    user,
                    nodes,
                    procs,
                    threads,
                };
                self.request_job(channel, request).await;
            }
            FrontendMessage::RenewLease => {
                if let Some(lease) = self
                    .jobs
                    .job_for_channel(channel)
                    .and_then(|n| self.leases.get(&n))
                {
                    lease.renew();
                }
            }
            FrontendMessage::JobFinished => {
                if let Some(number) = self.jobs.job_for_channel(channel) {
                    self.jobs.end_job(number, JobStatus::Finished, None);
                    self.release(number);
                    tracing::info!(job = number, "Job finished");
                }
            }
            FrontendMessage::CancelJob { reason } => {
                if let Some(number) = self.jobs.job_for_channel(channel) {
                    tracing::info!(job = number, reason = %reason, "Job cancelled by frontend");
                    self.cancel_job(number, &reason, false);
                }
            }
            FrontendMessage::BackendFailed { name } => {
                if !self.nodes.mark_failed(&name) {
                    tracing::warn!(node = %name, "backendFailed for unknown node");
                }
            }
            other => {
                tracing::warn!(channel = %channel, method = other.name(), "Unexpected message for the scheduler");
            }
        }
    }

    async fn request_job(&mut self, channel: ChannelId, request: JobRequest) {
        let Some(sender) = self.group.sender(channel).await else {
            tracing::debug!(channel = %channel, "requestJob from closed channel");
            return;
        };
        let frontend = JobProxy::new(sender.clone());
        if let Some(existing) = self.jobs.job_for_channel(channel) {
            tracing::warn!(job = existing, "Duplicate requestJob on one channel");
            self.cancel_job(existing, "Duplicate job request", true);
            return;
        }
        if request.procs == 0 || request.nodes == 0 {
            if let Err(e) = frontend.cancel_job("Job requests no processes") {
                tracing::debug!(error = %e, "cancelJob not sent");
            }
            return;
        }
        if self.jobs.is_full() {
            let removed = self.jobs.cleanup_finished_jobs();
            tracing::debug!(removed, "Dropped ended jobs from the job table");
        }
        let Some(number) = self.jobs.add_job(request.clone(), channel) else {
            if let Err(e) = frontend.cancel_job("Job Scheduler is at capacity") {
                tracing::debug!(error = %e, "cancelJob not sent");
            }
            return;
        };

        let host = sender
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "localhost".to_string());
        tracing::info!(job = number, user = %request.user, nodes = request.nodes, procs = request.procs, "Job requested");
        if let Err(e) = frontend.assign_job_number(number, &host) {
            tracing::debug!(job = number, error = %e, "assignJobNumber not sent");
        }
        self.frontends.insert(number, frontend.clone());
        self.start_lease(number, frontend.clone());

        let Some(placements) = self.nodes.assign(number, &request) else {
            let available = self.nodes.available_nodes().len();
            let reason = format!(
                "Not enough nodes: {} requested, {available} available",
                request.nodes.min(request.procs)
            );
            self.cancel_job(number, &reason, true);
            return;
        };
        for p in &placements {
            if let Err(e) =
                frontend.assign_backend(&p.node, &p.host, self.config.launch.clone(), p.threads)
            {
                tracing::debug!(job = number, error = %e, "assignBackend not sent");
                break;
            }
        }
        self.jobs.start_job(number, placements);
    }

    fn start_lease(&mut self, number: u64, frontend: JobProxy) {
        let mut lease = Lease::new(self.config.lease);
        let events = self.events_tx.clone();
        lease.start(
            move || {
                if let Err(e) = frontend.renew_lease() {
                    tracing::debug!(job = number, error = %e, "Frontend lease renewal not sent");
                }
            },
            async move {
                let _ = events.send(SchedulerEvent::LeaseExpired(number));
            },
        );
        self.leases.insert(number, lease);
    }

    fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::LeaseExpired(number) => {
                tracing::warn!(job = number, "Frontend lease expired");
                self.cancel_job(number, "Job frontend lease expired", true);
            }
        }
    }

    fn handle_closed(&mut self, channel: ChannelId, error: Option<crate::error::JobError>) {
        if let Some(number) = self.jobs.job_for_channel(channel) {
            if let Some(e) = &error {
                tracing::warn!(job = number, error = %e, "Frontend channel failed");
            }
            self.cancel_job(number, "Job frontend failed", false);
        }
    }

    /// Ends job `number` as cancelled. `notify` sends `cancelJob` to its frontend.
    fn cancel_job(&mut self, number: u64, reason: &str, notify: bool) {
        if !self.jobs.end_job(number, JobStatus::Cancelled, Some(reason.to_string())) {
            return;
        }
        if notify {
            if let Some(frontend) = self.frontends.get(&number) {
                if let Err(e) = frontend.cancel_job(reason) {
                    tracing::debug!(job = number, error = %e, "cancelJob not sent");
                }
            }
        }
        tracing::info!(job = number, reason, "Job cancelled");
        self.release(number);
    }

    fn release(&mut self, number: u64) {
        self.nodes.release(number);
        self.frontends.remove(&number);
        if let Some(mut lease) = self.leases.remove(&number) {
            lease.stop();
        }
    }
}
