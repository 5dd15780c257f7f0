//! The frontend's job state machine.
//!
//! [`FrontendState`] holds no I/O of its own. Each transition validates the
//! incoming event against the current state, mutates the registry, and
//! hands back what the coordinator must send. The coordinator owns it behind
//! a single mutex shared by the receive loop and every timer callback.

use serde::Serialize;

use crate::channel::{BackendProxy, ChannelId, SchedulerProxy};
use crate::config::LeaseConfig;
use crate::error::{JobError, Result};
use crate::lease::Lease;
use crate::protocol::BackendAddresses;
use crate::registry::{ProcessRegistry, ProcessState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Running,
    TerminateCancelJob,
    Terminating,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Running => write!(f, "running"),
            JobState::TerminateCancelJob => write!(f, "cancelling"),
            JobState::Terminating => write!(f, "terminating"),
        }
    }
}

/// The `commenceJob` broadcast, produced once when the last backend is ready.
#[derive(Debug)]
pub struct Commence {
    pub backends: Vec<BackendProxy>,
    pub addresses: Vec<BackendAddresses>,
}

/// A rank that has just been declared failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedBackend {
    pub rank: u32,
    /// Node name to report to the scheduler, when one was assigned.
    pub node: Option<String>,
    /// Whether this failure was the first cancellation cause.
    pub first_cause: bool,
}

/// The one message set sent when the job terminates.
#[derive(Debug)]
pub enum FinalMessages {
    /// `cancelJob(reason)` to every live backend and the scheduler.
    Cancel {
        reason: String,
        backends: Vec<BackendProxy>,
        scheduler: SchedulerProxy,
    },
    /// `jobFinished()` to every backend and the scheduler.
    Finished {
        backends: Vec<BackendProxy>,
        scheduler: SchedulerProxy,
    },
}

#[derive(Debug)]
pub struct FrontendState {
    state: JobState,
    cancel_reason: Option<String>,
    job_number: Option<u64>,
    /// Frontend host as seen by the scheduler.
    frontend_host: Option<String>,
    registry: ProcessRegistry,
    finished: u32,
    commenced: bool,
    scheduler: SchedulerProxy,
    scheduler_lease: Lease,
}

impl FrontendState {
    pub fn new(procs: u32, lease: LeaseConfig, scheduler: SchedulerProxy) -> Self {
        Self {
            state: JobState::Running,
            cancel_reason: None,
            job_number: None,
            frontend_host: None,
            registry: ProcessRegistry::new(procs, lease),
            finished: 0,
            commenced: false,
            scheduler,
            scheduler_lease: Lease::new(lease),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn job_number(&self) -> Option<u64> {
        self.job_number
    }

    pub fn frontend_host(&self) -> Option<&str> {
        self.frontend_host.as_deref()
    }

    pub fn finished_count(&self) -> u32 {
        self.finished
    }

    pub fn has_commenced(&self) -> bool {
        self.commenced
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ProcessRegistry {
        &mut self.registry
    }

    pub fn scheduler(&self) -> &SchedulerProxy {
        &self.scheduler
    }

    pub fn scheduler_lease_mut(&mut self) -> &mut Lease {
        &mut self.scheduler_lease
    }

    pub fn procs(&self) -> u32 {
        self.registry.len() as u32
    }

    /// Records the cancellation cause. Only the first cause while running
    /// counts; returns whether this call made the transition.
    pub fn cancel(&mut self, reason: &str) -> bool {
        if self.state != JobState::Running {
            return false;
        }
        self.state = JobState::TerminateCancelJob;
        self.cancel_reason = Some(reason.to_string());
        true
    }

    pub fn assign_job_number(&mut self, job_number: u64, host: &str) -> Result<()> {
        if let Some(existing) = self.job_number {
            return Err(JobError::ProtocolViolation(format!(
                "assignJobNumber({job_number}) but job number is already {existing}"
            )));
        }
        self.job_number = Some(job_number);
        self.frontend_host = Some(host.to_string());
        Ok(())
    }

    /// Records a backend assignment. Returns the rank to launch, or `None`
    /// once the job is no longer running.
    pub fn assign_backend(&mut self, name: &str, host: &str, threads: u32) -> Result<Option<u32>> {
        if self.job_number.is_none() {
            return Err(JobError::ProtocolViolation(format!(
                "assignBackend({name}) before assignJobNumber"
            )));
        }
        if !self.is_running() {
            return Ok(None);
        }
        self.registry.assign(name, host, threads).map(Some)
    }

    /// Records a `backendReady`. When this makes every rank ready, returns
    /// the `commenceJob` broadcast; it is produced at most once.
    pub fn backend_ready(
        &mut self,
        channel: ChannelId,
        rank: u32,
        backend: BackendProxy,
        addresses: BackendAddresses,
    ) -> Result<Option<Commence>> {
        self.registry.mark_ready(rank, channel, backend, addresses)?;
        if self.commenced
            || !self.is_running()
            || self.registry.ready_count() != self.registry.len()
        {
            return Ok(None);
        }
        let Some(addresses) = self.registry.address_table() else {
            return Ok(None);
        };
        self.commenced = true;
        let backends = self.registry.reachable_backends().cloned().collect();
        Ok(Some(Commence {
            backends,
            addresses,
        }))
    }

    /// Records a `backendFinished`. Returns true when every rank has finished.
    pub fn backend_finished(&mut self, channel: ChannelId) -> Result<bool> {
        self.registry.mark_finished(channel)?;
        self.finished += 1;
        Ok(self.finished as usize == self.registry.len())
    }

    /// Marks `rank` failed and records the job-wide cancellation. Returns
    /// `None` if the rank had already reached a terminal state.
    pub fn backend_failed(&mut self, rank: u32) -> Result<Option<FailedBackend>> {
        if !self.registry.mark_failed(rank)? {
            return Ok(None);
        }
        let node = self.registry.get(rank)?.name.clone();
        let first_cause = self.cancel(&format!("Backend failed, rank {rank}"));
        Ok(Some(FailedBackend {
            rank,
            node,
            first_cause,
        }))
    }

    /// Moves to `Terminating`, stops every lease, and returns the final
    /// message set. Later calls return `None`.
    pub fn terminate(&mut self) -> Option<FinalMessages> {
        if self.state == JobState::Terminating {
            return None;
        }
        let previous = self.state;
        self.state = JobState::Terminating;
        self.scheduler_lease.stop();
        self.registry.stop_all_leases();

        let backends: Vec<BackendProxy> = self.registry.reachable_backends().cloned().collect();
        let scheduler = self.scheduler.clone();
        Some(match previous {
            JobState::TerminateCancelJob => FinalMessages::Cancel {
                reason: self.cancel_reason.clone().unwrap_or_default(),
                backends,
                scheduler,
            },
            _ => FinalMessages::Finished {
                backends,
                scheduler,
            },
        })
    }

    /// Per-rank summary for the job report.
    pub fn summary(&self) -> Vec<BackendSummary> {
        self.registry
            .iter()
            .map(|p| BackendSummary {
                rank: p.rank,
                node: p.name.clone(),
                host: p.host.clone(),
                state: p.state,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendSummary {
    pub rank: u32,
    pub node: Option<String>,
    pub host: Option<String>,
    pub state: ProcessState,
}
