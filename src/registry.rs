//! Per-rank backend records owned by the frontend.
//!
//! The registry is a fixed-size arena indexed by rank. Records are created
//! for every rank up front, filled in as `assignBackend` and `backendReady`
//! arrive, and only ever move forward along
//! `NotStarted → Running → {Finished, Failed}` (`NotStarted → Failed` for a
//! backend that never came up).

use std::collections::HashMap;

use serde::Serialize;

use crate::channel::{BackendProxy, ChannelId};
use crate::config::LeaseConfig;
use crate::error::{JobError, Result};
use crate::lease::Lease;
use crate::protocol::BackendAddresses;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    NotStarted,
    Running,
    Finished,
    Failed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Finished | ProcessState::Failed)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::NotStarted => write!(f, "not started"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Finished => write!(f, "finished"),
            ProcessState::Failed => write!(f, "failed"),
        }
    }
}

/// One backend rank.
#[derive(Debug)]
pub struct ProcessInfo {
    pub rank: u32,
    /// Node name from `assignBackend`.
    pub name: Option<String>,
    pub host: Option<String>,
    pub threads: u32,
    pub state: ProcessState,
    pub backend: Option<BackendProxy>,
    pub addresses: Option<BackendAddresses>,
    pub lease: Lease,
}

impl ProcessInfo {
    fn new(rank: u32, lease: LeaseConfig) -> Self {
        Self {
            rank,
            name: None,
            host: None,
            threads: 0,
            state: ProcessState::NotStarted,
            backend: None,
            addresses: None,
            lease: Lease::new(lease),
        }
    }

    /// Node name for reports, or a placeholder before assignment.
    pub fn node_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unassigned>")
    }
}

#[derive(Debug)]
pub struct ProcessRegistry {
    procs: Vec<ProcessInfo>,
    channels: HashMap<ChannelId, u32>,
    next_unassigned: u32,
}

impl ProcessRegistry {
    pub fn new(procs: u32, lease: LeaseConfig) -> Self {
        Self {
            procs: (0..procs).map(|rank| ProcessInfo::new(rank, lease)).collect(),
            channels: HashMap::new(),
            next_unassigned: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn get(&self, rank: u32) -> Result<&ProcessInfo> {
        self.procs
            .get(rank as usize)
            .ok_or(JobError::UnknownRank(rank))
    }

    pub fn get_mut(&mut self, rank: u32) -> Result<&mut ProcessInfo> {
        self.procs
            .get_mut(rank as usize)
            .ok_or(JobError::UnknownRank(rank))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessInfo> {
        self.procs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ProcessInfo> {
        self.procs.iter_mut()
    }

    /// Records the next `assignBackend` against the lowest unassigned rank.
    pub fn assign(&mut self, name: &str, host: &str, threads: u32) -> Result<u32> {
        let rank = self.next_unassigned;
        let total = self.procs.len();
        let proc = self.procs.get_mut(rank as usize).ok_or_else(|| {
            JobError::ProtocolViolation(format!(
                "assignBackend for node {name} but all {total} ranks are assigned"
            ))
        })?;
        proc.name = Some(name.to_string());
        proc.host = Some(host.to_string());
        proc.threads = threads;
        self.next_unassigned += 1;
        Ok(rank)
    }

    /// `NotStarted → Running` on `backendReady`.
    pub fn mark_ready(
        &mut self,
        rank: u32,
        channel: ChannelId,
        backend: BackendProxy,
        addresses: BackendAddresses,
    ) -> Result<()> {
        if let Some(existing) = self.channels.get(&channel) {
            return Err(JobError::ProtocolViolation(format!(
                "backendReady for rank {rank} on channel {channel} already bound to rank {existing}"
            )));
        }
        let proc = self.get_mut(rank)?;
        if proc.name.is_none() {
            return Err(JobError::ProtocolViolation(format!(
                "backendReady from unassigned rank {rank}"
            )));
        }
        if proc.state != ProcessState::NotStarted {
            return Err(JobError::ProtocolViolation(format!(
                "backendReady from rank {rank} in state {}",
                proc.state
            )));
        }
        proc.state = ProcessState::Running;
        proc.backend = Some(backend);
        proc.addresses = Some(addresses);
        self.channels.insert(channel, rank);
        Ok(())
    }

    /// `Running → Finished` on `backendFinished` from `channel`.
    pub fn mark_finished(&mut self, channel: ChannelId) -> Result<u32> {
        let rank = self.rank_for_channel(channel).ok_or_else(|| {
            JobError::ProtocolViolation(format!(
                "backendFinished from channel {channel} with no ready backend"
            ))
        })?;
        let proc = self.get_mut(rank)?;
        if proc.state != ProcessState::Running {
            return Err(JobError::ProtocolViolation(format!(
                "backendFinished from rank {rank} in state {}",
                proc.state
            )));
        }
        proc.state = ProcessState::Finished;
        proc.lease.stop();
        Ok(rank)
    }

    /// Moves a live rank to `Failed`. Returns false if it was already terminal.
    pub fn mark_failed(&mut self, rank: u32) -> Result<bool> {
        let proc = self.get_mut(rank)?;
        if proc.state.is_terminal() {
            return Ok(false);
        }
        proc.state = ProcessState::Failed;
        proc.lease.stop();
        Ok(true)
    }

    pub fn rank_for_channel(&self, channel: ChannelId) -> Option<u32> {
        self.channels.get(&channel).copied()
    }

    pub fn count(&self, state: ProcessState) -> usize {
        self.procs.iter().filter(|p| p.state == state).count()
    }

    /// Ranks that have reported ready, whether or not they finished since.
    pub fn ready_count(&self) -> usize {
        self.channels.len()
    }

    /// The full rank-ordered address table, once every rank is ready.
    pub fn address_table(&self) -> Option<Vec<BackendAddresses>> {
        self.procs.iter().map(|p| p.addresses.clone()).collect()
    }

    /// Backends that can still be told about the end of the job.
    pub fn reachable_backends(&self) -> impl Iterator<Item = &BackendProxy> {
        self.procs
            .iter()
            .filter(|p| p.state != ProcessState::Failed)
            .filter_map(|p| p.backend.as_ref())
    }

    pub fn stop_all_leases(&mut self) {
        for proc in &mut self.procs {
            proc.lease.stop();
        }
    }
}
