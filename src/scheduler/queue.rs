use std::collections::HashMap;

use chrono::Utc;

use crate::channel::ChannelId;
use crate::scheduler::job::{Job, JobRequest, JobStatus, Placement};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Every job the scheduler knows about, keyed by job number.
#[derive(Debug)]
pub struct JobTable {
    jobs: HashMap<u64, Job>,
    next_number: u64,
    max_jobs: usize,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            next_number: 1,
            max_jobs,
        }
    }

    /// Records a new job and returns its number, or `None` at capacity.
    /// Job numbers start at 1 and are never reused.
    pub fn add_job(&mut self, request: JobRequest, frontend: ChannelId) -> Option<u64> {
        if self.jobs.len() >= self.max_jobs {
            return None;
        }
        let number = self.next_number;
        self.next_number += 1;
        self.jobs.insert(number, Job::new(number, request, frontend));
        Some(number)
    }

    pub fn get_job(&self, number: u64) -> Option<&Job> {
        self.jobs.get(&number)
    }

    /// The live job whose frontend is on `channel`.
    pub fn job_for_channel(&self, channel: ChannelId) -> Option<u64> {
        self.jobs
            .values()
            .find(|j| j.frontend == channel && !j.status.is_terminal())
            .map(|j| j.number)
    }

    pub fn start_job(&mut self, number: u64, placements: Vec<Placement>) -> bool {
        match self.jobs.get_mut(&number) {
            Some(job) if job.status == JobStatus::Pending => {
                job.placements = placements;
                job.status = JobStatus::Running;
                true
            }
            _ => false,
        }
    }

    /// Moves a live job to a terminal status. Returns false if the job is
    /// unknown or already ended.
    pub fn end_job(&mut self, number: u64, status: JobStatus, reason: Option<String>) -> bool {
        match self.jobs.get_mut(&number) {
            Some(job) if !job.status.is_terminal() => {
                job.status = status;
                job.cancel_reason = reason;
                job.completed_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    pub fn active_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .collect();
        jobs.sort_by_key(|j| j.number);
        jobs
    }

    /// Get all jobs sorted by job number
    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.number);
        jobs
    }

    /// Drops ended jobs. Returns the number removed.
    pub fn cleanup_finished_jobs(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| !job.status.is_terminal());
        before - self.jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}
