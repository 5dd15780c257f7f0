use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Finished,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a frontend asked for in `requestJob`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub user: String,
    pub nodes: u32,
    pub procs: u32,
    /// Threads per process; 0 means all cores of the node.
    pub threads: u32,
}

/// One rank's place in a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub rank: u32,
    pub node: String,
    pub host: String,
    pub threads: u32,
}

/// The scheduler's record of one job.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub number: u64,
    pub request: JobRequest,
    pub status: JobStatus,
    #[serde(skip)]
    pub frontend: ChannelId,
    pub placements: Vec<Placement>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(number: u64, request: JobRequest, frontend: ChannelId) -> Self {
        Self {
            number,
            request,
            status: JobStatus::Pending,
            frontend,
            placements: Vec::new(),
            cancel_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Distinct node names this job runs on.
    pub fn nodes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.placements.iter().map(|p| p.node.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}
