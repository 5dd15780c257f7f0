use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{JobError, Result};
use crate::protocol::LaunchInfo;

pub const DEFAULT_SCHEDULER_HOST: &str = "localhost";
pub const DEFAULT_SCHEDULER_PORT: u16 = 20618;
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_EXPIRE_INTERVAL: Duration = Duration::from_secs(150);

pub const ENV_SCHEDULER_HOST: &str = "CLUSTER_SCHEDULER_HOST";
pub const ENV_SCHEDULER_PORT: &str = "CLUSTER_SCHEDULER_PORT";
pub const ENV_BACKEND_FLAGS: &str = "CLUSTER_BACKEND_FLAGS";
pub const ENV_JOB_TIMEOUT: &str = "CLUSTER_JOB_TIMEOUT";
pub const ENV_CLASSPATH: &str = "CLUSTER_CLASSPATH";

/// Renew/expire intervals for one peer relationship.
///
/// The renew interval must be strictly shorter than the expire interval so
/// at least one renewal can land before the peer is declared dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    pub renew_interval: Duration,
    pub expire_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            renew_interval: DEFAULT_RENEW_INTERVAL,
            expire_interval: DEFAULT_EXPIRE_INTERVAL,
        }
    }
}

impl LeaseConfig {
    pub fn new(renew_interval: Duration, expire_interval: Duration) -> Result<Self> {
        let cfg = Self {
            renew_interval,
            expire_interval,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.renew_interval.is_zero() {
            return Err(JobError::Config("lease renew interval must be non-zero".into()));
        }
        if self.renew_interval >= self.expire_interval {
            return Err(JobError::Config(format!(
                "lease renew interval {:?} must be less than expire interval {:?}",
                self.renew_interval, self.expire_interval
            )));
        }
        Ok(())
    }
}

/// A cluster node the scheduler may hand out to jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub host: String,
    /// Number of cores; a backend with `Nt = 0` gets all of them.
    pub cores: u32,
}

impl NodeSpec {
    /// Parses `name[:host][:cores]`.
    pub fn parse(spec: &str) -> Option<Self> {
        let parts: Vec<&str> = spec.trim().split(':').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Some(Self {
                name: name.to_string(),
                host: name.to_string(),
                cores: 1,
            }),
            [name, host] if !name.is_empty() => Some(Self {
                name: name.to_string(),
                host: host.to_string(),
                cores: 1,
            }),
            [name, host, cores] if !name.is_empty() => Some(Self {
                name: name.to_string(),
                host: host.to_string(),
                cores: cores.parse().ok()?,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub listen_addr: SocketAddr,
    pub nodes: Vec<NodeSpec>,
    /// How nodes start a backend process.
    pub launch: LaunchInfo,
    pub lease: LeaseConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SCHEDULER_PORT)),
            nodes: Vec::new(),
            launch: LaunchInfo {
                program: "cluster-job".to_string(),
                flags: Vec::new(),
            },
            lease: LeaseConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_node(mut self, name: &str, host: &str, cores: u32) -> Self {
        self.nodes.push(NodeSpec {
            name: name.to_string(),
            host: host.to_string(),
            cores,
        });
        self
    }
}

/// Per-job settings for the frontend process.
#[derive(Debug, Clone)]
pub struct FrontendConfig {
    pub scheduler_host: String,
    pub scheduler_port: u16,
    /// Address the frontend listens on for backend connections.
    pub listen_addr: SocketAddr,
    /// Host name backends use to reach the frontend. When unset, the host
    /// the scheduler reports in `assignJobNumber` is used.
    pub advertised_host: Option<String>,
    pub user: String,
    pub nodes: u32,
    pub procs: u32,
    /// Threads per process; 0 means all cores of the node.
    pub threads: u32,
    pub has_frontend_comm: bool,
    pub main_class: String,
    pub args: Vec<String>,
    pub backend_flags: Vec<String>,
    pub job_timeout: Option<Duration>,
    pub classpath: Vec<PathBuf>,
    pub lease: LeaseConfig,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            scheduler_host: DEFAULT_SCHEDULER_HOST.to_string(),
            scheduler_port: DEFAULT_SCHEDULER_PORT,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertised_host: None,
            user: std::env::var("USER").unwrap_or_default(),
            nodes: 1,
            procs: 1,
            threads: 0,
            has_frontend_comm: false,
            main_class: String::new(),
            args: Vec::new(),
            backend_flags: Vec::new(),
            job_timeout: None,
            classpath: vec![PathBuf::from(".")],
            lease: LeaseConfig::default(),
        }
    }
}

impl FrontendConfig {
    pub fn new(main_class: impl Into<String>, procs: u32) -> Self {
        Self {
            main_class: main_class.into(),
            procs,
            nodes: procs,
            ..Default::default()
        }
    }

    /// Overlays the `CLUSTER_*` environment variables on the defaults.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Applies environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_SCHEDULER_HOST) {
            self.scheduler_host = host;
        }
        if let Some(port) = lookup(ENV_SCHEDULER_PORT) {
            self.scheduler_port = port
                .trim()
                .parse()
                .map_err(|_| JobError::Config(format!("{ENV_SCHEDULER_PORT}={port} is not a port")))?;
        }
        if let Some(flags) = lookup(ENV_BACKEND_FLAGS) {
            self.backend_flags = flags.split_whitespace().map(str::to_string).collect();
        }
        if let Some(secs) = lookup(ENV_JOB_TIMEOUT) {
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|_| JobError::Config(format!("{ENV_JOB_TIMEOUT}={secs} is not a number")))?;
            self.job_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(classpath) = lookup(ENV_CLASSPATH) {
            self.classpath = std::env::split_paths(&classpath).collect();
        }
        Ok(())
    }

    pub fn scheduler_addr(&self) -> String {
        format!("{}:{}", self.scheduler_host, self.scheduler_port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.procs == 0 {
            return Err(JobError::Config("process count must be at least 1".into()));
        }
        if self.nodes == 0 {
            return Err(JobError::Config("node count must be at least 1".into()));
        }
        if self.main_class.is_empty() {
            return Err(JobError::Config("main entry point is required".into()));
        }
        self.lease.validate()
    }
}

/// Launch parameters handed to a backend process on its node.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub frontend_addr: String,
    pub job_number: u64,
    pub rank: u32,
    pub threads: u32,
    /// Host name other processes use to reach this backend.
    pub advertised_host: String,
    /// Whether to open a frontend communicator endpoint.
    pub frontend_comm: bool,
    pub lease: LeaseConfig,
}

impl BackendConfig {
    pub fn new(frontend_addr: impl Into<String>, job_number: u64, rank: u32) -> Self {
        Self {
            frontend_addr: frontend_addr.into(),
            job_number,
            rank,
            threads: 1,
            advertised_host: "127.0.0.1".to_string(),
            frontend_comm: false,
            lease: LeaseConfig::default(),
        }
    }
}
