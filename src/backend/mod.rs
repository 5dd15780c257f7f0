//! The per-node backend role.
//!
//! A backend connects to its job's frontend, reports ready with its
//! addresses, and waits for `commenceJob`. It then runs the job's main entry
//! point, reports `backendFinished`, and exits when the frontend says the
//! job is over. Losing the frontend (lease expiry or a closed channel)
//! cancels the backend.

pub mod builtin;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{ChannelEvent, ChannelGroup, FrontendProxy};
use crate::config::BackendConfig;
use crate::error::{JobError, Result};
use crate::fileio::RemoteFiles;
use crate::lease::Lease;
use crate::protocol::{BackendAddresses, FrontendMessage, Message};
use crate::resource::{RemoteResources, ResourceResolver, ResourceSource};

const FLUSH_GRACE: Duration = Duration::from_secs(2);

/// An application entry point a backend can run.
#[async_trait]
pub trait JobMain: Send + Sync {
    async fn run(&self, ctx: BackendContext, args: Vec<String>) -> Result<()>;
}

/// Main entry points by name.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    mains: HashMap<String, Arc<dyn JobMain>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, main: Arc<dyn JobMain>) -> Self {
        self.register(name, main);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, main: Arc<dyn JobMain>) {
        self.mains.insert(name.into(), main);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobMain>> {
        self.mains.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.mains.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// What a running main entry point gets to work with.
pub struct BackendContext {
    pub rank: u32,
    pub size: u32,
    pub threads: u32,
    /// Every rank's addresses, indexed by rank.
    pub addresses: Vec<BackendAddresses>,
    /// The frontend communicator address, when the job has one.
    pub frontend_comm: Option<String>,
    /// Files on the frontend's filesystem, plus its stdout and stderr.
    pub files: RemoteFiles,
    pub resources: ResourceResolver,
    /// Listener behind this rank's world address.
    pub world: Option<TcpListener>,
    /// Listener behind this rank's frontend communicator address.
    pub frontend_listener: Option<TcpListener>,
}

impl std::fmt::Debug for BackendContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendContext")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("threads", &self.threads)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOutcome {
    Finished,
    Cancelled(String),
}

enum BackendEvent {
    LeaseExpired,
    MainDone(Result<()>),
}

pub struct JobBackend {
    config: BackendConfig,
    group: ChannelGroup,
    frontend: FrontendProxy,
    addresses: BackendAddresses,
    world: Option<TcpListener>,
    frontend_listener: Option<TcpListener>,
    files: RemoteFiles,
    remote: Arc<RemoteResources>,
    resources: ResourceResolver,
    tasks: TaskRegistry,
}

impl JobBackend {
    /// Opens this rank's listeners and connects to the frontend.
    pub async fn connect(
        config: BackendConfig,
        tasks: TaskRegistry,
        local: Arc<dyn ResourceSource>,
    ) -> Result<Self> {
        config.lease.validate()?;
        let any = SocketAddr::from(([0, 0, 0, 0], 0));
        let group = ChannelGroup::bind(any).await?;
        let world = TcpListener::bind(any).await?;
        let host = &config.advertised_host;
        let port_of = |addr: Option<SocketAddr>| addr.map(|a| a.port()).unwrap_or_default();

        let frontend_listener = if config.frontend_comm {
            Some(TcpListener::bind(any).await?)
        } else {
            None
        };
        let frontend_comm = match &frontend_listener {
            Some(listener) => Some(format!("{host}:{}", listener.local_addr()?.port())),
            None => None,
        };
        let addresses = BackendAddresses {
            middleware: format!("{host}:{}", port_of(group.local_addr())),
            world: format!("{host}:{}", world.local_addr()?.port()),
            frontend: frontend_comm,
        };

        let frontend = FrontendProxy::new(group.connect(&config.frontend_addr).await?);
        let files = RemoteFiles::new(frontend.clone());
        let remote = Arc::new(RemoteResources::new(frontend.clone()));
        let resources =
            ResourceResolver::new(local).with_remote(Arc::clone(&remote) as Arc<dyn ResourceSource>);
        tracing::info!(
            job = config.job_number,
            rank = config.rank,
            frontend = %config.frontend_addr,
            "Backend connected to frontend"
        );

        Ok(Self {
            config,
            group,
            frontend,
            addresses,
            world: Some(world),
            frontend_listener,
            files,
            remote,
            resources,
            tasks,
        })
    }

    pub fn addresses(&self) -> &BackendAddresses {
        &self.addresses
    }

    /// Runs this rank until the frontend ends the job.
    pub async fn run(mut self) -> Result<BackendOutcome> {
        let rank = self.config.rank;
        self.frontend.backend_ready(rank, self.addresses.clone())?;

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut lease = Lease::new(self.config.lease);
        {
            let frontend = self.frontend.clone();
            let events = events_tx.clone();
            lease.start(
                move || {
                    if let Err(e) = frontend.renew_lease() {
                        tracing::debug!(error = %e, "Frontend lease renewal not sent");
                    }
                },
                async move {
                    let _ = events.send(BackendEvent::LeaseExpired);
                },
            );
        }

        let frontend_channel = self.frontend.channel();
        let mut main_task: Option<JoinHandle<()>> = None;
        let outcome = loop {
            tokio::select! {
                Some(event) = events_rx.recv() => match event {
                    BackendEvent::LeaseExpired => {
                        break BackendOutcome::Cancelled("Job frontend failed".to_string());
                    }
                    BackendEvent::MainDone(Ok(())) => {
                        tracing::info!(rank, "Main entry point returned");
                        self.frontend.backend_finished()?;
                    }
                    BackendEvent::MainDone(Err(e)) => {
                        let reason = format!("Rank {rank} failed: {e}");
                        tracing::error!(rank, error = %e, "Main entry point failed");
                        self.frontend.cancel_job(&reason)?;
                    }
                },
                inbound = self.group.recv() => {
                    let Some(inbound) = inbound else {
                        break BackendOutcome::Cancelled("Job frontend failed".to_string());
                    };
                    match inbound.event {
                        ChannelEvent::Closed(error) if inbound.channel == frontend_channel => {
                            if let Some(e) = error {
                                tracing::warn!(rank, error = %e, "Frontend channel failed");
                            }
                            break BackendOutcome::Cancelled("Job frontend failed".to_string());
                        }
                        ChannelEvent::Closed(_) => {}
                        ChannelEvent::Message(Message::Frontend(msg)) if inbound.channel == frontend_channel => {
                            match msg {
                                FrontendMessage::CommenceJob { addresses, frontend_comm, main_class, args } => {
                                    if main_task.is_some() {
                                        self.frontend.cancel_job(&format!("Rank {rank} received commenceJob twice"))?;
                                        continue;
                                    }
                                    match self.commence(addresses, frontend_comm, &main_class, args, events_tx.clone()) {
                                        Ok(handle) => main_task = Some(handle),
                                        Err(e) => self.frontend.cancel_job(&e.to_string())?,
                                    }
                                }
                                FrontendMessage::RenewLease => lease.renew(),
                                FrontendMessage::CancelJob { reason } => {
                                    break BackendOutcome::Cancelled(reason);
                                }
                                FrontendMessage::JobFinished => break BackendOutcome::Finished,
                                FrontendMessage::ReportResource { name, content } => {
                                    self.remote.put(&name, content).await;
                                }
                                other => {
                                    let method = other.name();
                                    if !self.files.deliver(other).await {
                                        tracing::debug!(rank, method, "Dropped unmatched message");
                                    }
                                }
                            }
                        }
                        ChannelEvent::Message(other) => {
                            tracing::warn!(rank, channel = %inbound.channel, method = other.name(), "Ignoring message from unexpected peer");
                        }
                    }
                }
            }
        };

        lease.stop();
        if let Some(task) = main_task {
            task.abort();
        }
        match &outcome {
            BackendOutcome::Finished => tracing::info!(rank, "Backend finished"),
            BackendOutcome::Cancelled(reason) => {
                tracing::warn!(rank, reason = %reason, "Backend cancelled");
            }
        }
        self.group.flush(FLUSH_GRACE).await;
        Ok(outcome)
    }

    fn commence(
        &mut self,
        addresses: Vec<BackendAddresses>,
        frontend_comm: Option<String>,
        main_class: &str,
        args: Vec<String>,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<JoinHandle<()>> {
        let rank = self.config.rank;
        let main = self.tasks.get(main_class).ok_or_else(|| {
            JobError::Config(format!("Rank {rank}: unknown main entry point {main_class}"))
        })?;
        if addresses.len() <= rank as usize {
            return Err(JobError::ProtocolViolation(format!(
                "commenceJob address table has {} entries, rank is {rank}",
                addresses.len()
            )));
        }
        tracing::info!(rank, main = %main_class, procs = addresses.len(), "Commencing job");

        let ctx = BackendContext {
            rank,
            size: addresses.len() as u32,
            threads: self.config.threads,
            addresses,
            frontend_comm,
            files: self.files.clone(),
            resources: self.resources.clone(),
            world: self.world.take(),
            frontend_listener: self.frontend_listener.take(),
        };
        Ok(tokio::spawn(async move {
            let result = match std::panic::AssertUnwindSafe(main.run(ctx, args))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_) => Err(JobError::Cancelled("main entry point panicked".to_string())),
            };
            let _ = events.send(BackendEvent::MainDone(result));
        }))
    }
}
