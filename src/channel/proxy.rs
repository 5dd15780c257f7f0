//! Typed handles for calling methods on a remote role.
//!
//! Each proxy turns method calls into one-way messages tagged with the
//! caller's role. Replies, if any, arrive later as separate messages.

use bytes::Bytes;

use crate::channel::{ChannelId, ChannelSender};
use crate::error::Result;
use crate::protocol::{
    BackendAddresses, BackendMessage, FrontendMessage, LaunchInfo, SchedulerMessage,
};

/// A frontend's handle on the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerProxy {
    sender: ChannelSender,
}

impl SchedulerProxy {
    pub fn new(sender: ChannelSender) -> Self {
        Self { sender }
    }

    pub fn channel(&self) -> ChannelId {
        self.sender.id()
    }

    pub fn request_job(&self, user: &str, nodes: u32, procs: u32, threads: u32) -> Result<()> {
        self.sender.send(FrontendMessage::RequestJob {
            user: user.to_string(),
            nodes,
            procs,
            threads,
        })
    }

    pub fn renew_lease(&self) -> Result<()> {
        self.sender.send(FrontendMessage::RenewLease)
    }

    pub fn cancel_job(&self, reason: &str) -> Result<()> {
        self.sender.send(FrontendMessage::CancelJob {
            reason: reason.to_string(),
        })
    }

    pub fn job_finished(&self) -> Result<()> {
        self.sender.send(FrontendMessage::JobFinished)
    }

    pub fn backend_failed(&self, name: &str) -> Result<()> {
        self.sender.send(FrontendMessage::BackendFailed {
            name: name.to_string(),
        })
    }
}

/// The scheduler's handle on one job's frontend.
#[derive(Debug, Clone)]
pub struct JobProxy {
    sender: ChannelSender,
}

impl JobProxy {
    pub fn new(sender: ChannelSender) -> Self {
        Self { sender }
    }

    pub fn channel(&self) -> ChannelId {
        self.sender.id()
    }

    pub fn assign_job_number(&self, job_number: u64, host: &str) -> Result<()> {
        self.sender.send(SchedulerMessage::AssignJobNumber {
            job_number,
            host: host.to_string(),
        })
    }

    pub fn assign_backend(
        &self,
        name: &str,
        host: &str,
        launch: LaunchInfo,
        threads: u32,
    ) -> Result<()> {
        self.sender.send(SchedulerMessage::AssignBackend {
            name: name.to_string(),
            host: host.to_string(),
            launch,
            threads,
        })
    }

    pub fn renew_lease(&self) -> Result<()> {
        self.sender.send(SchedulerMessage::RenewLease)
    }

    pub fn cancel_job(&self, reason: &str) -> Result<()> {
        self.sender.send(SchedulerMessage::CancelJob {
            reason: reason.to_string(),
        })
    }
}

/// A frontend's handle on one backend.
#[derive(Debug, Clone)]
pub struct BackendProxy {
    sender: ChannelSender,
}

impl BackendProxy {
    pub fn new(sender: ChannelSender) -> Self {
        Self { sender }
    }

    pub fn channel(&self) -> ChannelId {
        self.sender.id()
    }

    pub fn commence_job(
        &self,
        addresses: Vec<BackendAddresses>,
        frontend_comm: Option<String>,
        main_class: &str,
        args: &[String],
    ) -> Result<()> {
        self.sender.send(FrontendMessage::CommenceJob {
            addresses,
            frontend_comm,
            main_class: main_class.to_string(),
            args: args.to_vec(),
        })
    }

    pub fn renew_lease(&self) -> Result<()> {
        self.sender.send(FrontendMessage::RenewLease)
    }

    pub fn cancel_job(&self, reason: &str) -> Result<()> {
        self.sender.send(FrontendMessage::CancelJob {
            reason: reason.to_string(),
        })
    }

    pub fn job_finished(&self) -> Result<()> {
        self.sender.send(FrontendMessage::JobFinished)
    }

    pub fn report_resource(&self, name: &str, content: Option<Bytes>) -> Result<()> {
        self.sender.send(FrontendMessage::ReportResource {
            name: name.to_string(),
            content,
        })
    }

    /// Sends a file operation result.
    pub fn send(&self, msg: FrontendMessage) -> Result<()> {
        self.sender.send(msg)
    }
}

/// A backend's handle on its frontend.
#[derive(Debug, Clone)]
pub struct FrontendProxy {
    sender: ChannelSender,
}

impl FrontendProxy {
    pub fn new(sender: ChannelSender) -> Self {
        Self { sender }
    }

    pub fn channel(&self) -> ChannelId {
        self.sender.id()
    }

    pub fn backend_ready(&self, rank: u32, addresses: BackendAddresses) -> Result<()> {
        self.sender
            .send(BackendMessage::BackendReady { rank, addresses })
    }

    pub fn backend_finished(&self) -> Result<()> {
        self.sender.send(BackendMessage::BackendFinished)
    }

    pub fn renew_lease(&self) -> Result<()> {
        self.sender.send(BackendMessage::RenewLease)
    }

    pub fn cancel_job(&self, reason: &str) -> Result<()> {
        self.sender.send(BackendMessage::CancelJob {
            reason: reason.to_string(),
        })
    }

    pub fn request_resource(&self, name: &str) -> Result<()> {
        self.sender.send(BackendMessage::RequestResource {
            name: name.to_string(),
        })
    }

    /// Sends a file operation request.
    pub fn send(&self, msg: BackendMessage) -> Result<()> {
        self.sender.send(msg)
    }
}
