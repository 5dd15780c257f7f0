use bytes::Bytes;
use serde::Serialize;

/// The role that originated a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    Scheduler,
    Frontend,
    Backend,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Scheduler => write!(f, "scheduler"),
            Role::Frontend => write!(f, "frontend"),
            Role::Backend => write!(f, "backend"),
        }
    }
}

/// The three addresses a backend reports when it comes up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendAddresses {
    /// Control-plane address of the backend's middleware listener.
    pub middleware: String,
    /// Address of the peer "world" communicator, opaque to this layer.
    pub world: String,
    /// Address of the frontend communicator endpoint, when the job has one.
    pub frontend: Option<String>,
}

/// How a node should start a backend process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LaunchInfo {
    /// Program path on the node.
    pub program: String,
    /// Flags placed before the backend arguments.
    pub flags: Vec<String>,
}

/// Messages sent by the scheduler to a frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerMessage {
    AssignJobNumber {
        job_number: u64,
        host: String,
    },
    AssignBackend {
        name: String,
        host: String,
        launch: LaunchInfo,
        threads: u32,
    },
    RenewLease,
    CancelJob {
        reason: String,
    },
}

/// Messages sent by a frontend, either to the scheduler or to its backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    RequestJob {
        user: String,
        nodes: u32,
        procs: u32,
        threads: u32,
    },
    RenewLease,
    CancelJob {
        reason: String,
    },
    JobFinished,
    BackendFailed {
        name: String,
    },
    CommenceJob {
        addresses: Vec<BackendAddresses>,
        frontend_comm: Option<String>,
        main_class: String,
        args: Vec<String>,
    },
    /// `content` is `None` when the resource exists nowhere.
    ReportResource {
        name: String,
        content: Option<Bytes>,
    },
    OutputFileOpenResult {
        bfd: u32,
        ffd: u32,
        error: Option<String>,
    },
    OutputFileWriteResult {
        ffd: u32,
        error: Option<String>,
    },
    OutputFileFlushResult {
        ffd: u32,
        error: Option<String>,
    },
    OutputFileCloseResult {
        ffd: u32,
        error: Option<String>,
    },
    InputFileOpenResult {
        bfd: u32,
        ffd: u32,
        error: Option<String>,
    },
    /// Empty `data` with no error means end of file.
    InputFileReadResult {
        ffd: u32,
        data: Bytes,
        error: Option<String>,
    },
    InputFileSkipResult {
        ffd: u32,
        skipped: u64,
        error: Option<String>,
    },
    InputFileCloseResult {
        ffd: u32,
        error: Option<String>,
    },
}

/// Messages sent by a backend to its frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    BackendReady {
        rank: u32,
        addresses: BackendAddresses,
    },
    BackendFinished,
    RenewLease,
    CancelJob {
        reason: String,
    },
    RequestResource {
        name: String,
    },
    OutputFileOpen {
        bfd: u32,
        path: String,
        append: bool,
    },
    OutputFileWrite {
        ffd: u32,
        data: Bytes,
    },
    OutputFileFlush {
        ffd: u32,
    },
    OutputFileClose {
        ffd: u32,
    },
    InputFileOpen {
        bfd: u32,
        path: String,
    },
    InputFileRead {
        ffd: u32,
        len: u32,
    },
    InputFileSkip {
        ffd: u32,
        len: u64,
    },
    InputFileClose {
        ffd: u32,
    },
}

/// One RPC call tagged with the role that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Scheduler(SchedulerMessage),
    Frontend(FrontendMessage),
    Backend(BackendMessage),
}

impl Message {
    pub fn role(&self) -> Role {
        match self {
            Message::Scheduler(_) => Role::Scheduler,
            Message::Frontend(_) => Role::Frontend,
            Message::Backend(_) => Role::Backend,
        }
    }

    /// The RPC method name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Scheduler(m) => m.name(),
            Message::Frontend(m) => m.name(),
            Message::Backend(m) => m.name(),
        }
    }
}

impl SchedulerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerMessage::AssignJobNumber { .. } => "assignJobNumber",
            SchedulerMessage::AssignBackend { .. } => "assignBackend",
            SchedulerMessage::RenewLease => "renewLease",
            SchedulerMessage::CancelJob { .. } => "cancelJob",
        }
    }
}

impl FrontendMessage {
    pub fn name(&self) -> &'static str {
        match self {
            FrontendMessage::RequestJob { .. } => "requestJob",
            FrontendMessage::RenewLease => "renewLease",
            FrontendMessage::CancelJob { .. } => "cancelJob",
            FrontendMessage::JobFinished => "jobFinished",
            FrontendMessage::BackendFailed { .. } => "backendFailed",
            FrontendMessage::CommenceJob { .. } => "commenceJob",
            FrontendMessage::ReportResource { .. } => "reportResource",
            FrontendMessage::OutputFileOpenResult { .. } => "outputFileOpenResult",
            FrontendMessage::OutputFileWriteResult { .. } => "outputFileWriteResult",
            FrontendMessage::OutputFileFlushResult { .. } => "outputFileFlushResult",
            FrontendMessage::OutputFileCloseResult { .. } => "outputFileCloseResult",
            FrontendMessage::InputFileOpenResult { .. } => "inputFileOpenResult",
            FrontendMessage::InputFileReadResult { .. } => "inputFileReadResult",
            FrontendMessage::InputFileSkipResult { .. } => "inputFileSkipResult",
            FrontendMessage::InputFileCloseResult { .. } => "inputFileCloseResult",
        }
    }
}

impl BackendMessage {
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::BackendReady { .. } => "backendReady",
            BackendMessage::BackendFinished => "backendFinished",
            BackendMessage::RenewLease => "renewLease",
            BackendMessage::CancelJob { .. } => "cancelJob",
            BackendMessage::RequestResource { .. } => "requestResource",
            BackendMessage::OutputFileOpen { .. } => "outputFileOpen",
            BackendMessage::OutputFileWrite { .. } => "outputFileWrite",
            BackendMessage::OutputFileFlush { .. } => "outputFileFlush",
            BackendMessage::OutputFileClose { .. } => "outputFileClose",
            BackendMessage::InputFileOpen { .. } => "inputFileOpen",
            BackendMessage::InputFileRead { .. } => "inputFileRead",
            BackendMessage::InputFileSkip { .. } => "inputFileSkip",
            BackendMessage::InputFileClose { .. } => "inputFileClose",
        }
    }
}

impl From<SchedulerMessage> for Message {
    fn from(msg: SchedulerMessage) -> Self {
        Message::Scheduler(msg)
    }
}

impl From<FrontendMessage> for Message {
    fn from(msg: FrontendMessage) -> Self {
        Message::Frontend(msg)
    }
}

impl From<BackendMessage> for Message {
    fn from(msg: BackendMessage) -> Self {
        Message::Backend(msg)
    }
}
