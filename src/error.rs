use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    /// The peer sent bytes that do not decode as a message.
    #[error("Protocol format error: {0}")]
    Protocol(String),

    /// A well-formed message arrived in a state that does not expect it.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Channel {0} closed")]
    ChannelClosed(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A file operation failed on the frontend's filesystem.
    #[error("Remote I/O error: {0}")]
    RemoteIo(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Unsupported resource: {0}")]
    UnsupportedResource(String),

    #[error("Failed to launch backend on {host}: {reason}")]
    Launch { host: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job cancelled: {0}")]
    Cancelled(String),

    #[error("Unknown rank: {0}")]
    UnknownRank(u32),

    #[error("Unknown file descriptor: {0}")]
    UnknownFile(u32),
}

impl JobError {
    /// Errors that cancel the whole job rather than a single call.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            JobError::Protocol(_)
                | JobError::ProtocolViolation(_)
                | JobError::ChannelClosed(_)
                | JobError::Io(_)
                | JobError::Launch { .. }
                | JobError::UnknownRank(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
