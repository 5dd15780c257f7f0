//! Backend side of the remote file proxy.
//!
//! Streams hold no data. Every call sends one request to the frontend and
//! waits on the stream's own reply queue until the matching result arrives,
//! so callers see ordinary sequential file semantics. Writes larger than
//! [`MAX_WRITE_CHUNK`] go out as one request per chunk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::channel::FrontendProxy;
use crate::error::{JobError, Result};
use crate::protocol::{BackendMessage, FrontendMessage};

/// Frontend descriptor of the job's standard output.
pub const STDOUT_FFD: u32 = 1;
/// Frontend descriptor of the job's standard error.
pub const STDERR_FFD: u32 = 2;

/// Largest payload carried by a single `outputFileWrite`.
pub const MAX_WRITE_CHUNK: usize = 1024 * 1024;

type OpenReply = (u32, Option<String>);

#[derive(Debug)]
struct Inner {
    frontend: FrontendProxy,
    next_bfd: AtomicU32,
    pending_opens: Mutex<HashMap<u32, oneshot::Sender<OpenReply>>>,
    streams: Mutex<HashMap<u32, mpsc::UnboundedSender<FrontendMessage>>>,
    stdout: Mutex<Option<mpsc::UnboundedReceiver<FrontendMessage>>>,
    stderr: Mutex<Option<mpsc::UnboundedReceiver<FrontendMessage>>>,
}

/// Opens files on the frontend's filesystem and routes their results.
#[derive(Debug, Clone)]
pub struct RemoteFiles {
    inner: Arc<Inner>,
}

impl RemoteFiles {
    pub fn new(frontend: FrontendProxy) -> Self {
        Self {
            inner: Arc::new(Inner {
                frontend,
                next_bfd: AtomicU32::new(1),
                pending_opens: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
                stdout: Mutex::new(None),
                stderr: Mutex::new(None),
            }),
        }
    }

    /// Opens `path` for writing on the frontend, truncating unless `append`.
    pub async fn create(&self, path: &str, append: bool) -> Result<RemoteOutputStream> {
        let (bfd, rx) = self.begin_open().await;
        self.inner.frontend.send(BackendMessage::OutputFileOpen {
            bfd,
            path: path.to_string(),
            append,
        })?;
        let ffd = self.finish_open(bfd, rx).await?;
        Ok(RemoteOutputStream::new(ffd, self.clone(), self.register(ffd).await))
    }

    /// Opens `path` for reading on the frontend.
    pub async fn open(&self, path: &str) -> Result<RemoteInputStream> {
        let (bfd, rx) = self.begin_open().await;
        self.inner.frontend.send(BackendMessage::InputFileOpen {
            bfd,
            path: path.to_string(),
        })?;
        let ffd = self.finish_open(bfd, rx).await?;
        Ok(RemoteInputStream {
            ffd,
            files: self.clone(),
            replies: self.register(ffd).await,
            closed: false,
        })
    }

    /// Writes to the job's standard output on the frontend.
    pub async fn write_stdout(&self, data: &[u8]) -> Result<()> {
        self.write_std(&self.inner.stdout, STDOUT_FFD, data).await
    }

    /// Writes to the job's standard error on the frontend.
    pub async fn write_stderr(&self, data: &[u8]) -> Result<()> {
        self.write_std(&self.inner.stderr, STDERR_FFD, data).await
    }

    async fn write_std(
        &self,
        slot: &Mutex<Option<mpsc::UnboundedReceiver<FrontendMessage>>>,
        ffd: u32,
        data: &[u8],
    ) -> Result<()> {
        // Held across both round trips so writes from concurrent tasks don't interleave.
        let mut slot = slot.lock().await;
        if slot.is_none() {
            *slot = Some(self.register(ffd).await);
        }
        let Some(replies) = slot.as_mut() else {
            return Err(JobError::UnknownFile(ffd));
        };
        for chunk in data.chunks(MAX_WRITE_CHUNK) {
            self.send(BackendMessage::OutputFileWrite {
                ffd,
                data: Bytes::copy_from_slice(chunk),
            })?;
            match next_reply(replies, ffd).await? {
                FrontendMessage::OutputFileWriteResult { error, .. } => check(error)?,
                other => return Err(unexpected(ffd, &other)),
            }
        }
        self.send(BackendMessage::OutputFileFlush { ffd })?;
        match next_reply(replies, ffd).await? {
            FrontendMessage::OutputFileFlushResult { error, .. } => check(error),
            other => Err(unexpected(ffd, &other)),
        }
    }

    /// Routes a file result from the receive loop to the waiting caller.
    /// Returns false if nobody is waiting for it.
    pub async fn deliver(&self, msg: FrontendMessage) -> bool {
        match msg {
            FrontendMessage::OutputFileOpenResult { bfd, ffd, error }
            | FrontendMessage::InputFileOpenResult { bfd, ffd, error } => {
                match self.inner.pending_opens.lock().await.remove(&bfd) {
                    Some(tx) => tx.send((ffd, error)).is_ok(),
                    None => false,
                }
            }
            FrontendMessage::OutputFileWriteResult { ffd, .. }
            | FrontendMessage::OutputFileFlushResult { ffd, .. }
            | FrontendMessage::OutputFileCloseResult { ffd, .. }
            | FrontendMessage::InputFileReadResult { ffd, .. }
            | FrontendMessage::InputFileSkipResult { ffd, .. }
            | FrontendMessage::InputFileCloseResult { ffd, .. } => {
                match self.inner.streams.lock().await.get(&ffd) {
                    Some(tx) => tx.send(msg).is_ok(),
                    None => false,
                }
            }
            other => {
                tracing::warn!(method = other.name(), "Not a file result");
                false
            }
        }
    }

    async fn begin_open(&self) -> (u32, oneshot::Receiver<OpenReply>) {
        let bfd = self.inner.next_bfd.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending_opens.lock().await.insert(bfd, tx);
        (bfd, rx)
    }

    async fn finish_open(&self, bfd: u32, rx: oneshot::Receiver<OpenReply>) -> Result<u32> {
        let (ffd, error) = rx
            .await
            .map_err(|_| JobError::Cancelled(format!("open of bfd {bfd} abandoned")))?;
        match error {
            Some(error) => Err(JobError::RemoteIo(error)),
            None => Ok(ffd),
        }
    }

    async fn register(&self, ffd: u32) -> mpsc::UnboundedReceiver<FrontendMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.streams.lock().await.insert(ffd, tx);
        rx
    }

    async fn unregister(&self, ffd: u32) {
        self.inner.streams.lock().await.remove(&ffd);
    }

    fn send(&self, msg: BackendMessage) -> Result<()> {
        self.inner.frontend.send(msg)
    }
}

async fn next_reply(
    replies: &mut mpsc::UnboundedReceiver<FrontendMessage>,
    ffd: u32,
) -> Result<FrontendMessage> {
    replies
        .recv()
        .await
        .ok_or_else(|| JobError::Cancelled(format!("file {ffd} reply queue closed")))
}

fn check(error: Option<String>) -> Result<()> {
    match error {
        Some(error) => Err(JobError::RemoteIo(error)),
        None => Ok(()),
    }
}

fn unexpected(ffd: u32, msg: &FrontendMessage) -> JobError {
    JobError::ProtocolViolation(format!("unexpected {} for file {ffd}", msg.name()))
}

/// A file being written on the frontend.
#[derive(Debug)]
pub struct RemoteOutputStream {
    ffd: u32,
    files: RemoteFiles,
    replies: mpsc::UnboundedReceiver<FrontendMessage>,
    closed: bool,
}

impl RemoteOutputStream {
    fn new(ffd: u32, files: RemoteFiles, replies: mpsc::UnboundedReceiver<FrontendMessage>) -> Self {
        Self {
            ffd,
            files,
            replies,
            closed: false,
        }
    }

    pub fn ffd(&self) -> u32 {
        self.ffd
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        for chunk in data.chunks(MAX_WRITE_CHUNK) {
            self.files.send(BackendMessage::OutputFileWrite {
                ffd: self.ffd,
                data: Bytes::copy_from_slice(chunk),
            })?;
            match next_reply(&mut self.replies, self.ffd).await? {
                FrontendMessage::OutputFileWriteResult { error, .. } => check(error)?,
                other => return Err(unexpected(self.ffd, &other)),
            }
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.files
            .send(BackendMessage::OutputFileFlush { ffd: self.ffd })?;
        match next_reply(&mut self.replies, self.ffd).await? {
            FrontendMessage::OutputFileFlushResult { error, .. } => check(error),
            other => Err(unexpected(self.ffd, &other)),
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;
        self.files
            .send(BackendMessage::OutputFileClose { ffd: self.ffd })?;
        let reply = next_reply(&mut self.replies, self.ffd).await;
        self.files.unregister(self.ffd).await;
        match reply? {
            FrontendMessage::OutputFileCloseResult { error, .. } => check(error),
            other => Err(unexpected(self.ffd, &other)),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(JobError::RemoteIo(format!("file {} is closed", self.ffd)));
        }
        Ok(())
    }
}

/// A file being read from the frontend.
#[derive(Debug)]
pub struct RemoteInputStream {
    ffd: u32,
    files: RemoteFiles,
    replies: mpsc::UnboundedReceiver<FrontendMessage>,
    closed: bool,
}

impl RemoteInputStream {
    pub fn ffd(&self) -> u32 {
        self.ffd
    }

    /// Reads up to `len` bytes. An empty result means end of file.
    pub async fn read(&mut self, len: u32) -> Result<Bytes> {
        self.ensure_open()?;
        self.files
            .send(BackendMessage::InputFileRead { ffd: self.ffd, len })?;
        match next_reply(&mut self.replies, self.ffd).await? {
            FrontendMessage::InputFileReadResult { data, error, .. } => {
                check(error)?;
                Ok(data)
            }
            other => Err(unexpected(self.ffd, &other)),
        }
    }

    /// Reads until end of file.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read(64 * 1024).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// Skips up to `len` bytes and returns how many were skipped.
    pub async fn skip(&mut self, len: u64) -> Result<u64> {
        self.ensure_open()?;
        self.files
            .send(BackendMessage::InputFileSkip { ffd: self.ffd, len })?;
        match next_reply(&mut self.replies, self.ffd).await? {
            FrontendMessage::InputFileSkipResult { skipped, error, .. } => {
                check(error)?;
                Ok(skipped)
            }
            other => Err(unexpected(self.ffd, &other)),
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;
        self.files
            .send(BackendMessage::InputFileClose { ffd: self.ffd })?;
        let reply = next_reply(&mut self.replies, self.ffd).await;
        self.files.unregister(self.ffd).await;
        match reply? {
            FrontendMessage::InputFileCloseResult { error, .. } => check(error),
            other => Err(unexpected(self.ffd, &other)),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(JobError::RemoteIo(format!("file {} is closed", self.ffd)));
        }
        Ok(())
    }
}
