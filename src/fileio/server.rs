//! Frontend side of the remote file proxy.
//!
//! Each open file gets its own worker task fed by an unbounded queue, so
//! operations on one file run strictly in arrival order while the shared
//! receive loop never waits on the filesystem. Descriptors 1 and 2 are
//! bound to the job's standard output and standard error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use crate::channel::BackendProxy;
use crate::fileio::client::{STDERR_FFD, STDOUT_FFD};
use crate::protocol::{BackendMessage, FrontendMessage};

const FIRST_FILE_FFD: u32 = 3;
/// Largest single read served to a backend.
const MAX_READ_LEN: u32 = 1024 * 1024;

type Sink = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug)]
enum FileOp {
    Write(Bytes),
    Flush,
    Close,
    Read(u32),
    Skip(u64),
}

struct Request {
    op: FileOp,
    reply: BackendProxy,
}

type Workers = Arc<Mutex<HashMap<u32, mpsc::UnboundedSender<Request>>>>;

/// Serves backend file requests from the frontend's filesystem.
pub struct FileServer {
    next_ffd: AtomicU32,
    workers: Workers,
}

impl FileServer {
    /// A server whose descriptors 1 and 2 write to this process's stdout and stderr.
    pub fn new() -> Self {
        Self::with_std_streams(Box::new(tokio::io::stdout()), Box::new(tokio::io::stderr()))
    }

    /// Must be called inside a tokio runtime.
    pub fn with_std_streams(stdout: Sink, stderr: Sink) -> Self {
        let mut workers = HashMap::new();
        for (ffd, sink) in [(STDOUT_FFD, stdout), (STDERR_FFD, stderr)] {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(std_stream_worker(ffd, sink, rx));
            workers.insert(ffd, tx);
        }
        Self {
            next_ffd: AtomicU32::new(FIRST_FILE_FFD),
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    /// Handles one file request from `reply`'s backend.
    pub async fn handle(&self, reply: BackendProxy, msg: BackendMessage) {
        match msg {
            BackendMessage::OutputFileOpen { bfd, path, append } => {
                let ffd = self.next_ffd.fetch_add(1, Ordering::Relaxed);
                let rx = self.add_worker(ffd).await;
                tokio::spawn(output_file_worker(
                    ffd,
                    bfd,
                    path,
                    append,
                    reply,
                    rx,
                    Arc::clone(&self.workers),
                ));
            }
            BackendMessage::InputFileOpen { bfd, path } => {
                let ffd = self.next_ffd.fetch_add(1, Ordering::Relaxed);
                let rx = self.add_worker(ffd).await;
                tokio::spawn(input_file_worker(
                    ffd,
                    bfd,
                    path,
                    reply,
                    rx,
                    Arc::clone(&self.workers),
                ));
            }
            BackendMessage::OutputFileWrite { ffd, data } => {
                self.enqueue(ffd, FileOp::Write(data), reply).await
            }
            BackendMessage::OutputFileFlush { ffd } => {
                self.enqueue(ffd, FileOp::Flush, reply).await
            }
            BackendMessage::OutputFileClose { ffd } | BackendMessage::InputFileClose { ffd } => {
                self.enqueue(ffd, FileOp::Close, reply).await
            }
            BackendMessage::InputFileRead { ffd, len } => {
                self.enqueue(ffd, FileOp::Read(len), reply).await
            }
            BackendMessage::InputFileSkip { ffd, len } => {
                self.enqueue(ffd, FileOp::Skip(len), reply).await
            }
            other => {
                tracing::warn!(method = other.name(), "Not a file request");
            }
        }
    }

    async fn add_worker(&self, ffd: u32) -> mpsc::UnboundedReceiver<Request> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.workers.lock().await.insert(ffd, tx);
        rx
    }

    async fn enqueue(&self, ffd: u32, op: FileOp, reply: BackendProxy) {
        let worker = self.workers.lock().await.get(&ffd).cloned();
        let request = Request { op, reply };
        let unsent = match worker {
            Some(tx) => match tx.send(request) {
                Ok(()) => return,
                Err(mpsc::error::SendError(request)) => request,
            },
            None => request,
        };
        tracing::debug!(ffd, op = ?unsent.op, "Request for unknown file");
        let error = Some(format!("unknown file descriptor {ffd}"));
        send_result(&unsent.reply, result_message(ffd, &unsent.op, error, None));
    }
}

impl Default for FileServer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FileServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileServer")
            .field("next_ffd", &self.next_ffd.load(Ordering::Relaxed))
            .finish()
    }
}

/// Payload of a successful read or skip.
enum Outcome {
    Data(Bytes),
    Skipped(u64),
}

fn result_message(ffd: u32, op: &FileOp, error: Option<String>, outcome: Option<Outcome>) -> FrontendMessage {
    match op {
        FileOp::Write(_) => FrontendMessage::OutputFileWriteResult { ffd, error },
        FileOp::Flush => FrontendMessage::OutputFileFlushResult { ffd, error },
        FileOp::Close => FrontendMessage::OutputFileCloseResult { ffd, error },
        FileOp::Read(_) => FrontendMessage::InputFileReadResult {
            ffd,
            data: match outcome {
                Some(Outcome::Data(data)) => data,
                _ => Bytes::new(),
            },
            error,
        },
        FileOp::Skip(_) => FrontendMessage::InputFileSkipResult {
            ffd,
            skipped: match outcome {
                Some(Outcome::Skipped(n)) => n,
                _ => 0,
            },
            error,
        },
    }
}

fn send_result(reply: &BackendProxy, msg: FrontendMessage) {
    if let Err(e) = reply.send(msg) {
        tracing::debug!(error = %e, "Backend gone before file result");
    }
}

async fn write_op(sink: &mut (impl AsyncWrite + Unpin), op: &FileOp) -> std::io::Result<()> {
    match op {
        FileOp::Write(data) => sink.write_all(data).await,
        FileOp::Flush => sink.flush().await,
        FileOp::Close => sink.shutdown().await,
        FileOp::Read(_) | FileOp::Skip(_) => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "file is open for writing",
        )),
    }
}

async fn read_op(source: &mut (impl AsyncRead + Unpin), op: &FileOp) -> std::io::Result<Outcome> {
    match op {
        FileOp::Read(len) => {
            let mut buf = vec![0u8; (*len).min(MAX_READ_LEN) as usize];
            let n = source.read(&mut buf).await?;
            buf.truncate(n);
            Ok(Outcome::Data(Bytes::from(buf)))
        }
        FileOp::Skip(len) => {
            let skipped = tokio::io::copy(&mut source.take(*len), &mut tokio::io::sink()).await?;
            Ok(Outcome::Skipped(skipped))
        }
        FileOp::Write(_) | FileOp::Flush | FileOp::Close => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "file is open for reading",
        )),
    }
}

async fn std_stream_worker(ffd: u32, mut sink: Sink, mut rx: mpsc::UnboundedReceiver<Request>) {
    while let Some(Request { op, reply }) = rx.recv().await {
        // Closing a standard stream only flushes it; other backends share it.
        let result = match op {
            FileOp::Close => sink.flush().await,
            ref op => write_op(&mut sink, op).await,
        };
        let error = result.err().map(|e| e.to_string());
        send_result(&reply, result_message(ffd, &op, error, None));
    }
}

async fn output_file_worker(
    ffd: u32,
    bfd: u32,
    path: String,
    append: bool,
    reply: BackendProxy,
    mut rx: mpsc::UnboundedReceiver<Request>,
    workers: Workers,
) {
    let opened = OpenOptions::new()
        .write(true)
        .create(true)
        .append(append)
        .truncate(!append)
        .open(&path)
        .await;
    let mut file = match opened {
        Ok(file) => {
            tracing::debug!(ffd, bfd, path = %path, "Opened output file");
            send_result(
                &reply,
                FrontendMessage::OutputFileOpenResult { bfd, ffd, error: None },
            );
            file
        }
        Err(e) => {
            tracing::debug!(bfd, path = %path, error = %e, "Output file open failed");
            workers.lock().await.remove(&ffd);
            send_result(
                &reply,
                FrontendMessage::OutputFileOpenResult {
                    bfd,
                    ffd: 0,
                    error: Some(e.to_string()),
                },
            );
            return;
        }
    };

    while let Some(Request { op, reply }) = rx.recv().await {
        let result = write_op(&mut file, &op).await;
        let closing = matches!(op, FileOp::Close);
        if closing {
            workers.lock().await.remove(&ffd);
        }
        let error = result.err().map(|e| e.to_string());
        send_result(&reply, result_message(ffd, &op, error, None));
        if closing {
            return;
        }
    }
}

async fn input_file_worker(
    ffd: u32,
    bfd: u32,
    path: String,
    reply: BackendProxy,
    mut rx: mpsc::UnboundedReceiver<Request>,
    workers: Workers,
) {
    let mut file: File = match File::open(&path).await {
        Ok(file) => {
            tracing::debug!(ffd, bfd, path = %path, "Opened input file");
            send_result(
                &reply,
                FrontendMessage::InputFileOpenResult { bfd, ffd, error: None },
            );
            file
        }
        Err(e) => {
            tracing::debug!(bfd, path = %path, error = %e, "Input file open failed");
            workers.lock().await.remove(&ffd);
            send_result(
                &reply,
                FrontendMessage::InputFileOpenResult {
                    bfd,
                    ffd: 0,
                    error: Some(e.to_string()),
                },
            );
            return;
        }
    };

    while let Some(Request { op, reply }) = rx.recv().await {
        if matches!(op, FileOp::Close) {
            workers.lock().await.remove(&ffd);
            send_result(&reply, FrontendMessage::InputFileCloseResult { ffd, error: None });
            return;
        }
        let msg = match read_op(&mut file, &op).await {
            Ok(outcome) => result_message(ffd, &op, None, Some(outcome)),
            Err(e) => result_message(ffd, &op, Some(e.to_string()), None),
        };
        send_result(&reply, msg);
    }
}
