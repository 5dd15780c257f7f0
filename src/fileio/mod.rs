//! Remote file I/O between backends and the frontend.
//!
//! A backend opens a file under a backend file descriptor (bfd) it picks
//! itself; the frontend answers with the frontend file descriptor (ffd)
//! used for every later operation on that file.

pub mod client;
pub mod server;

pub use client::{
    RemoteFiles, RemoteInputStream, RemoteOutputStream, MAX_WRITE_CHUNK, STDERR_FFD, STDOUT_FFD,
};
pub use server::FileServer;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BackendProxy, ChannelId, ChannelSender, FrontendProxy};
    use crate::error::JobError;
    use crate::protocol::{BackendMessage, Message};
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    /// Wires a client to a server through in-memory queues.
    fn wire(server: FileServer) -> RemoteFiles {
        wire_with_write_sizes(server).0
    }

    /// Like [`wire`], also recording the payload size of every write request.
    fn wire_with_write_sizes(server: FileServer) -> (RemoteFiles, Arc<Mutex<Vec<usize>>>) {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&sizes);
        let (to_frontend, mut frontend_rx) = mpsc::unbounded_channel::<Message>();
        let (to_backend, mut backend_rx) = mpsc::unbounded_channel::<Message>();
        let files = RemoteFiles::new(FrontendProxy::new(ChannelSender::new(
            ChannelId(1),
            to_frontend,
        )));
        let reply = BackendProxy::new(ChannelSender::new(ChannelId(2), to_backend));

        tokio::spawn(async move {
            while let Some(msg) = frontend_rx.recv().await {
                if let Message::Backend(msg) = msg {
                    if let BackendMessage::OutputFileWrite { data, .. } = &msg {
                        recorded.lock().unwrap().push(data.len());
                    }
                    server.handle(reply.clone(), msg).await;
                }
            }
        });
        let deliver_to = files.clone();
        tokio::spawn(async move {
            while let Some(msg) = backend_rx.recv().await {
                if let Message::Frontend(msg) = msg {
                    deliver_to.deliver(msg).await;
                }
            }
        });
        (files, sizes)
    }

    fn quiet_server() -> FileServer {
        FileServer::with_std_streams(Box::new(tokio::io::sink()), Box::new(tokio::io::sink()))
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let path = path.to_str().unwrap();
        let files = wire(quiet_server());

        let mut out = files.create(path, false).await.unwrap();
        assert!(out.ffd() >= 3);
        out.write(b"hello ").await.unwrap();
        out.write(b"world").await.unwrap();
        out.flush().await.unwrap();
        out.close().await.unwrap();

        let mut input = files.open(path).await.unwrap();
        assert_eq!(input.skip(6).await.unwrap(), 6);
        assert_eq!(input.read_to_end().await.unwrap(), b"world");
        // At end of file reads come back empty.
        assert!(input.read(16).await.unwrap().is_empty());
        input.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_interleaved_writes_stay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let files = wire(quiet_server());

        let mut tasks = Vec::new();
        for n in 0..4 {
            let path = dir.path().join(format!("part-{n}.txt"));
            let files = files.clone();
            tasks.push(tokio::spawn(async move {
                let mut out = files.create(path.to_str().unwrap(), false).await.unwrap();
                for line in 0..200 {
                    out.write(format!("file {n} line {line}\n").as_bytes())
                        .await
                        .unwrap();
                    if line % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                out.close().await.unwrap();
                path
            }));
        }

        for (n, task) in tasks.into_iter().enumerate() {
            let path = task.await.unwrap();
            let expected: String = (0..200).map(|line| format!("file {n} line {line}\n")).collect();
            assert_eq!(std::fs::read_to_string(&path).unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_large_write_is_split_into_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let (files, sizes) = wire_with_write_sizes(quiet_server());

        let data: Vec<u8> = (0..MAX_WRITE_CHUNK * 5 / 2).map(|i| (i % 251) as u8).collect();
        let mut out = files.create(path.to_str().unwrap(), false).await.unwrap();
        out.write(&data).await.unwrap();
        out.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), data);
        assert_eq!(
            *sizes.lock().unwrap(),
            vec![MAX_WRITE_CHUNK, MAX_WRITE_CHUNK, MAX_WRITE_CHUNK / 2]
        );
    }

    #[tokio::test]
    async fn test_append_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        std::fs::write(&path, b"one\n").unwrap();
        let files = wire(quiet_server());

        let mut out = files.create(path.to_str().unwrap(), true).await.unwrap();
        out.write(b"two\n").await.unwrap();
        out.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"one\ntwo\n");
    }

    #[tokio::test]
    async fn test_open_missing_file_is_remote_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        let files = wire(quiet_server());

        let err = files.open(path.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, JobError::RemoteIo(_)));
        assert!(!err.is_job_fatal());
    }

    #[tokio::test]
    async fn test_stream_unusable_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.txt");
        let files = wire(quiet_server());

        let mut out = files.create(path.to_str().unwrap(), false).await.unwrap();
        out.close().await.unwrap();
        assert!(matches!(
            out.write(b"late").await,
            Err(JobError::RemoteIo(_))
        ));
    }

    #[tokio::test]
    async fn test_std_streams_reach_frontend_sinks() {
        let (stdout, mut stdout_reader) = tokio::io::duplex(1024);
        let server = FileServer::with_std_streams(Box::new(stdout), Box::new(tokio::io::sink()));
        let files = wire(server);

        files.write_stdout(b"rank 0 says hi\n").await.unwrap();
        files.write_stderr(b"ignored\n").await.unwrap();

        let mut buf = vec![0u8; 15];
        stdout_reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"rank 0 says hi\n");
    }

    #[tokio::test]
    async fn test_unknown_descriptor_gets_error_result() {
        let (to_backend, mut backend_rx) = mpsc::unbounded_channel::<Message>();
        let reply = BackendProxy::new(ChannelSender::new(ChannelId(9), to_backend));
        let server = quiet_server();

        server
            .handle(
                reply,
                BackendMessage::InputFileRead { ffd: 42, len: 8 },
            )
            .await;

        match backend_rx.recv().await {
            Some(Message::Frontend(crate::protocol::FrontendMessage::InputFileReadResult {
                ffd,
                data,
                error,
            })) => {
                assert_eq!(ffd, 42);
                assert!(data.is_empty());
                assert!(error.unwrap().contains("unknown file descriptor"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
