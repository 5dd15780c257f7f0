//! Wire encoding for [`Message`].
//!
//! Each frame is length-delimited (u32 big-endian length prefix) and carries
//! a role tag byte, a method tag byte and the method's arguments. Integers are
//! big-endian, strings and byte blobs are u32-length-prefixed, optional values
//! carry a presence byte and lists a u32 element count. Anything that does not
//! decode exactly, including trailing bytes, is rejected as
//! [`JobError::Protocol`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::{JobError, Result};
use crate::protocol::message::{
    BackendAddresses, BackendMessage, FrontendMessage, LaunchInfo, Message, SchedulerMessage,
};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const ROLE_SCHEDULER: u8 = 1;
const ROLE_FRONTEND: u8 = 2;
const ROLE_BACKEND: u8 = 3;

/// Encodes a message body (without the length prefix).
pub fn encode_message(msg: &Message) -> Bytes {
    let mut dst = BytesMut::with_capacity(64);
    match msg {
        Message::Scheduler(m) => {
            dst.put_u8(ROLE_SCHEDULER);
            encode_scheduler(m, &mut dst);
        }
        Message::Frontend(m) => {
            dst.put_u8(ROLE_FRONTEND);
            encode_frontend(m, &mut dst);
        }
        Message::Backend(m) => {
            dst.put_u8(ROLE_BACKEND);
            encode_backend(m, &mut dst);
        }
    }
    dst.freeze()
}

/// Decodes a message body produced by [`encode_message`].
pub fn decode_message(buf: Bytes) -> Result<Message> {
    let mut r = Reader::new(buf);
    let msg = match r.u8()? {
        ROLE_SCHEDULER => Message::Scheduler(decode_scheduler(&mut r)?),
        ROLE_FRONTEND => Message::Frontend(decode_frontend(&mut r)?),
        ROLE_BACKEND => Message::Backend(decode_backend(&mut r)?),
        other => return Err(JobError::Protocol(format!("unknown role tag {other}"))),
    };
    r.finish()?;
    Ok(msg)
}

fn encode_scheduler(msg: &SchedulerMessage, dst: &mut BytesMut) {
    match msg {
        SchedulerMessage::AssignJobNumber { job_number, host } => {
            dst.put_u8(1);
            dst.put_u64(*job_number);
            put_str(dst, host);
        }
        SchedulerMessage::AssignBackend {
            name,
            host,
            launch,
            threads,
        } => {
            dst.put_u8(2);
            put_str(dst, name);
            put_str(dst, host);
            put_str(dst, &launch.program);
            put_strs(dst, &launch.flags);
            dst.put_u32(*threads);
        }
        SchedulerMessage::RenewLease => dst.put_u8(3),
        SchedulerMessage::CancelJob { reason } => {
            dst.put_u8(4);
            put_str(dst, reason);
        }
    }
}

fn decode_scheduler(r: &mut Reader) -> Result<SchedulerMessage> {
    Ok(match r.u8()? {
        1 => SchedulerMessage::AssignJobNumber {
            job_number: r.u64()?,
            host: r.string()?,
        },
        2 => SchedulerMessage::AssignBackend {
            name: r.string()?,
            host: r.string()?,
            launch: LaunchInfo {
                program: r.string()?,
                flags: r.strings()?,
            },
            threads: r.u32()?,
        },
        3 => SchedulerMessage::RenewLease,
        4 => SchedulerMessage::CancelJob { reason: r.string()? },
        other => return Err(unknown_method("scheduler", other)),
    })
}

fn encode_frontend(msg: &FrontendMessage, dst: &mut BytesMut) {
    match msg {
        FrontendMessage::RequestJob {
            user,
            nodes,
            procs,
            threads,
        } => {
            dst.put_u8(1);
            put_str(dst, user);
            dst.put_u32(*nodes);
            dst.put_u32(*procs);
            dst.put_u32(*threads);
        }
        FrontendMessage::RenewLease => dst.put_u8(2),
        FrontendMessage::CancelJob { reason } => {
            dst.put_u8(3);
            put_str(dst, reason);
        }
        FrontendMessage::JobFinished => dst.put_u8(4),
        FrontendMessage::BackendFailed { name } => {
            dst.put_u8(5);
            put_str(dst, name);
        }
        FrontendMessage::CommenceJob {
            addresses,
            frontend_comm,
            main_class,
            args,
        } => {
            dst.put_u8(6);
            dst.put_u32(addresses.len() as u32);
            for addr in addresses {
                put_str(dst, &addr.middleware);
                put_str(dst, &addr.world);
                put_opt_str(dst, addr.frontend.as_deref());
            }
            put_opt_str(dst, frontend_comm.as_deref());
            put_str(dst, main_class);
            put_strs(dst, args);
        }
        FrontendMessage::ReportResource { name, content } => {
            dst.put_u8(7);
            put_str(dst, name);
            match content {
                Some(bytes) => {
                    dst.put_u8(1);
                    put_bytes(dst, bytes);
                }
                None => dst.put_u8(0),
            }
        }
        FrontendMessage::OutputFileOpenResult { bfd, ffd, error } => {
            dst.put_u8(8);
            dst.put_u32(*bfd);
            dst.put_u32(*ffd);
            put_opt_str(dst, error.as_deref());
        }
        FrontendMessage::OutputFileWriteResult { ffd, error } => {
            dst.put_u8(9);
            dst.put_u32(*ffd);
            put_opt_str(dst, error.as_deref());
        }
        FrontendMessage::OutputFileFlushResult { ffd, error } => {
            dst.put_u8(10);
            dst.put_u32(*ffd);
            put_opt_str(dst, error.as_deref());
        }
        FrontendMessage::OutputFileCloseResult { ffd, error } => {
            dst.put_u8(11);
            dst.put_u32(*ffd);
            put_opt_str(dst, error.as_deref());
        }
        FrontendMessage::InputFileOpenResult { bfd, ffd, error } => {
            dst.put_u8(12);
            dst.put_u32(*bfd);
            dst.put_u32(*ffd);
            put_opt_str(dst, error.as_deref());
        }
        FrontendMessage::InputFileReadResult { ffd, data, error } => {
            dst.put_u8(13);
            dst.put_u32(*ffd);
            put_bytes(dst, data);
            put_opt_str(dst, error.as_deref());
        }
        FrontendMessage::InputFileSkipResult {
            ffd,
            skipped,
            error,
        } => {
            dst.put_u8(14);
            dst.put_u32(*ffd);
            dst.put_u64(*skipped);
            put_opt_str(dst, error.as_deref());
        }
        FrontendMessage::InputFileCloseResult { ffd, error } => {
            dst.put_u8(15);
            dst.put_u32(*ffd);
            put_opt_str(dst, error.as_deref());
        }
    }
}

fn decode_frontend(r: &mut Reader) -> Result<FrontendMessage> {
    Ok(match r.u8()? {
        1 => FrontendMessage::RequestJob {
            user: r.string()?,
            nodes: r.u32()?,
            procs: r.u32()?,
            threads: r.u32()?,
        },
        2 => FrontendMessage::RenewLease,
        3 => FrontendMessage::CancelJob { reason: r.string()? },
        4 => FrontendMessage::JobFinished,
        5 => FrontendMessage::BackendFailed { name: r.string()? },
        6 => {
            // Each entry needs at least two length prefixes and a presence byte.
            let count = r.count(9)?;
            let mut addresses = Vec::with_capacity(count);
            for _ in 0..count {
                addresses.push(BackendAddresses {
                    middleware: r.string()?,
                    world: r.string()?,
                    frontend: r.opt_string()?,
                });
            }
            FrontendMessage::CommenceJob {
                addresses,
                frontend_comm: r.opt_string()?,
                main_class: r.string()?,
                args: r.strings()?,
            }
        }
        7 => {
            let name = r.string()?;
            let content = if r.bool()? { Some(r.bytes()?) } else { None };
            FrontendMessage::ReportResource { name, content }
        }
        8 => FrontendMessage::OutputFileOpenResult {
            bfd: r.u32()?,
            ffd: r.u32()?,
            error: r.opt_string()?,
        },
        9 => FrontendMessage::OutputFileWriteResult {
            ffd: r.u32()?,
            error: r.opt_string()?,
        },
        10 => FrontendMessage::OutputFileFlushResult {
            ffd: r.u32()?,
            error: r.opt_string()?,
        },
        11 => FrontendMessage::OutputFileCloseResult {
            ffd: r.u32()?,
            error: r.opt_string()?,
        },
        12 => FrontendMessage::InputFileOpenResult {
            bfd: r.u32()?,
            ffd: r.u32()?,
            error: r.opt_string()?,
        },
        13 => FrontendMessage::InputFileReadResult {
            ffd: r.u32()?,
            data: r.bytes()?,
            error: r.opt_string()?,
        },
        14 => FrontendMessage::InputFileSkipResult {
            ffd: r.u32()?,
            skipped: r.u64()?,
            error: r.opt_string()?,
        },
        15 => FrontendMessage::InputFileCloseResult {
            ffd: r.u32()?,
            error: r.opt_string()?,
        },
        other => return Err(unknown_method("frontend", other)),
    })
}

fn encode_backend(msg: &BackendMessage, dst: &mut BytesMut) {
    match msg {
        BackendMessage::BackendReady { rank, addresses } => {
            dst.put_u8(1);
            dst.put_u32(*rank);
            put_str(dst, &addresses.middleware);
            put_str(dst, &addresses.world);
            put_opt_str(dst, addresses.frontend.as_deref());
        }
        BackendMessage::BackendFinished => dst.put_u8(2),
        BackendMessage::RenewLease => dst.put_u8(3),
        BackendMessage::CancelJob { reason } => {
            dst.put_u8(4);
            put_str(dst, reason);
        }
        BackendMessage::RequestResource { name } => {
            dst.put_u8(5);
            put_str(dst, name);
        }
        BackendMessage::OutputFileOpen { bfd, path, append } => {
            dst.put_u8(6);
            dst.put_u32(*bfd);
            put_str(dst, path);
            dst.put_u8(u8::from(*append));
        }
        BackendMessage::OutputFileWrite { ffd, data } => {
            dst.put_u8(7);
            dst.put_u32(*ffd);
            put_bytes(dst, data);
        }
        BackendMessage::OutputFileFlush { ffd } => {
            dst.put_u8(8);
            dst.put_u32(*ffd);
        }
        BackendMessage::OutputFileClose { ffd } => {
            dst.put_u8(9);
            dst.put_u32(*ffd);
        }
        BackendMessage::InputFileOpen { bfd, path } => {
            dst.put_u8(10);
            dst.put_u32(*bfd);
            put_str(dst, path);
        }
        BackendMessage::InputFileRead { ffd, len } => {
            dst.put_u8(11);
            dst.put_u32(*ffd);
            dst.put_u32(*len);
        }
        BackendMessage::InputFileSkip { ffd, len } => {
            dst.put_u8(12);
            dst.put_u32(*ffd);
            dst.put_u64(*len);
        }
        BackendMessage::InputFileClose { ffd } => {
            dst.put_u8(13);
            dst.put_u32(*ffd);
        }
    }
}

fn decode_backend(r: &mut Reader) -> Result<BackendMessage> {
    Ok(match r.u8()? {
        1 => BackendMessage::BackendReady {
            rank: r.u32()?,
            addresses: BackendAddresses {
                middleware: r.string()?,
                world: r.string()?,
                frontend: r.opt_string()?,
            },
        },
        2 => BackendMessage::BackendFinished,
        3 => BackendMessage::RenewLease,
        4 => BackendMessage::CancelJob { reason: r.string()? },
        5 => BackendMessage::RequestResource { name: r.string()? },
        6 => BackendMessage::OutputFileOpen {
            bfd: r.u32()?,
            path: r.string()?,
            append: r.bool()?,
        },
        7 => BackendMessage::OutputFileWrite {
            ffd: r.u32()?,
            data: r.bytes()?,
        },
        8 => BackendMessage::OutputFileFlush { ffd: r.u32()? },
        9 => BackendMessage::OutputFileClose { ffd: r.u32()? },
        10 => BackendMessage::InputFileOpen {
            bfd: r.u32()?,
            path: r.string()?,
        },
        11 => BackendMessage::InputFileRead {
            ffd: r.u32()?,
            len: r.u32()?,
        },
        12 => BackendMessage::InputFileSkip {
            ffd: r.u32()?,
            len: r.u64()?,
        },
        13 => BackendMessage::InputFileClose { ffd: r.u32()? },
        other => return Err(unknown_method("backend", other)),
    })
}

fn unknown_method(role: &str, tag: u8) -> JobError {
    JobError::Protocol(format!("unknown {role} method tag {tag}"))
}

fn put_str(dst: &mut BytesMut, s: &str) {
    put_bytes(dst, s.as_bytes());
}

fn put_bytes(dst: &mut BytesMut, b: &[u8]) {
    dst.put_u32(b.len() as u32);
    dst.put_slice(b);
}

fn put_opt_str(dst: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            dst.put_u8(1);
            put_str(dst, s);
        }
        None => dst.put_u8(0),
    }
}

fn put_strs(dst: &mut BytesMut, items: &[String]) {
    dst.put_u32(items.len() as u32);
    for item in items {
        put_str(dst, item);
    }
}

/// Bounds-checked cursor over a frame body.
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(JobError::Protocol(format!(
                "truncated frame reading {what}: need {n} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(JobError::Protocol(format!("invalid flag byte {other}"))),
        }
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    fn bytes(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        self.need(len, "byte string")?;
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| JobError::Protocol("string is not valid UTF-8".into()))
    }

    fn opt_string(&mut self) -> Result<Option<String>> {
        if self.bool()? {
            Ok(Some(self.string()?))
        } else {
            Ok(None)
        }
    }

    /// Reads an element count, rejecting counts the remaining bytes cannot hold.
    fn count(&mut self, min_elem_len: usize) -> Result<usize> {
        let count = self.u32()? as usize;
        if count.saturating_mul(min_elem_len) > self.buf.remaining() {
            return Err(JobError::Protocol(format!(
                "list length {count} exceeds frame size"
            )));
        }
        Ok(count)
    }

    fn strings(&mut self) -> Result<Vec<String>> {
        let count = self.count(4)?;
        (0..count).map(|_| self.string()).collect()
    }

    fn finish(&self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(JobError::Protocol(format!(
                "{} trailing bytes after message",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

/// Frames [`Message`]s over a byte stream.
#[derive(Debug)]
pub struct MessageCodec {
    frames: LengthDelimitedCodec,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = JobError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        let frame = self.frames.decode(src).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                JobError::Protocol(e.to_string())
            } else {
                JobError::Io(e)
            }
        })?;
        match frame {
            Some(frame) => decode_message(frame.freeze()).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = JobError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let body = encode_message(&item);
        self.frames.encode(body, dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commence() -> Message {
        Message::Frontend(FrontendMessage::CommenceJob {
            addresses: vec![
                BackendAddresses {
                    middleware: "10.0.0.1:4000".into(),
                    world: "10.0.0.1:4001".into(),
                    frontend: None,
                },
                BackendAddresses {
                    middleware: "10.0.0.2:4000".into(),
                    world: "10.0.0.2:4001".into(),
                    frontend: Some("10.0.0.2:4002".into()),
                },
            ],
            frontend_comm: Some("10.0.0.9:5000".into()),
            main_class: "edu.example.Sieve".into(),
            args: vec!["1000000".into(), "-v".into()],
        })
    }

    #[test]
    fn decodes_what_it_encodes() {
        let messages = vec![
            commence(),
            Message::Scheduler(SchedulerMessage::AssignBackend {
                name: "node03".into(),
                host: "10.0.0.3".into(),
                launch: LaunchInfo {
                    program: "/opt/cluster/bin/cluster-job".into(),
                    flags: vec!["--quiet".into()],
                },
                threads: 4,
            }),
            Message::Backend(BackendMessage::OutputFileWrite {
                ffd: 7,
                data: Bytes::from_static(b"hello\n"),
            }),
            Message::Frontend(FrontendMessage::ReportResource {
                name: "Missing.class".into(),
                content: None,
            }),
            Message::Backend(BackendMessage::BackendFinished),
        ];
        for msg in messages {
            let decoded = decode_message(encode_message(&msg)).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn found_empty_resource_differs_from_not_found() {
        let empty = Message::Frontend(FrontendMessage::ReportResource {
            name: "Empty.class".into(),
            content: Some(Bytes::new()),
        });
        let decoded = decode_message(encode_message(&empty)).unwrap();
        assert_eq!(decoded, empty);
    }

    #[test]
    fn rejects_unknown_role_tag() {
        let err = decode_message(Bytes::from_static(&[9, 1])).unwrap_err();
        assert!(matches!(err, JobError::Protocol(_)));
    }

    #[test]
    fn rejects_unknown_method_tag() {
        let err = decode_message(Bytes::from_static(&[ROLE_BACKEND, 200])).unwrap_err();
        assert!(matches!(err, JobError::Protocol(msg) if msg.contains("method tag 200")));
    }

    #[test]
    fn rejects_truncated_frame() {
        let full = encode_message(&commence());
        let cut = full.slice(..full.len() - 3);
        assert!(matches!(
            decode_message(cut).unwrap_err(),
            JobError::Protocol(_)
        ));
    }

    #[test]
    fn rejects_oversized_string_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(ROLE_BACKEND);
        buf.put_u8(5);
        buf.put_u32(u32::MAX);
        buf.put_slice(b"abc");
        assert!(matches!(
            decode_message(buf.freeze()).unwrap_err(),
            JobError::Protocol(_)
        ));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut buf = BytesMut::from(&encode_message(&Message::Backend(BackendMessage::RenewLease))[..]);
        buf.put_u8(0);
        assert!(matches!(
            decode_message(buf.freeze()).unwrap_err(),
            JobError::Protocol(msg) if msg.contains("trailing")
        ));
    }

    #[test]
    fn codec_handles_partial_frames() {
        let mut codec = MessageCodec::new();
        let mut wire = BytesMut::new();
        codec
            .encode(Message::Backend(BackendMessage::RenewLease), &mut wire)
            .unwrap();
        codec.encode(commence(), &mut wire).unwrap();

        let mut src = wire.split_to(3);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.unsplit(wire);

        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Message::Backend(BackendMessage::RenewLease))
        );
        assert_eq!(codec.decode(&mut src).unwrap(), Some(commence()));
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn codec_rejects_frame_over_limit() {
        let mut codec = MessageCodec::new();
        let mut src = BytesMut::new();
        src.put_u32((MAX_FRAME_LEN + 1) as u32);
        src.put_slice(&[0; 16]);
        assert!(matches!(
            codec.decode(&mut src).unwrap_err(),
            JobError::Protocol(_)
        ));
    }
}
