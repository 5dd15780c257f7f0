//! Main entry points every backend binary knows.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::{BackendContext, JobMain, TaskRegistry};
use crate::error::{JobError, Result};

/// Prints its arguments, prefixed with the rank, on the job's stdout.
#[derive(Debug, Default)]
pub struct Echo;

#[async_trait]
impl JobMain for Echo {
    async fn run(&self, ctx: BackendContext, args: Vec<String>) -> Result<()> {
        let line = format!("[{}/{}] {}\n", ctx.rank, ctx.size, args.join(" "));
        ctx.files.write_stdout(line.as_bytes()).await
    }
}

/// Copies a file on the frontend: `copy <from> <to>`. Only rank 0 copies.
#[derive(Debug, Default)]
pub struct CopyFile;

#[async_trait]
impl JobMain for CopyFile {
    async fn run(&self, ctx: BackendContext, args: Vec<String>) -> Result<()> {
        let [from, to] = args.as_slice() else {
            return Err(JobError::Config("usage: copy <from> <to>".into()));
        };
        if ctx.rank != 0 {
            return Ok(());
        }
        let mut input = ctx.files.open(from).await?;
        let mut output = ctx.files.create(to, false).await?;
        loop {
            let chunk = input.read(64 * 1024).await?;
            if chunk.is_empty() {
                break;
            }
            output.write(&chunk).await?;
        }
        input.close().await?;
        output.close().await
    }
}

/// Resolves each named class resource and reports its size on stderr.
#[derive(Debug, Default)]
pub struct Resolve;

#[async_trait]
impl JobMain for Resolve {
    async fn run(&self, ctx: BackendContext, args: Vec<String>) -> Result<()> {
        for name in &args {
            let line = match ctx.resources.resolve(name).await {
                Ok(bytes) => format!("[{}] {name}: {} bytes\n", ctx.rank, bytes.len()),
                Err(e @ JobError::ResourceNotFound(_)) => format!("[{}] {e}\n", ctx.rank),
                Err(e) => return Err(e),
            };
            ctx.files.write_stderr(line.as_bytes()).await?;
        }
        Ok(())
    }
}

pub fn builtin_tasks() -> TaskRegistry {
    TaskRegistry::new()
        .with("echo", Arc::new(Echo))
        .with("copy", Arc::new(CopyFile))
        .with("resolve", Arc::new(Resolve))
}
