//! End-to-end job tests.
//!
//! Every test runs a real scheduler, frontend and backends over loopback
//! sockets, with short leases so failures surface quickly.


use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, DuplexStream};

use cluster_job::backend::builtin::builtin_tasks;
use cluster_job::backend::{BackendContext, BackendOutcome, JobMain};
use cluster_job::fileio::FileServer;
use cluster_job::frontend::{BackendLauncher, LaunchRequest};
use cluster_job::registry::ProcessState;
use cluster_job::{JobError, Result};
use test_harness::{
    assert_eventually, frontend_config, run_job, run_job_with_files, InProcessLauncher,
    TestScheduler,
};

/// Reads from `reader` until every needle has shown up.
async fn read_until(reader: &mut DuplexStream, needles: &[&str]) -> String {
    let mut seen = String::new();
    let mut buf = vec![0u8; 4096];
    let read_all = async {
        while !needles.iter().all(|n| seen.contains(n)) {
            let n = reader.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream ended before all output arrived: {seen:?}");
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read_all)
        .await
        .expect("output did not arrive");
    seen
}

/// Never returns; the job has to be cancelled around it.
struct Hang;

#[async_trait]
impl JobMain for Hang {
    async fn run(&self, _ctx: BackendContext, _args: Vec<String>) -> Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Fails on rank 0 only.
struct FailRankZero;

#[async_trait]
impl JobMain for FailRankZero {
    async fn run(&self, ctx: BackendContext, _args: Vec<String>) -> Result<()> {
        if ctx.rank == 0 {
            return Err(JobError::Config("bad input".into()));
        }
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Prints what this rank learned from `commenceJob`.
struct Describe;

#[async_trait]
impl JobMain for Describe {
    async fn run(&self, ctx: BackendContext, _args: Vec<String>) -> Result<()> {
        let line = format!(
            "rank={} size={} peers={} world={} comm={}\n",
            ctx.rank,
            ctx.size,
            ctx.addresses.len(),
            ctx.world.is_some(),
            ctx.frontend_comm.is_some(),
        );
        ctx.files.write_stdout(line.as_bytes()).await
    }
}

#[tokio::test]
async fn test_three_rank_job_finishes() {
    let scheduler = TestScheduler::start(3).await;
    let (stdout, mut reader) = tokio::io::duplex(64 * 1024);
    let files = FileServer::with_std_streams(Box::new(stdout), Box::new(tokio::io::sink()));

    let mut config = frontend_config(&scheduler, "echo", 3);
    config.args = vec!["hello".to_string(), "cluster".to_string()];
    let launcher = InProcessLauncher::default();
    let outcome = run_job_with_files(config, launcher.clone(), files).await;

    assert!(outcome.is_success(), "job failed: {:?}", outcome.cancel_reason);
    assert_eq!(outcome.job_number, Some(1));
    assert_eq!(outcome.finished, 3);
    assert!(outcome
        .backends
        .iter()
        .all(|b| b.state == ProcessState::Finished));

    let output = read_until(
        &mut reader,
        &["[0/3] hello cluster", "[1/3] hello cluster", "[2/3] hello cluster"],
    )
    .await;
    assert_eq!(output.lines().count(), 3);

    assert_eventually(
        || {
            let launcher = launcher.clone();
            async move {
                let outcomes = launcher.outcomes().await;
                outcomes.len() == 3 && outcomes.iter().all(|(_, o)| *o == BackendOutcome::Finished)
            }
        },
        Duration::from_secs(5),
        "every backend should see jobFinished",
    )
    .await;
    scheduler.stop().await;
}

#[tokio::test]
async fn test_backend_that_never_starts_cancels_job() {
    let scheduler = TestScheduler::start(3).await;
    let launcher = InProcessLauncher::default().skip_rank(1);
    let outcome = run_job(frontend_config(&scheduler, "echo", 3), launcher.clone()).await;

    assert_eq!(outcome.cancel_reason.as_deref(), Some("Backend failed, rank 1"));
    assert!(!outcome.is_success());
    assert_eq!(outcome.backends[1].state, ProcessState::Failed);

    let expected = BackendOutcome::Cancelled("Backend failed, rank 1".to_string());
    assert_eventually(
        || {
            let launcher = launcher.clone();
            let expected = expected.clone();
            async move {
                let outcomes = launcher.outcomes().await;
                outcomes.len() == 2 && outcomes.iter().all(|(_, o)| *o == expected)
            }
        },
        Duration::from_secs(5),
        "surviving backends should be cancelled with the first cause",
    )
    .await;
    scheduler.stop().await;
}

#[tokio::test]
async fn test_failed_node_is_not_reassigned() {
    let scheduler = TestScheduler::start(3).await;
    let outcome = run_job(
        frontend_config(&scheduler, "echo", 3),
        InProcessLauncher::default().skip_rank(1),
    )
    .await;
    assert_eq!(outcome.cancel_reason.as_deref(), Some("Backend failed, rank 1"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let outcome = run_job(
        frontend_config(&scheduler, "echo", 3),
        InProcessLauncher::default(),
    )
    .await;
    assert_eq!(
        outcome.cancel_reason.as_deref(),
        Some("Not enough nodes: 3 requested, 2 available")
    );
    scheduler.stop().await;
}

#[tokio::test]
async fn test_not_enough_nodes() {
    let scheduler = TestScheduler::start(1).await;
    let mut config = frontend_config(&scheduler, "echo", 4);
    config.nodes = 2;
    let outcome = run_job(config, InProcessLauncher::default()).await;

    assert_eq!(
        outcome.cancel_reason.as_deref(),
        Some("Not enough nodes: 2 requested, 1 available")
    );
    assert_eq!(outcome.finished, 0);
    assert!(outcome
        .backends
        .iter()
        .all(|b| b.state == ProcessState::NotStarted));
    scheduler.stop().await;
}

#[tokio::test]
async fn test_nodes_are_released_after_job() {
    let scheduler = TestScheduler::start(1).await;
    for expected_job in 1..=2 {
        let outcome = run_job(
            frontend_config(&scheduler, "echo", 1),
            InProcessLauncher::default(),
        )
        .await;
        assert!(outcome.is_success(), "job failed: {:?}", outcome.cancel_reason);
        assert_eq!(outcome.job_number, Some(expected_job));
    }
    scheduler.stop().await;
}

#[tokio::test]
async fn test_more_ranks_than_nodes_share_nodes() {
    let scheduler = TestScheduler::start(2).await;
    let mut config = frontend_config(&scheduler, "echo", 4);
    config.nodes = 2;
    let outcome = run_job(config, InProcessLauncher::default()).await;

    assert!(outcome.is_success(), "job failed: {:?}", outcome.cancel_reason);
    let nodes: Vec<_> = outcome
        .backends
        .iter()
        .map(|b| b.node.clone().unwrap())
        .collect();
    assert_eq!(nodes, vec!["n0", "n1", "n0", "n1"]);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_missing_class_does_not_cancel_job() {
    let scheduler = TestScheduler::start(1).await;
    let classes = tempfile::tempdir().unwrap();
    std::fs::write(classes.path().join("Bar.class"), b"0123456789").unwrap();

    let (stderr, mut reader) = tokio::io::duplex(64 * 1024);
    let files = FileServer::with_std_streams(Box::new(tokio::io::sink()), Box::new(stderr));
    let mut config = frontend_config(&scheduler, "resolve", 1);
    config.classpath = vec![classes.path().to_path_buf()];
    config.args = vec!["Foo.class".to_string(), "Bar.class".to_string()];

    let outcome = run_job_with_files(config, InProcessLauncher::default(), files).await;
    assert!(outcome.is_success(), "job failed: {:?}", outcome.cancel_reason);

    let output = read_until(&mut reader, &["Foo.class", "Bar.class: 10 bytes"]).await;
    assert!(output.contains("not found"), "unexpected output: {output}");
    scheduler.stop().await;
}

#[tokio::test]
async fn test_copy_through_frontend_files() {
    let scheduler = TestScheduler::start(1).await;
    let dir = tempfile::tempdir().unwrap();
    let from = dir.path().join("input.txt");
    let to = dir.path().join("output.txt");
    let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&from, &content).unwrap();

    let mut config = frontend_config(&scheduler, "copy", 1);
    config.args = vec![
        from.to_str().unwrap().to_string(),
        to.to_str().unwrap().to_string(),
    ];
    let outcome = run_job(config, InProcessLauncher::default()).await;

    assert!(outcome.is_success(), "job failed: {:?}", outcome.cancel_reason);
    assert_eq!(std::fs::read(&to).unwrap(), content);
    scheduler.stop().await;
}

#[tokio::test]
async fn test_copy_of_missing_file_cancels_job() {
    let scheduler = TestScheduler::start(1).await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = frontend_config(&scheduler, "copy", 1);
    config.args = vec![
        dir.path().join("missing.txt").to_str().unwrap().to_string(),
        dir.path().join("out.txt").to_str().unwrap().to_string(),
    ];
    let outcome = run_job(config, InProcessLauncher::default()).await;

    let reason = outcome.cancel_reason.unwrap();
    assert!(reason.starts_with("Rank 0 failed"), "unexpected reason: {reason}");
    scheduler.stop().await;
}

#[tokio::test]
async fn test_job_timeout() {
    let scheduler = TestScheduler::start(2).await;
    let tasks = builtin_tasks().with("hang", Arc::new(Hang));
    let launcher = InProcessLauncher::new(tasks);
    let mut config = frontend_config(&scheduler, "hang", 2);
    config.job_timeout = Some(Duration::from_secs(1));

    let outcome = run_job(config, launcher.clone()).await;
    assert_eq!(
        outcome.cancel_reason.as_deref(),
        Some("Job timed out after 1 seconds")
    );

    assert_eventually(
        || {
            let launcher = launcher.clone();
            async move {
                let outcomes = launcher.outcomes().await;
                outcomes.len() == 2
                    && outcomes
                        .iter()
                        .all(|(_, o)| matches!(o, BackendOutcome::Cancelled(_)))
            }
        },
        Duration::from_secs(5),
        "backends should be cancelled",
    )
    .await;
    scheduler.stop().await;
}

#[tokio::test]
async fn test_failing_main_cancels_job() {
    let scheduler = TestScheduler::start(2).await;
    let tasks = builtin_tasks().with("fail", Arc::new(FailRankZero));
    let outcome = run_job(
        frontend_config(&scheduler, "fail", 2),
        InProcessLauncher::new(tasks),
    )
    .await;

    let reason = outcome.cancel_reason.unwrap();
    assert!(reason.starts_with("Rank 0 failed"), "unexpected reason: {reason}");
    assert!(reason.contains("bad input"));
    scheduler.stop().await;
}

#[tokio::test]
async fn test_unknown_main_cancels_job() {
    let scheduler = TestScheduler::start(1).await;
    let outcome = run_job(
        frontend_config(&scheduler, "no-such-main", 1),
        InProcessLauncher::default(),
    )
    .await;

    let reason = outcome.cancel_reason.unwrap();
    assert!(reason.contains("no-such-main"), "unexpected reason: {reason}");
    scheduler.stop().await;
}

#[tokio::test]
async fn test_commence_carries_address_table() {
    let scheduler = TestScheduler::start(2).await;
    let tasks = builtin_tasks().with("describe", Arc::new(Describe));
    let (stdout, mut reader) = tokio::io::duplex(64 * 1024);
    let files = FileServer::with_std_streams(Box::new(stdout), Box::new(tokio::io::sink()));
    let mut config = frontend_config(&scheduler, "describe", 2);
    config.has_frontend_comm = true;

    let outcome = run_job_with_files(config, InProcessLauncher::new(tasks), files).await;
    assert!(outcome.is_success(), "job failed: {:?}", outcome.cancel_reason);

    read_until(
        &mut reader,
        &[
            "rank=0 size=2 peers=2 world=true comm=true",
            "rank=1 size=2 peers=2 world=true comm=true",
        ],
    )
    .await;
    scheduler.stop().await;
}

#[tokio::test]
async fn test_user_cancel_reaches_backends() {
    let scheduler = TestScheduler::start(1).await;
    let tasks = builtin_tasks().with("hang", Arc::new(Hang));
    let launcher = InProcessLauncher::new(tasks);
    let frontend = cluster_job::frontend::JobFrontend::connect_with_files(
        frontend_config(&scheduler, "hang", 1),
        Arc::new(launcher.clone()),
        test_harness::quiet_files(),
    )
    .await
    .unwrap();

    let cancel = frontend.cancel_handle();
    let job = tokio::spawn(frontend.run());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(launcher.outcomes().await.is_empty());
    cancel.cancel("Job interrupted").await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), job)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.cancel_reason.as_deref(), Some("Job interrupted"));

    assert_eventually(
        || {
            let launcher = launcher.clone();
            async move {
                launcher.outcomes().await
                    == vec![(0, BackendOutcome::Cancelled("Job interrupted".to_string()))]
            }
        },
        Duration::from_secs(5),
        "backend should see the user's reason",
    )
    .await;
    scheduler.stop().await;
}

#[tokio::test]
async fn test_scheduler_shutdown_cancels_running_job() {
    let scheduler = TestScheduler::start(1).await;
    let tasks = builtin_tasks().with("hang", Arc::new(Hang));
    let frontend = cluster_job::frontend::JobFrontend::connect_with_files(
        frontend_config(&scheduler, "hang", 1),
        Arc::new(InProcessLauncher::new(tasks)),
        test_harness::quiet_files(),
    )
    .await
    .unwrap();
    let job = tokio::spawn(frontend.run());

    tokio::time::sleep(Duration::from_millis(500)).await;
    scheduler.stop().await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), job)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reason = outcome.cancel_reason.unwrap();
    assert!(
        reason == "Job Scheduler shutting down" || reason == "Job Scheduler failed",
        "unexpected reason: {reason}"
    );
}

#[tokio::test]
async fn test_silent_frontend_lease_expires_at_scheduler() {
    use cluster_job::channel::{ChannelEvent, ChannelGroup, SchedulerProxy};
    use cluster_job::protocol::{Message, SchedulerMessage};

    let scheduler = TestScheduler::start(1).await;
    let mut group = ChannelGroup::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let proxy = SchedulerProxy::new(
        group
            .connect(&format!("127.0.0.1:{}", scheduler.port()))
            .await
            .unwrap(),
    );
    // Asks for a job and then never renews.
    proxy.request_job("tester", 1, 1, 1).unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let inbound = group.recv().await.expect("group closed");
            if let ChannelEvent::Message(Message::Scheduler(SchedulerMessage::CancelJob {
                reason,
            })) = inbound.event
            {
                return reason;
            }
        }
    })
    .await
    .expect("scheduler never cancelled the job");
    assert_eq!(reason, "Job frontend lease expired");
    scheduler.stop().await;
}

/// Launches rank 0 as a raw connection that reports ready twice.
struct DoubleReadyLauncher {
    inner: InProcessLauncher,
}

#[async_trait]
impl BackendLauncher for DoubleReadyLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<()> {
        use cluster_job::channel::{ChannelEvent, ChannelGroup, FrontendProxy};
        use cluster_job::protocol::BackendAddresses;

        if request.rank != 0 {
            return self.inner.launch(request).await;
        }
        let mut group = ChannelGroup::new();
        let frontend = FrontendProxy::new(group.connect(&request.frontend_addr).await?);
        let addresses = BackendAddresses {
            middleware: "127.0.0.1:1".to_string(),
            world: "127.0.0.1:2".to_string(),
            frontend: None,
        };
        frontend.backend_ready(0, addresses.clone())?;
        frontend.backend_ready(0, addresses)?;
        tokio::spawn(async move {
            while let Some(inbound) = group.recv().await {
                if matches!(inbound.event, ChannelEvent::Closed(_)) {
                    break;
                }
            }
        });
        Ok(())
    }
}

#[tokio::test]
async fn test_duplicate_ready_fails_that_rank() {
    use cluster_job::frontend::JobFrontend;
    use test_harness::quiet_files;

    let scheduler = TestScheduler::start(3).await;
    let launcher = DoubleReadyLauncher {
        inner: InProcessLauncher::default(),
    };
    let frontend = JobFrontend::connect_with_files(
        frontend_config(&scheduler, "echo", 3),
        Arc::new(launcher),
        quiet_files(),
    )
    .await
    .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(10), frontend.run())
        .await
        .expect("job did not end in time")
        .unwrap();

    assert_eq!(outcome.cancel_reason.as_deref(), Some("Backend failed, rank 0"));
    assert_eq!(outcome.backends[0].state, ProcessState::Failed);

    // The scheduler heard about the failed node.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let outcome = run_job(
        frontend_config(&scheduler, "echo", 3),
        InProcessLauncher::default(),
    )
    .await;
    assert_eq!(
        outcome.cancel_reason.as_deref(),
        Some("Not enough nodes: 3 requested, 2 available")
    );
    scheduler.stop().await;
}

#[tokio::test]
async fn test_request_for_no_processes_is_refused() {
    use cluster_job::channel::{ChannelEvent, ChannelGroup, SchedulerProxy};
    use cluster_job::protocol::{Message, SchedulerMessage};

    let scheduler = TestScheduler::start(1).await;
    let mut group = ChannelGroup::new();
    let proxy = SchedulerProxy::new(
        group
            .connect(&format!("127.0.0.1:{}", scheduler.port()))
            .await
            .unwrap(),
    );
    proxy.request_job("tester", 1, 0, 1).unwrap();

    let inbound = tokio::time::timeout(Duration::from_secs(5), group.recv())
        .await
        .expect("scheduler never answered")
        .expect("group closed");
    match inbound.event {
        ChannelEvent::Message(Message::Scheduler(SchedulerMessage::CancelJob { reason })) => {
            assert_eq!(reason, "Job requests no processes");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    // The refused request took no job number.
    let outcome = run_job(
        frontend_config(&scheduler, "echo", 1),
        InProcessLauncher::default(),
    )
    .await;
    assert!(outcome.is_success());
    assert_eq!(outcome.job_number, Some(1));
    scheduler.stop().await;
}
