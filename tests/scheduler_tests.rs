use cluster_job::channel::ChannelId;
use cluster_job::config::NodeSpec;
use cluster_job::scheduler::assigner::NodeAssigner;
use cluster_job::scheduler::job::{Job, JobRequest, JobStatus};
use cluster_job::scheduler::queue::JobTable;

fn request(nodes: u32, procs: u32, threads: u32) -> JobRequest {
    JobRequest {
        user: "alice".to_string(),
        nodes,
        procs,
        threads,
    }
}

fn node(name: &str, cores: u32) -> NodeSpec {
    NodeSpec {
        name: name.to_string(),
        host: format!("{name}.cluster"),
        cores,
    }
}

fn cluster(count: usize, cores: u32) -> NodeAssigner {
    NodeAssigner::new((0..count).map(|i| node(&format!("n{i}"), cores)))
}

#[test]
fn test_job_creation() {
    let job = Job::new(7, request(2, 4, 1), ChannelId(3));
    assert_eq!(job.number, 7);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.frontend, ChannelId(3));
    assert!(job.placements.is_empty());
    assert!(job.completed_at.is_none());
}

#[test]
fn test_job_numbers_start_at_one_and_increase() {
    let mut table = JobTable::new();
    let first = table.add_job(request(1, 1, 1), ChannelId(1)).unwrap();
    let second = table.add_job(request(1, 1, 1), ChannelId(2)).unwrap();
    assert_eq!(first, 1);
    assert_eq!(second, 2);

    // Numbers are not reused after cleanup.
    table.end_job(first, JobStatus::Finished, None);
    table.end_job(second, JobStatus::Finished, None);
    assert_eq!(table.cleanup_finished_jobs(), 2);
    assert_eq!(table.add_job(request(1, 1, 1), ChannelId(3)), Some(3));
}

#[test]
fn test_job_table_operations() {
    let mut table = JobTable::new();
    let number = table.add_job(request(2, 2, 0), ChannelId(5)).unwrap();

    assert_eq!(table.job_for_channel(ChannelId(5)), Some(number));
    assert_eq!(table.active_jobs().len(), 1);

    let mut assigner = cluster(2, 4);
    let placements = assigner.assign(number, &request(2, 2, 0)).unwrap();
    assert!(table.start_job(number, placements));
    assert_eq!(table.get_job(number).unwrap().status, JobStatus::Running);
    assert_eq!(table.get_job(number).unwrap().nodes(), vec!["n0", "n1"]);

    // A running job cannot be started twice.
    assert!(!table.start_job(number, Vec::new()));

    assert!(table.end_job(
        number,
        JobStatus::Cancelled,
        Some("Job frontend failed".to_string())
    ));
    let job = table.get_job(number).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.cancel_reason.as_deref(), Some("Job frontend failed"));
    assert!(job.completed_at.is_some());

    // Ended jobs no longer answer for their channel, and end only once.
    assert_eq!(table.job_for_channel(ChannelId(5)), None);
    assert!(!table.end_job(number, JobStatus::Finished, None));
    assert!(table.active_jobs().is_empty());
}

#[test]
fn test_job_table_capacity() {
    let mut table = JobTable::with_capacity(2);
    assert!(table.add_job(request(1, 1, 1), ChannelId(1)).is_some());
    assert!(table.add_job(request(1, 1, 1), ChannelId(2)).is_some());
    assert!(table.is_full());
    assert!(table.add_job(request(1, 1, 1), ChannelId(3)).is_none());
    assert_eq!(table.len(), 2);
}

#[test]
fn test_round_robin_placement() {
    let mut assigner = cluster(3, 4);
    let placements = assigner.assign(1, &request(2, 5, 1)).unwrap();

    let nodes: Vec<&str> = placements.iter().map(|p| p.node.as_str()).collect();
    assert_eq!(nodes, vec!["n0", "n1", "n0", "n1", "n0"]);
    let ranks: Vec<u32> = placements.iter().map(|p| p.rank).collect();
    assert_eq!(ranks, vec![0, 1, 2, 3, 4]);
    assert_eq!(placements[0].host, "n0.cluster");
}

#[test]
fn test_node_count_capped_at_process_count() {
    let mut assigner = cluster(4, 4);
    let placements = assigner.assign(1, &request(4, 2, 1)).unwrap();
    assert_eq!(placements.len(), 2);
    assert_eq!(placements[0].node, "n0");
    assert_eq!(placements[1].node, "n1");
}

#[test]
fn test_zero_threads_divides_cores() {
    let mut assigner = cluster(2, 8);
    // n0 runs ranks 0 and 2, n1 runs rank 1.
    let placements = assigner.assign(1, &request(2, 3, 0)).unwrap();
    assert_eq!(placements[0].threads, 4);
    assert_eq!(placements[1].threads, 8);
    assert_eq!(placements[2].threads, 4);

    // Explicit thread counts pass through unchanged.
    let placements = assigner.assign(2, &request(2, 3, 3)).unwrap();
    assert!(placements.iter().all(|p| p.threads == 3));
}

#[test]
fn test_threads_never_drop_to_zero() {
    let mut assigner = cluster(1, 2);
    let placements = assigner.assign(1, &request(1, 5, 0)).unwrap();
    assert!(placements.iter().all(|p| p.threads == 1));
}

#[test]
fn test_not_enough_nodes() {
    let mut assigner = cluster(2, 4);
    assert!(assigner.assign(1, &request(3, 3, 1)).is_none());
    // A refused request holds no nodes.
    assert!(assigner.all_nodes().iter().all(|n| n.running_jobs.is_empty()));
}

#[test]
fn test_least_loaded_nodes_preferred() {
    let mut assigner = cluster(3, 4);
    assigner.assign(1, &request(1, 1, 1)).unwrap();
    assigner.assign(2, &request(1, 1, 1)).unwrap();

    // n0 and n1 each hold a job, so n2 is chosen first.
    let placements = assigner.assign(3, &request(1, 1, 1)).unwrap();
    assert_eq!(placements[0].node, "n2");

    assigner.release(1);
    let placements = assigner.assign(4, &request(1, 1, 1)).unwrap();
    assert_eq!(placements[0].node, "n0");
}

#[test]
fn test_release_frees_nodes() {
    let mut assigner = cluster(2, 4);
    assigner.assign(1, &request(2, 2, 1)).unwrap();
    assert!(assigner.get("n0").unwrap().running_jobs.contains(&1));

    assigner.release(1);
    assert!(assigner.all_nodes().iter().all(|n| n.running_jobs.is_empty()));
}

#[test]
fn test_failed_node_excluded() {
    let mut assigner = cluster(3, 4);
    assert!(assigner.mark_failed("n1"));
    assert!(!assigner.mark_failed("n9"));
    assert_eq!(assigner.available_nodes(), vec!["n0", "n2"]);

    let placements = assigner.assign(1, &request(2, 2, 1)).unwrap();
    assert!(placements.iter().all(|p| p.node != "n1"));
    assert!(assigner.assign(2, &request(3, 3, 1)).is_none());
}

#[test]
fn test_register_node_later() {
    let mut assigner = NodeAssigner::default();
    assert!(assigner.assign(1, &request(1, 1, 1)).is_none());

    assigner.register_node(node("late", 2));
    let placements = assigner.assign(2, &request(1, 1, 0)).unwrap();
    assert_eq!(placements[0].node, "late");
    assert_eq!(placements[0].threads, 2);
}
