use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use cluster_job::backend::builtin::builtin_tasks;
use cluster_job::backend::{BackendOutcome, JobBackend};
use cluster_job::config::{
    BackendConfig, FrontendConfig, NodeSpec, SchedulerConfig, DEFAULT_SCHEDULER_PORT,
    ENV_JOB_TIMEOUT, ENV_SCHEDULER_HOST, ENV_SCHEDULER_PORT,
};
use cluster_job::frontend::{JobFrontend, JobOutcome, SshLauncher};
use cluster_job::resource::LocalResources;
use cluster_job::scheduler::JobScheduler;
use cluster_job::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "cluster-job")]
#[command(version)]
#[command(about = "Run parallel jobs across a workstation cluster")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the cluster's job scheduler
    Scheduler(SchedulerArgs),

    /// Run a job and wait for it to end
    Run(RunArgs),

    /// Start one backend process (launched by a job frontend)
    Backend(BackendArgs),
}

// =============================================================================
// Scheduler Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SchedulerArgs {
    /// Port to listen on for frontends
    #[arg(long, env = ENV_SCHEDULER_PORT, default_value_t = DEFAULT_SCHEDULER_PORT)]
    port: u16,

    /// Cluster nodes (comma-separated, format: "name[:host][:cores]")
    /// Example: "n1:10.0.0.1:8,n2:10.0.0.2:8"
    #[arg(long, value_delimiter = ',', required = true)]
    nodes: Vec<String>,

    /// Program nodes run to start a backend
    #[arg(long, default_value = "cluster-job")]
    program: String,
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Main entry point each backend runs
    main: String,

    /// Arguments passed to the main entry point
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Number of processes
    #[arg(long, default_value = "1")]
    np: u32,

    /// Number of nodes (defaults to the number of processes)
    #[arg(long)]
    nn: Option<u32>,

    /// Threads per process (0 = all cores of the node)
    #[arg(long, default_value = "0")]
    nt: u32,

    /// Scheduler host
    #[arg(long, env = ENV_SCHEDULER_HOST)]
    scheduler_host: Option<String>,

    /// Scheduler port
    #[arg(long, env = ENV_SCHEDULER_PORT)]
    scheduler_port: Option<u16>,

    /// Host name backends use to reach this frontend
    #[arg(long)]
    host: Option<String>,

    /// Give the job a frontend communicator
    #[arg(long)]
    frontend_comm: bool,

    /// Cancel the job after this many seconds
    #[arg(long, env = ENV_JOB_TIMEOUT)]
    timeout: Option<u64>,

    /// Output format for the job report
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Backend Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct BackendArgs {
    /// Frontend address (host:port)
    #[arg(long)]
    frontend: String,

    /// Job number
    #[arg(long)]
    job: u64,

    /// This backend's rank
    #[arg(long)]
    rank: u32,

    /// Threads for this backend
    #[arg(long, default_value = "1")]
    threads: u32,

    /// Host name other processes use to reach this backend
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Open a frontend communicator endpoint
    #[arg(long)]
    frontend_comm: bool,

    /// Local resource directories searched before asking the frontend
    #[arg(long, value_delimiter = ':', default_value = ".")]
    classpath: Vec<PathBuf>,
}

// =============================================================================
// Scheduler
// =============================================================================

async fn run_scheduler(args: SchedulerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = SchedulerConfig::new(SocketAddr::from(([0, 0, 0, 0], args.port)));
    for spec in &args.nodes {
        let node = NodeSpec::parse(spec).ok_or_else(|| format!("invalid node spec: {spec}"))?;
        config = config.with_node(&node.name, &node.host, node.cores);
    }
    config.launch.program = args.program;

    let shutdown = install_shutdown_handler();
    let scheduler = JobScheduler::bind(config).await?;
    scheduler.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Frontend
// =============================================================================

async fn run_job(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = FrontendConfig::from_env()?;
    config.main_class = args.main;
    config.args = args.args;
    config.procs = args.np;
    config.nodes = args.nn.unwrap_or(args.np);
    config.threads = args.nt;
    config.has_frontend_comm = args.frontend_comm;
    config.advertised_host = args.host;
    if let Some(host) = args.scheduler_host {
        config.scheduler_host = host;
    }
    if let Some(port) = args.scheduler_port {
        config.scheduler_port = port;
    }
    if let Some(secs) = args.timeout {
        config.job_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }

    let frontend = JobFrontend::connect(config, Arc::new(SshLauncher::default())).await?;

    let shutdown = install_shutdown_handler();
    let cancel = frontend.cancel_handle();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        cancel.cancel("Job interrupted").await;
    });

    let outcome = frontend.run().await?;
    print_outcome(&outcome, &args.output)?;
    if !outcome.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_outcome(
    outcome: &JobOutcome,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(outcome)?);
        }
        OutputFormat::Table => {
            let job = outcome
                .job_number
                .map_or_else(|| "-".to_string(), |n| n.to_string());
            println!("Job:       {}", job);
            match &outcome.cancel_reason {
                Some(reason) => println!("Status:    cancelled ({})", reason),
                None => println!("Status:    finished"),
            }
            println!("Finished:  {}/{}", outcome.finished, outcome.procs);
            println!();
            println!("{:<6} {:<16} {:<20} {:<12}", "RANK", "NODE", "HOST", "STATE");
            println!("{}", "-".repeat(56));
            for b in &outcome.backends {
                println!(
                    "{:<6} {:<16} {:<20} {:<12}",
                    b.rank,
                    b.node.as_deref().unwrap_or("-"),
                    b.host.as_deref().unwrap_or("-"),
                    b.state
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Backend
// =============================================================================

async fn run_backend(args: BackendArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = BackendConfig::new(args.frontend, args.job, args.rank);
    config.threads = args.threads;
    config.advertised_host = args.host;
    config.frontend_comm = args.frontend_comm;

    let local = Arc::new(LocalResources::new(args.classpath));
    let backend = JobBackend::connect(config, builtin_tasks(), local).await?;
    match backend.run().await? {
        BackendOutcome::Finished => Ok(()),
        BackendOutcome::Cancelled(reason) => Err(format!("job cancelled: {reason}").into()),
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the job's own output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Scheduler(scheduler_args) => run_scheduler(scheduler_args).await?,
        Commands::Run(run_args) => run_job(run_args).await?,
        Commands::Backend(backend_args) => run_backend(backend_args).await?,
    }

    Ok(())
}
