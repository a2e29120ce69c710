use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use host_agent::client::{HostClient, StreamOutcome};
use host_agent::config::{AgentConfig, ProcessConfig, ZfsConfig, DEFAULT_PORT};
use host_agent::host::{ActiveJob, Job, ALL_JOBS};
use host_agent::node::Node;
use host_agent::shutdown::install_shutdown_handler;
use host_agent::volume::{ProviderSpec, PARENT_DATASET};

#[derive(Parser, Debug)]
#[command(name = "host-agent")]
#[command(version)]
#[command(about = "Per-host job and volume agent")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the host agent
    Server(ServerArgs),

    /// Job commands against a running agent
    Jobs {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Volume commands against a running agent
    Volume {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: VolumeCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds of stream inactivity before checking the streamed job still exists
    #[arg(long, default_value = "10")]
    stream_check_secs: u64,

    /// Events buffered per stream listener before it is dropped
    #[arg(long, default_value = "64")]
    listener_buffer: usize,

    /// Prune finished jobs this many seconds after they end (default: keep)
    #[arg(long)]
    retention_secs: Option<u64>,

    /// zfs binary used by zfs volume providers
    #[arg(long, default_value = "zfs")]
    zfs_binary: String,

    /// Shell used to run job commands
    #[arg(long, default_value = "sh")]
    shell: String,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Agent address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:1113")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// List jobs on the host
    List,
    /// Show one job
    Get { id: String },
    /// Stop a job
    Stop { id: String },
    /// Run a shell command as a job
    Run {
        /// Job ID (generated if omitted)
        #[arg(long)]
        id: Option<String>,
        /// Metadata as key=value, repeatable
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
        command: String,
    },
    /// Follow job events ("all" for every job)
    Events {
        #[arg(default_value = ALL_JOBS)]
        id: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum VolumeCommands {
    /// Register a volume provider
    CreateProvider {
        /// Provider kind, e.g. "zfs"
        kind: String,
        /// Provider ID (defaults to the kind)
        #[arg(long)]
        id: Option<String>,
        /// Parent dataset for zfs providers
        #[arg(long)]
        parent_dataset: Option<String>,
        /// Extra metadata as key=value, repeatable
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
    },
    /// Create a volume from a provider
    New { provider_id: String },
    /// Snapshot a volume
    Snapshot { volume_id: String },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

// =============================================================================
// Server
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = AgentConfig::new(SocketAddr::from(([0, 0, 0, 0], args.port)))
        .with_stream_check_interval(Duration::from_secs(args.stream_check_secs.max(1)))
        .with_listener_buffer(args.listener_buffer);
    if let Some(secs) = args.retention_secs {
        config = config.with_job_retention(Duration::from_secs(secs));
    }
    config.zfs = ZfsConfig {
        binary: args.zfs_binary,
    };
    config.process = ProcessConfig { shell: args.shell };

    tracing::info!(
        listen_addr = %config.listen_addr,
        stream_check_interval = ?config.stream_check_interval,
        listener_buffer = config.listener_buffer,
        job_retention = ?config.job_retention,
        "Starting host agent"
    );

    let shutdown = install_shutdown_handler();
    Node::new(config).run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

fn print_job_table(jobs: &[&ActiveJob]) {
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }
    println!("{:<38} {:<10} {:<6} COMMAND", "JOB ID", "STATUS", "EXIT");
    println!("{}", "-".repeat(78));
    for job in jobs {
        let exit = job
            .exit_status
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let command = job.job.command.as_deref().unwrap_or("-");
        let command = if command.chars().count() > 20 {
            format!("{}...", command.chars().take(17).collect::<String>())
        } else {
            command.to_string()
        };
        println!("{:<38} {:<10} {:<6} {}", job.id(), job.status, exit, command);
    }
}

async fn handle_jobs(
    client: &HostClient,
    command: JobCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::List => {
            let jobs = client.list_jobs().await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Table => {
                    let mut sorted: Vec<&ActiveJob> = jobs.values().collect();
                    sorted.sort_by_key(|j| j.created_at);
                    print_job_table(&sorted);
                }
            }
        }
        JobCommands::Get { id } => match client.get_job(&id).await? {
            Some(job) => match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Table => print_job_table(&[&job]),
            },
            None => {
                eprintln!("Error: no such job: {}", id);
                std::process::exit(1);
            }
        },
        JobCommands::Stop { id } => {
            client.stop_job(&id).await?;
            println!("Stop requested for job {}", id);
        }
        JobCommands::Run {
            id,
            metadata,
            command,
        } => {
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let mut job = Job::new(id.clone()).with_command(command);
            job.metadata.extend(metadata);
            client.add_job(&job).await?;
            println!("Job {} accepted", id);
        }
        JobCommands::Events { id } => {
            let mut events = client.stream_events(&id).await?;
            while let Some(event) = events.next_event().await {
                match output {
                    OutputFormat::Json => println!("{}", serde_json::to_string(&event)?),
                    OutputFormat::Table => println!("{:<38} {}", event.job_id, event.status),
                }
            }
            if let Some(StreamOutcome::Failed(e)) = events.outcome() {
                eprintln!("Error: event stream ended: {}", e);
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

async fn handle_volume(
    client: &HostClient,
    command: VolumeCommands,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        VolumeCommands::CreateProvider {
            kind,
            id,
            parent_dataset,
            metadata,
        } => {
            let mut spec = ProviderSpec::new(kind);
            spec.id = id;
            spec.metadata.extend(metadata);
            if let Some(parent) = parent_dataset {
                spec.metadata.insert(PARENT_DATASET.to_string(), parent);
            }
            client.create_provider(&spec).await?;
            println!("Provider {} registered", spec.provider_id()?);
        }
        VolumeCommands::New { provider_id } => {
            let volume_id = client.new_volume(&provider_id).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string(&volume_id)?),
                OutputFormat::Table => println!("Volume ID: {}", volume_id),
            }
        }
        VolumeCommands::Snapshot { volume_id } => {
            let snapshot = client.snapshot(&volume_id).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                OutputFormat::Table => {
                    println!("Snapshot ID: {}", snapshot.id);
                    println!("Location:    {}", snapshot.location.display());
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Jobs { client, command } => {
            let host = HostClient::new(client.addr.clone());
            handle_jobs(&host, command, &client.output).await?;
        }
        Commands::Volume { client, command } => {
            let host = HostClient::new(client.addr.clone());
            handle_volume(&host, command, &client.output).await?;
        }
    }

    Ok(())
}
