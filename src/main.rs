use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use ringkv::admin::{CacheConfig, CachePolicy};
use ringkv::ecs::config::{DEFAULT_FAILURE_PORT, DEFAULT_LAUNCH_TIMEOUT};
use ringkv::ecs::{
    ClusterOrchestrator, EcsConfig, EcsState, FailureDetector, InProcessLauncher, LocalLauncher,
    NodeLauncher, NodePool, SshLauncher,
};
use ringkv::node::server::READY_MARKER;
use ringkv::node::spawn_node;
use ringkv::replication::ReplicationConfig;
use ringkv::ring::NodeAddr;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "ringkv", about = "Partitioned, replicated key-value store")]
struct Args {
    /// Log at DEBUG instead of INFO.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one storage node (normally started by the ECS).
    Node(NodeArgs),
    /// Run the configuration service with an interactive operator prompt.
    Ecs(EcsArgs),
}

#[derive(Parser, Debug)]
struct NodeArgs {
    #[arg(long)]
    host: String,

    #[arg(long)]
    port: u16,

    /// Failure listener of the ECS.
    #[arg(long)]
    ecs: Option<SocketAddr>,

    #[arg(long, default_value_t = 1000)]
    heartbeat_ms: u64,

    #[arg(long, default_value_t = 5000)]
    heartbeat_timeout_ms: u64,

    #[arg(long, default_value_t = 500)]
    gossip_ms: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LauncherKind {
    Local,
    Ssh,
    /// Nodes run as tasks inside the ECS process.
    InProcess,
}

#[derive(Parser, Debug)]
struct EcsArgs {
    /// Node pool file, one `name host port` per line.
    #[arg(long)]
    pool: PathBuf,

    /// Address of the failure listener; handed to every node.
    #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_FAILURE_PORT)))]
    failure_addr: SocketAddr,

    /// Program the launcher runs for each node.
    #[arg(long, default_value = "ringkv")]
    node_command: String,

    #[arg(long, value_enum, default_value_t = LauncherKind::Local)]
    launcher: LauncherKind,

    #[arg(long, default_value_t = DEFAULT_LAUNCH_TIMEOUT.as_secs())]
    launch_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    match args.cmd {
        Command::Node(node) => run_node(node).await,
        Command::Ecs(ecs) => run_ecs(ecs).await,
    }
}

async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    let addr = NodeAddr::new(args.host, args.port);
    let config = ReplicationConfig {
        heartbeat_interval: Duration::from_millis(args.heartbeat_ms),
        heartbeat_timeout: Duration::from_millis(args.heartbeat_timeout_ms),
        gossip_interval: Duration::from_millis(args.gossip_ms),
        failure_report_addr: args.ecs,
    };

    let running = spawn_node(addr.clone(), config)
        .await
        .with_context(|| format!("starting node {}", addr))?;

    // The launcher reads stdout for this line.
    println!("{} {}", READY_MARKER, addr);
    std::io::stdout().flush()?;

    running.wait().await;
    tracing::info!("Node {} exited", addr);
    Ok(())
}

async fn run_ecs(args: EcsArgs) -> anyhow::Result<()> {
    let pool = NodePool::load(&args.pool)?;
    tracing::info!("Loaded {} pool node(s) from {}", pool.len(), args.pool.display());

    // 1. Failure listener first, so nodes learn its real address:
    let detector = FailureDetector::bind(args.failure_addr).await?;
    let config = EcsConfig {
        failure_addr: detector.local_addr(),
        node_command: args.node_command,
        launch_timeout: Duration::from_secs(args.launch_timeout_secs),
        ..EcsConfig::default()
    };

    // 2. Launcher:
    let launcher: Arc<dyn NodeLauncher> = match args.launcher {
        LauncherKind::Local => Arc::new(LocalLauncher::new(config.launch_timeout)),
        LauncherKind::Ssh => Arc::new(SshLauncher::new(config.launch_timeout)),
        LauncherKind::InProcess => InProcessLauncher::new(ReplicationConfig {
            failure_report_addr: Some(config.failure_addr),
            ..ReplicationConfig::default()
        }),
    };

    // 3. Orchestrator:
    let orchestrator = ClusterOrchestrator::new(config, pool, launcher);
    let _detector_handle = detector.serve(orchestrator.clone());

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();

    while let Some(line) = lines.next_line().await? {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            prompt();
            continue;
        }

        let quit = matches!(words[0], "quit" | "exit");
        if let Err(e) = run_command(&orchestrator, &words).await {
            println!("error: {}", e);
        }
        if quit {
            break;
        }
        prompt();
    }

    if orchestrator.state().await != EcsState::ShutDown
        && let Err(e) = orchestrator.shutdown().await
    {
        tracing::warn!("Shutdown on exit incomplete: {}", e);
    }
    Ok(())
}

async fn run_command(orchestrator: &Arc<ClusterOrchestrator>, words: &[&str]) -> anyhow::Result<()> {
    match words {
        ["init", count, size, policy] => {
            let cache = parse_cache(size, policy)?;
            orchestrator.init_service(count.parse()?, cache).await?;
            println!("initialized");
        }
        ["start"] => {
            orchestrator.start().await?;
            println!("started");
        }
        ["stop"] => {
            orchestrator.stop().await?;
            println!("stopped");
        }
        ["add"] => {
            let cache = orchestrator.config().default_cache;
            let addr = orchestrator.add_node(cache).await?;
            println!("added {}", addr);
        }
        ["add", size, policy] => {
            let addr = orchestrator.add_node(parse_cache(size, policy)?).await?;
            println!("added {}", addr);
        }
        ["remove"] => {
            let addr = orchestrator.remove_node(None).await?;
            println!("removed {}", addr);
        }
        ["remove", target] => {
            let addr = orchestrator.remove_node(Some(target.parse()?)).await?;
            println!("removed {}", addr);
        }
        ["lock"] => {
            orchestrator.lock_write().await?;
            println!("write lock set");
        }
        ["unlock"] => {
            orchestrator.unlock_write().await?;
            println!("write lock released");
        }
        ["status"] => {
            let status = orchestrator.status().await;
            println!("state: {:?}", status.state);
            if let Some(cache) = status.cache {
                println!("cache: {} {}", cache.size, cache.policy);
            }
            for node in status.metadata.nodes() {
                println!("  {:<12} {:<22} {}", node.name, node.addr, node.range);
            }
        }
        ["shutdown"] | ["quit"] | ["exit"] => {
            if orchestrator.state().await != EcsState::ShutDown {
                orchestrator.shutdown().await?;
            }
            println!("shut down");
        }
        ["help"] => print_help(),
        _ => println!("unknown command '{}', try 'help'", words.join(" ")),
    }
    Ok(())
}

fn parse_cache(size: &str, policy: &str) -> anyhow::Result<CacheConfig> {
    Ok(CacheConfig {
        size: size
            .parse()
            .with_context(|| format!("bad cache size '{}'", size))?,
        policy: policy.parse::<CachePolicy>()?,
    })
}

fn prompt() {
    print!("ecs> ");
    let _ = std::io::stdout().flush();
}

fn print_help() {
    println!("commands:");
    println!("  init <nodes> <cacheSize> <FIFO|LRU|LFU>");
    println!("  start | stop | lock | unlock | status");
    println!("  add [<cacheSize> <policy>]");
    println!("  remove [<host:port>]");
    println!("  shutdown | quit");
}
