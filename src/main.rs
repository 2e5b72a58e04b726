use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use task_dispatch::config::{AppConfig, NodeSettings};
use task_dispatch::dispatch::dispatcher::TaskDispatcher;
use task_dispatch::executor::builtin::register_builtin_handlers;
use task_dispatch::executor::local::LocalExecutor;
use task_dispatch::executor::registry::TaskHandlerRegistry;
use task_dispatch::executor::types::{Task, TaskId, TaskState, into_payload};
use task_dispatch::node::placement::PlacementPolicy;
use task_dispatch::node::probe::HttpHealthProbe;
use task_dispatch::node::registry::NodeRegistry;
use task_dispatch::remote::client::HttpRemoteClient;
use task_dispatch::remote::server::RemoteTaskServer;
use task_dispatch::remote::system::SystemLoadSampler;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "task-node", version, about = "Run a task worker node or dispatch tasks to one")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "TASK_NODE_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the task protocol so dispatchers can run tasks on this machine
    Serve {
        /// Address to listen on, e.g. 0.0.0.0:7000
        #[arg(long)]
        bind: Option<String>,

        /// Concurrent tasks before submissions are refused as saturated
        #[arg(long)]
        max_workers: Option<usize>,
    },

    /// Submit one task and print its final execution as JSON
    Submit {
        /// Registered task type, e.g. echo
        task_type: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,

        #[arg(long)]
        task_id: Option<String>,

        #[arg(long, default_value_t = 0)]
        priority: i32,

        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Extra node as id=host:port (repeatable)
        #[arg(long = "node")]
        nodes: Vec<String>,
    },

    /// Probe every configured node and print its health and score
    Nodes {
        /// Extra node as id=host:port (repeatable)
        #[arg(long = "node")]
        nodes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { bind, max_workers } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(max_workers) = max_workers {
                config.server.max_workers = max_workers;
            }
            config.validate()?;
            serve(config).await
        }
        Command::Submit {
            task_type,
            payload,
            task_id,
            priority,
            timeout_secs,
            nodes,
        } => {
            add_cli_nodes(&mut config, &nodes)?;
            config.validate()?;

            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload must be valid JSON")?;
            let mut task = Task::new(task_type, into_payload(payload))
                .with_priority(priority)
                .with_timeout(
                    timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| config.default_task_timeout()),
                );
            if let Some(task_id) = task_id {
                task = task.with_id(TaskId(task_id));
            }

            submit(config, task).await
        }
        Command::Nodes { nodes } => {
            add_cli_nodes(&mut config, &nodes)?;
            config.validate()?;
            list_nodes(config).await
        }
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let handlers = TaskHandlerRegistry::new();
    register_builtin_handlers(&handlers);

    let server = RemoteTaskServer::new(
        handlers,
        config.server.max_workers,
        Arc::new(SystemLoadSampler::new()),
    );
    server.clone().spawn_sweeper(config.finished_retention());

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;

    tracing::info!("Press Ctrl+C to shutdown");
    server.serve(listener).await
}

async fn submit(config: AppConfig, task: Task) -> anyhow::Result<()> {
    let dispatcher = build_dispatcher(&config)?;

    let execution = dispatcher.submit(task).await;
    println!("{}", serde_json::to_string_pretty(&execution)?);

    if execution.state == TaskState::Failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn list_nodes(config: AppConfig) -> anyhow::Result<()> {
    let registry = build_registry(&config)?;
    registry.refresh_all().await;

    let policy = PlacementPolicy::for_cache_ttl(registry.config().health_cache_ttl);
    let nodes = registry.nodes();
    let snapshots = registry.cached_snapshots();
    let ranked = policy.rank(&nodes, &snapshots, Instant::now());

    for node in &nodes {
        let rank = ranked.iter().position(|r| r.node.id == node.id);
        match (snapshots.get(&node.id), rank) {
            (Some(snapshot), Some(rank)) => println!(
                "#{} {} {} cpu={:.1}% mem={:.1}% tasks={} score={:.1}",
                rank + 1,
                node.id,
                node.address,
                snapshot.cpu_percent,
                snapshot.memory_percent,
                snapshot.active_task_count,
                ranked[rank].score
            ),
            _ => println!("-- {} {} unreachable", node.id, node.address),
        }
    }

    Ok(())
}

fn build_registry(config: &AppConfig) -> anyhow::Result<Arc<NodeRegistry>> {
    let registry = NodeRegistry::new(Arc::new(HttpHealthProbe::new()), config.registry_config());
    for node in config.node_list()? {
        registry.register_node(node);
    }
    Ok(registry)
}

fn build_dispatcher(config: &AppConfig) -> anyhow::Result<Arc<TaskDispatcher>> {
    let registry = build_registry(config)?;
    if let Some(interval) = config.refresh_interval() {
        registry.clone().spawn_refresh_loop(interval);
    }

    let handlers = TaskHandlerRegistry::new();
    register_builtin_handlers(&handlers);
    let local = LocalExecutor::new(handlers, config.dispatcher.max_local_workers);
    let remote = Arc::new(HttpRemoteClient::new(
        config.poll_interval(),
        config.request_timeout(),
    ));

    let dispatcher = TaskDispatcher::new(registry, remote, local);
    dispatcher.clone().spawn_sweeper(config.execution_retention());
    Ok(dispatcher)
}

fn add_cli_nodes(config: &mut AppConfig, nodes: &[String]) -> anyhow::Result<()> {
    for entry in nodes {
        let (id, address) = entry
            .split_once('=')
            .with_context(|| format!("--node expects id=host:port, got '{}'", entry))?;
        config.nodes.retain(|node| node.id != id);
        config.nodes.push(NodeSettings {
            id: id.to_string(),
            address: address.to_string(),
        });
    }
    Ok(())
}
