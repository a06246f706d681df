mod canvas;
mod channel;
mod container;
mod host_commands;
mod http;
mod inbox;
mod ipc;
mod process_group;
mod queue;
mod scheduler;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use hutch_core::model::{MountAllowlistEntry, RegisteredGroup};
use hutch_core::{HutchConfig, load_config};
use hutch_store::{StateStore, now_timestamp};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::container::runner::{
    ContainerRunner, RunnerSettings, cleanup_orphans, ensure_runtime_available,
};
use crate::host_commands::HostCommandTable;
use crate::inbox::Inbox;
use crate::ipc::{BrokerSettings, IpcBroker, is_valid_folder};
use crate::process_group::{ProcessContext, build_exhaustion_fn, build_process_messages_fn};
use crate::queue::{GroupQueue, QueueSettings};
use crate::scheduler::TaskScheduler;

const DEFAULT_CONFIG: &str = "config/hutch.toml";

#[derive(Parser, Debug)]
#[command(name = "hutchd", version, about = "Hutch host daemon: chat groups to sandboxed agents")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator and its HTTP service.
    Serve(ServeArgs),
    /// Print effective config as JSON.
    PrintConfig(ConfigArgs),
    /// Register (or update) a group by hand.
    RegisterGroup(RegisterGroupArgs),
    /// List registered groups as JSON.
    ListGroups(ConfigArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    #[arg(long)]
    bind: Option<String>,
}

#[derive(clap::Args, Debug)]
struct ConfigArgs {
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
}

#[derive(clap::Args, Debug)]
struct RegisterGroupArgs {
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    #[arg(long)]
    jid: String,
    #[arg(long)]
    folder: String,
    #[arg(long)]
    trigger: String,
    #[arg(long)]
    name: Option<String>,
    /// Respond to every message, not only triggered ones.
    #[arg(long)]
    no_trigger_required: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: PathBuf::from(DEFAULT_CONFIG),
        bind: None,
    })) {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => print_config(args),
        Command::RegisterGroup(args) => register_group(args),
        Command::ListGroups(args) => list_groups(args),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("HUTCH_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .init();
    }
}

fn load(path: &Path) -> anyhow::Result<HutchConfig> {
    load_config(path).with_context(|| format!("failed to load config from {}", path.display()))
}

fn project_root() -> anyhow::Result<PathBuf> {
    std::env::current_dir().context("failed to resolve current working directory")
}

fn open_store(config: &HutchConfig, root: &Path) -> anyhow::Result<StateStore> {
    let path = root.join(&config.storage.state_db);
    StateStore::open(&path)
        .with_context(|| format!("failed to open state db {}", path.display()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AllowlistSeed {
    Entries(Vec<MountAllowlistEntry>),
    Wrapped { entries: Vec<MountAllowlistEntry> },
}

fn import_allowlist_seed(store: &StateStore, path: &Path) -> anyhow::Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read allowlist seed {}", path.display()))?;
    let entries = match serde_json::from_str::<AllowlistSeed>(&raw)
        .with_context(|| format!("failed to parse allowlist seed {}", path.display()))?
    {
        AllowlistSeed::Entries(entries) | AllowlistSeed::Wrapped { entries } => entries,
    };
    store
        .upsert_allowlist(&entries)
        .context("failed to store allowlist seed")?;
    Ok(entries.len())
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let root = project_root()?;
    let store = open_store(&config, &root)?;

    if let Some(seed) = config.storage.allowlist_seed.as_deref() {
        let seed = root.join(seed);
        if seed.exists() {
            let count = import_allowlist_seed(&store, &seed)?;
            info!(count, path = %seed.display(), "mount allowlist seed imported");
        } else {
            warn!(path = %seed.display(), "allowlist seed not found, skipping");
        }
    }

    let runtime_bin = config.container.runtime_bin.clone();
    match ensure_runtime_available(&runtime_bin).await {
        Ok(()) => cleanup_orphans(&runtime_bin).await,
        Err(e) => warn!(error = %e, "container runtime unavailable, runs will fail until it is up"),
    }

    let queue = GroupQueue::new(QueueSettings::from_config(&config.orchestrator));
    let inbox = Inbox::with_limit(config.orchestrator.max_buffered_messages);
    let runner = ContainerRunner::new(RunnerSettings::from_config(&config, root.clone()));
    let channel = channel::sink_from_config(config.server.channel_callback_url.as_deref())?;

    let ctx = ProcessContext {
        store: store.clone(),
        queue: queue.clone(),
        inbox: inbox.clone(),
        runner: runner.clone(),
        channel,
        assistant_name: config.orchestrator.assistant_name.clone(),
        main_group_folder: config.orchestrator.main_group_folder.clone(),
    };
    queue
        .set_process_messages_fn(build_process_messages_fn(ctx.clone()))
        .await;
    queue.set_on_exhaustion_fn(build_exhaustion_fn(ctx)).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let broker = IpcBroker::new(
        BrokerSettings {
            data_dir: runner.settings().data_dir.clone(),
            poll_interval: Duration::from_millis(config.ipc.poll_interval_ms.max(50)),
            main_group_folder: config.orchestrator.main_group_folder.clone(),
            timezone: config.scheduler.timezone.clone(),
            oauth_refresh_command: config.oauth.refresh_command.clone(),
        },
        store.clone(),
        HostCommandTable::new(config.host_commands.clone()),
    );
    let broker_task = tokio::spawn(broker.run(shutdown_rx.clone()));

    let scheduler = TaskScheduler::new(
        store.clone(),
        queue.clone(),
        inbox.clone(),
        config.scheduler.clone(),
    );
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    let bind = config.server.bind.clone();
    let state = http::AppState {
        started_at: Instant::now(),
        config: Arc::new(config),
        store,
        queue: queue.clone(),
        inbox,
    };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind listener on {bind}"))?;

    info!(bind = %bind, "hutchd listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await
        .context("server exited unexpectedly")?;

    shutdown_tx.send(true).ok();
    queue.shutdown().await;
    for task in [broker_task, scheduler_task] {
        if let Err(e) = task.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    info!("hutchd stopped");
    Ok(())
}

fn print_config(args: ConfigArgs) -> anyhow::Result<()> {
    let cfg = load(&args.config)?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

fn register_group(args: RegisterGroupArgs) -> anyhow::Result<()> {
    let config = load(&args.config)?;
    if !is_valid_folder(&args.folder) {
        anyhow::bail!("invalid folder name {:?}", args.folder);
    }

    let store = open_store(&config, &project_root()?)?;
    if let Some(holder) = store.get_group_by_folder(&args.folder)? {
        if holder.jid != args.jid {
            anyhow::bail!("folder {} already used by {}", args.folder, holder.jid);
        }
    }

    let existing = store.get_group(&args.jid)?;
    let name = match args.name {
        Some(name) => name,
        None => store
            .get_chat(&args.jid)?
            .and_then(|chat| chat.name)
            .unwrap_or_else(|| args.jid.clone()),
    };
    let group = RegisteredGroup {
        is_main: args.folder == config.orchestrator.main_group_folder,
        requires_trigger: !args.no_trigger_required,
        container_config: existing.as_ref().and_then(|g| g.container_config.clone()),
        added_at: existing
            .map(|g| g.added_at)
            .unwrap_or_else(now_timestamp),
        jid: args.jid,
        name,
        folder: args.folder,
        trigger: args.trigger,
        disbanded: false,
    };
    store.upsert_group(&group).context("failed to register group")?;
    println!("{}", serde_json::to_string_pretty(&group)?);
    Ok(())
}

fn list_groups(args: ConfigArgs) -> anyhow::Result<()> {
    let config = load(&args.config)?;
    let store = open_store(&config, &project_root()?)?;
    let groups = store.list_groups().context("failed to list groups")?;
    println!("{}", serde_json::to_string_pretty(&groups)?);
    Ok(())
}
