mod console;

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use relay_config::Config;
use relay_core::{init_logging, write_envelope, ChannelSender, GracefulShutdown, Orchestrator};
use relay_db::{Database, TaskRepository, TaskRunRepository};
use relay_types::{AdditionalMount, ContainerConfig, IpcEnvelope, RegisteredGroup};
use tracing::{error, info};

use crate::console::{console_jid, ConsoleChannel};

#[derive(Parser)]
#[command(name = "relay", about = "AgentRelay - agent orchestration host", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator until SIGINT/SIGTERM
    Serve {
        /// Register a conversation for this folder fed from stdin
        /// (privileged when it is MAIN_GROUP_FOLDER)
        #[arg(long)]
        console: Option<String>,
    },
    /// Register or update a conversation
    Register {
        /// Chat id, e.g. tg:12345
        jid: String,
        #[arg(long)]
        folder: String,
        /// Display name (defaults to the folder)
        #[arg(long)]
        name: Option<String>,
        /// Trigger phrase (defaults to @<ASSISTANT_NAME>)
        #[arg(long)]
        trigger: Option<String>,
        /// Privileged conversation (only for MAIN_GROUP_FOLDER)
        #[arg(long)]
        main: bool,
        /// Respond to every message, not only triggered ones
        #[arg(long)]
        no_trigger: bool,
        /// Allowed sender id (repeatable)
        #[arg(long = "allow")]
        allowed_senders: Vec<String>,
        /// Extra mount: HOST_PATH[:NAME][:rw] (repeatable)
        #[arg(long = "mount", value_parser = parse_mount)]
        mounts: Vec<AdditionalMount>,
        /// Container timeout override in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Read one envelope from stdin and drop it into a mailbox
    Emit {
        /// Mailbox root containing messages/ and tasks/
        #[arg(long)]
        mailbox: PathBuf,
    },
    /// List scheduled tasks
    Tasks {
        #[arg(long)]
        folder: Option<String>,
    },
    /// Show the run history of a task
    Runs { task_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { console } => serve(console).await?,
        Commands::Register {
            jid,
            folder,
            name,
            trigger,
            main,
            no_trigger,
            allowed_senders,
            mounts,
            timeout,
        } => {
            let container_config = (!mounts.is_empty() || timeout.is_some()).then(|| {
                ContainerConfig {
                    additional_mounts: mounts,
                    timeout,
                }
            });
            let group = RegisteredGroup {
                jid,
                name: name.unwrap_or_else(|| folder.clone()),
                folder,
                trigger: trigger.unwrap_or_default(),
                allowed_senders: (!allowed_senders.is_empty()).then_some(allowed_senders),
                container_config,
                requires_trigger: !no_trigger,
                is_main: main,
                added_at: Utc::now(),
            };
            register(group).await?;
        }
        Commands::Emit { mailbox } => emit(mailbox).await?,
        Commands::Tasks { folder } => list_tasks(folder).await?,
        Commands::Runs { task_id } => list_runs(&task_id).await?,
    }
    Ok(())
}

fn load_config() -> anyhow::Result<Config> {
    let config = Config::load().context("Failed to load configuration")?;
    init_logging(&config.log_level, config.log_file.as_deref(), config.log_json);
    Ok(config)
}

async fn open_database(config: &Config) -> anyhow::Result<Arc<Database>> {
    config
        .create_directories()
        .context("Failed to create data directories")?;
    let db = Database::new(&config.db_path)
        .await
        .context("Failed to connect to database")?;
    db.initialize()
        .await
        .context("Failed to initialize database schema")?;
    Ok(Arc::new(db))
}

async fn serve(console: Option<String>) -> anyhow::Result<()> {
    let config = load_config()?;
    info!(
        project = %config.project_name,
        runtime = %config.container_runtime,
        image = %config.container_image,
        "Configuration loaded"
    );
    let db = open_database(&config).await?;

    let mut channels: Vec<Box<dyn ChannelSender>> = Vec::new();
    if let Some(folder) = &console {
        channels.push(Box::new(ConsoleChannel::new(folder)));
    }

    let orchestrator = Arc::new(Orchestrator::new(config.clone(), db.clone(), channels));
    if let Some(folder) = &console {
        orchestrator
            .register_group(RegisteredGroup {
                jid: console_jid(folder),
                name: "Console".to_string(),
                folder: folder.clone(),
                trigger: config.default_trigger(),
                allowed_senders: None,
                container_config: None,
                requires_trigger: false,
                is_main: *folder == config.main_group_folder,
                added_at: Utc::now(),
            })
            .await
            .context("Failed to register console conversation")?;
    }

    orchestrator
        .start()
        .await
        .context("Failed to start orchestrator")?;

    let shutdown = GracefulShutdown::new();
    let console_task = console.map(|folder| {
        let orch = orchestrator.clone();
        tokio::spawn(console::read_stdin(orch, folder, shutdown.subscribe()))
    });

    info!("AgentRelay is running. Press Ctrl+C to stop.");
    shutdown.wait_for_signal().await;

    info!("Shutting down...");
    if let Err(e) = orchestrator.stop().await {
        error!(error = %e, "Orchestrator stop failed");
    }
    if let Some(task) = console_task {
        if let Err(e) = task.await {
            error!(error = %e, "Console task failed");
        }
    }

    db.close().await;
    info!("AgentRelay stopped.");
    Ok(())
}

async fn register(group: RegisteredGroup) -> anyhow::Result<()> {
    let config = load_config()?;
    let db = open_database(&config).await?;

    let orchestrator = Orchestrator::new(config, db.clone(), Vec::new());
    orchestrator
        .registry()
        .load()
        .await
        .context("Failed to load registered groups")?;
    let group = orchestrator
        .register_group(group)
        .await
        .context("Failed to register group")?;

    println!(
        "Registered {} -> {} (trigger {}, main: {})",
        group.jid, group.folder, group.trigger, group.is_main
    );
    db.close().await;
    Ok(())
}

/// Agent-side helper: no configuration or database is needed.
async fn emit(mailbox: PathBuf) -> anyhow::Result<()> {
    init_logging("warn", None, false);

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read envelope from stdin")?;
    let envelope: IpcEnvelope =
        serde_json::from_str(&input).context("Invalid envelope JSON")?;

    let path = write_envelope(&mailbox, &envelope)
        .await
        .context("Failed to write envelope")?;
    println!("{}", path.display());
    Ok(())
}

async fn list_tasks(folder: Option<String>) -> anyhow::Result<()> {
    let config = load_config()?;
    let db = open_database(&config).await?;
    let repo = TaskRepository::new(&db);
    let tasks = match folder.as_deref() {
        Some(folder) => repo.get_by_folder(folder).await?,
        None => repo.get_all().await?,
    };

    if tasks.is_empty() {
        println!("No tasks.");
    }
    for task in tasks {
        println!(
            "{}  {:<10} {:<9} {:<8} {:<16} next={} last={}",
            task.id,
            task.group_folder,
            task.status.as_str(),
            task.schedule_type.as_str(),
            task.schedule_value,
            task.next_run
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            task.last_result.as_deref().unwrap_or("-"),
        );
    }
    db.close().await;
    Ok(())
}

async fn list_runs(task_id: &str) -> anyhow::Result<()> {
    let config = load_config()?;
    let db = open_database(&config).await?;

    if TaskRepository::new(&db).get_task(task_id).await?.is_none() {
        db.close().await;
        bail!("Task not found: {task_id}");
    }
    let runs = TaskRunRepository::new(&db).list_for_task(task_id).await?;
    if runs.is_empty() {
        println!("No runs recorded for {task_id}.");
    }
    for run in runs {
        let outcome = match run.status {
            relay_types::RunStatus::Success => run.result.unwrap_or_default(),
            relay_types::RunStatus::Error => run.error.unwrap_or_default(),
        };
        println!(
            "{}  {:<7} {:>7}ms  {}",
            run.run_at.to_rfc3339(),
            run.status.as_str(),
            run.duration_ms,
            outcome.lines().next().unwrap_or("")
        );
    }
    db.close().await;
    Ok(())
}

/// Parse `HOST_PATH[:NAME][:rw]` into an extra mount.
fn parse_mount(value: &str) -> Result<AdditionalMount, String> {
    let mut parts: Vec<&str> = value.split(':').collect();
    let read_write = parts.len() > 1 && parts.last() == Some(&"rw");
    if read_write {
        parts.pop();
    }

    match parts.as_slice() {
        [host] if !host.is_empty() => Ok(AdditionalMount {
            host_path: host.to_string(),
            container_path: None,
            read_write,
        }),
        [host, name] if !host.is_empty() && !name.is_empty() => Ok(AdditionalMount {
            host_path: host.to_string(),
            container_path: Some(name.to_string()),
            read_write,
        }),
        _ => Err(format!("expected HOST_PATH[:NAME][:rw], got '{value}'")),
    }
}
