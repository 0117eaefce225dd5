//! hive 命令行入口
//!
//! - `run`：调度守护进程
//! - `goal`：对一个目标跑一次 ReAct
//! - `agent`：agent 执行单元（调度器启动的子进程）
//! - `approvals` / `locks` / `stats`：运维命令

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use hive::approval::ApprovalStatus;
use hive::config::{load_config, AppConfig};
use hive::core::{Hive, HiveBuilder, ShutdownManager, ShutdownReason};
use hive::react::OperatorStatus;
use hive::scheduler::spec::load_config_file;
use hive::scheduler::state::{RunningRegistry, StateStore};
use hive::scheduler::ConfigWatcher;
use hive::skills::{DecideOutcome, TrustLevel};

#[derive(Parser, Debug)]
#[command(name = "hive", version, about = "Autonomous agent scheduler and reasoning operator")]
struct Cli {
    /// Extra config file layered over config/default.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler daemon until Ctrl+C / SIGTERM
    Run,

    /// Run one goal through the ReAct operator and print the outcome as JSON
    Goal {
        /// Goal text
        text: String,

        /// Trust level used for skill calls (defaults to skills.trust_level)
        #[arg(long)]
        trust: Option<TrustLevel>,
    },

    /// Execute one scheduled agent (spawned by the scheduler)
    Agent {
        /// Agent id from the agents file
        id: String,
    },

    /// Inspect and decide queued skill calls
    Approvals {
        #[command(subcommand)]
        command: ApprovalsCommand,
    },

    /// Inspect and clean agent lock files
    Locks {
        #[command(subcommand)]
        command: LocksCommand,
    },

    /// Print persisted run stats and currently running agents
    Stats,
}

#[derive(Subcommand, Debug)]
enum ApprovalsCommand {
    /// List queue items (pending by default)
    List {
        /// pending|approved|rejected|expired|all
        #[arg(long, default_value = "pending")]
        status: String,
    },
    /// Approve an item and execute the original call
    Approve {
        id: String,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Reject an item
    Reject {
        id: String,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Expire pending items older than skills.approval_ttl_secs
    Expire,
}

#[derive(Subcommand, Debug)]
enum LocksCommand {
    /// Remove stale and corrupt lock files
    Sweep,
    /// Show lock records with liveness
    Show,
}

fn cli_actor(actor: Option<String>) -> String {
    actor
        .or_else(|| std::env::var("USER").ok())
        .map(|a| format!("cli:{}", a))
        .unwrap_or_else(|| "cli".to_string())
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// 状态目录与工作区在装配前必须存在
fn prepare_dirs(config: &AppConfig) -> anyhow::Result<()> {
    for dir in [&config.app.state_dir, &config.skills.workspace_root] {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();
    let cli = Cli::parse();
    let config = load_config(cli.config).context("Failed to load config")?;
    prepare_dirs(&config)?;

    let hive = HiveBuilder::new(config).build().context("Failed to build hive")?;

    match cli.command {
        Command::Run => run_daemon(&hive).await,
        Command::Goal { text, trust } => {
            let code = run_goal(&hive, &text, trust, "cli").await?;
            std::process::exit(code);
        }
        Command::Agent { id } => {
            let code = run_agent(&hive, &id).await?;
            std::process::exit(code);
        }
        Command::Approvals { command } => approvals(&hive, command).await,
        Command::Locks { command } => locks(&hive, command),
        Command::Stats => stats(&hive),
    }
}

async fn run_daemon(hive: &Hive) -> anyhow::Result<()> {
    let manager = Arc::new(ShutdownManager::new());
    manager.install_signal_handlers();

    let scheduler = hive.scheduler();
    match scheduler.reload_from_disk() {
        Ok(report) => tracing::info!(added = report.added.len(), "Loaded agents"),
        Err(e) => tracing::error!(error = %e, "Agents file could not be loaded; starting with no agents"),
    }
    scheduler.start();

    let section = &hive.config.scheduler;
    let (reload_rx, watcher) = ConfigWatcher::new(
        section.agents_file.clone(),
        section.reload_poll_ms,
        section.reload_debounce_ms,
    )
    .spawn(manager.token());

    scheduler.run(manager.token(), Some(reload_rx)).await;
    manager.shutdown(ShutdownReason::Finished);
    let _ = watcher.await;

    hive.shutdown_coordinator(manager, scheduler).run_cleanup().await;
    Ok(())
}

async fn run_goal(hive: &Hive, goal: &str, trust: Option<TrustLevel>, actor: &str) -> anyhow::Result<i32> {
    let manager = Arc::new(ShutdownManager::new());
    manager.install_signal_handlers();

    let operator = hive.operator_with_trust(actor, trust.unwrap_or(hive.config.skills.trust_level));
    let outcome = operator.run(goal, &manager.token()).await;
    print_json(&outcome)?;
    Ok(match outcome.status {
        OperatorStatus::Complete => 0,
        OperatorStatus::Partial => 2,
        OperatorStatus::Failed => 1,
    })
}

async fn run_agent(hive: &Hive, id: &str) -> anyhow::Result<i32> {
    let parsed = load_config_file(&hive.config.scheduler.agents_file)?;
    let Some(spec) = parsed.config.agents.get(id) else {
        bail!("agent '{}' is not defined in {}", id, hive.config.scheduler.agents_file.display());
    };
    let Some(goal) = spec.goal.clone().or_else(|| spec.comment.clone()) else {
        bail!("agent '{}' has no goal to run", id);
    };
    tracing::info!(agent = %id, "Agent run started");
    run_goal(hive, &goal, None, &format!("agent:{}", id)).await
}

async fn approvals(hive: &Hive, command: ApprovalsCommand) -> anyhow::Result<()> {
    match command {
        ApprovalsCommand::List { status } => {
            let filter = match status.as_str() {
                "all" => None,
                other => Some(
                    ApprovalStatus::parse(other).with_context(|| format!("unknown status '{}'", other))?,
                ),
            };
            print_json(&hive.approvals.list(filter)?)
        }
        ApprovalsCommand::Approve { id, actor } => {
            match hive.executor.decide(&id, true, &cli_actor(actor)).await? {
                DecideOutcome::Executed { item, result } => {
                    print_json(&item)?;
                    if let Err(e) = result {
                        bail!("approved, but execution failed: {}", e);
                    }
                }
                DecideOutcome::Rejected(item) => print_json(&item)?,
            }
            Ok(())
        }
        ApprovalsCommand::Reject { id, actor } => {
            match hive.executor.decide(&id, false, &cli_actor(actor)).await? {
                DecideOutcome::Rejected(item) | DecideOutcome::Executed { item, .. } => print_json(&item),
            }
        }
        ApprovalsCommand::Expire => {
            let ttl = std::time::Duration::from_secs(hive.config.skills.approval_ttl_secs);
            print_json(&hive.executor.expire_stale(ttl, chrono::Utc::now())?)
        }
    }
}

fn locks(hive: &Hive, command: LocksCommand) -> anyhow::Result<()> {
    match command {
        LocksCommand::Sweep => {
            let report = hive.locks.sweep()?;
            println!(
                "removed {} stale and {} corrupt lock(s)",
                report.stale.len(),
                report.corrupt.len()
            );
            for record in &report.stale {
                println!("  stale  {} (pid {})", record.agent_id, record.pid);
            }
            for path in &report.corrupt {
                println!("  corrupt {}", path.display());
            }
            Ok(())
        }
        LocksCommand::Show => print_json(&hive.locks.list()?),
    }
}

fn stats(hive: &Hive) -> anyhow::Result<()> {
    let dir = &hive.config.app.state_dir;
    let state = StateStore::new(dir.join("scheduler-state.json")).load();
    let running = RunningRegistry::new(dir.join("running.json")).read();
    print_json(&serde_json::json!({
        "savedAt": state.saved_at,
        "agents": state.agents,
        "running": running,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_dirs_creates_both() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.app.state_dir = dir.path().join("run/state");
        config.skills.workspace_root = dir.path().join("ws");
        prepare_dirs(&config).unwrap();
        assert!(config.app.state_dir.is_dir());
        assert!(config.skills.workspace_root.is_dir());
    }

    #[test]
    fn test_prepare_dirs_reports_unwritable_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let mut config = AppConfig::default();
        config.app.state_dir = blocker.join("run");
        config.skills.workspace_root = dir.path().join("ws");

        let err = prepare_dirs(&config).unwrap_err();
        assert!(err.to_string().contains("Failed to create"));
        assert!(!config.skills.workspace_root.exists());
    }
}
