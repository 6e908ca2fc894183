//! `errand` - demo driver for the background task scheduler.
//!
//! Usage:
//!   errand [-c <config.toml>] [--max-concurrent N] [--owner NAME] [COMMAND...]
//!
//! Every task type gets a simulated handler that reports progress in steps
//! and occasionally fails transiently. Submitted commands run to a terminal
//! status, then the final task records are printed as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use errand_core::app::{CommandRequest, ListQuery};
use errand_core::domain::{MAX_PER_PAGE, StatusCounts};
use errand_core::impls::InMemoryTaskStore;
use errand_core::{
    HandlerError, SchedulerBuilder, SchedulerConfig, Task, TaskContext, TaskHandler, TaskService,
    TaskType, telemetry,
};
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

const DEFAULT_COMMANDS: &[&str] = &[
    "/organize ~/Downloads",
    "/search quarterly report",
    "/cleanup /tmp",
    "/folder:archive bulk create",
    "/backup ~/Documents",
    "/analyze ~/Projects",
    "/help",
];

/// Background task scheduler demo.
#[derive(Parser, Debug)]
#[command(name = "errand", about = "Run chat commands through the background task scheduler")]
struct Cli {
    /// Path to a TOML config file. Built-in defaults when omitted.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Overrides `max_concurrent_tasks` from the config.
    #[arg(long = "max-concurrent")]
    max_concurrent: Option<usize>,

    /// Owner the commands are submitted for.
    #[arg(long = "owner", default_value = "demo")]
    owner: String,

    /// Chance (0.0..=1.0) that a simulated step fails transiently.
    #[arg(long = "failure-rate", default_value_t = 0.1)]
    failure_rate: f64,

    /// Commands to submit. A built-in set covering every task type when empty.
    commands: Vec<String>,
}

/// Stand-in for a real handler: walks through a few steps, sleeping a random
/// while between them.
struct SimulatedHandler {
    task_type: TaskType,
    steps: u8,
    failure_rate: f64,
}

impl SimulatedHandler {
    fn new(task_type: TaskType, failure_rate: f64) -> Self {
        let steps = match task_type {
            TaskType::Search | TaskType::FolderOperation => 2,
            TaskType::Cleanup | TaskType::Organize => 4,
            TaskType::Backup | TaskType::Analysis => 5,
        };
        Self {
            task_type,
            steps,
            failure_rate,
        }
    }
}

#[async_trait]
impl TaskHandler for SimulatedHandler {
    async fn run(&self, task: Task, ctx: TaskContext) -> Result<serde_json::Value, HandlerError> {
        ctx.log(format!("{} handler picked up '{}'", self.task_type, task.command))
            .await?;

        for step in 1..=self.steps {
            if ctx.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }

            let (pause, fail) = {
                let mut rng = rand::thread_rng();
                (rng.gen_range(100..400u64), rng.gen_bool(self.failure_rate))
            };
            tokio::select! {
                _ = ctx.cancelled() => return Err(HandlerError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(pause)) => {}
            }
            if fail {
                return Err(HandlerError::transient(format!(
                    "simulated glitch at step {step}/{}",
                    self.steps
                )));
            }

            let percent = (u32::from(step) * 100 / u32::from(self.steps)) as u8;
            ctx.progress(percent.min(99)).await?;
            ctx.log(format!("step {step}/{} done", self.steps)).await?;
        }

        Ok(serde_json::json!({
            "type": self.task_type,
            "parameters": task.parameters,
            "steps": self.steps,
        }))
    }
}

#[derive(Debug, Serialize)]
struct Report {
    counts: StatusCounts,
    tasks: Vec<Task>,
}

fn load_config(cli: &Cli) -> anyhow::Result<SchedulerConfig> {
    let mut config = match &cli.config {
        Some(path) => SchedulerConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SchedulerConfig::default(),
    };
    if let Some(max) = cli.max_concurrent {
        config.max_concurrent_tasks = max;
    }
    config.validate()?;
    Ok(config)
}

async fn all_terminal(service: &TaskService, owner: &str) -> anyhow::Result<bool> {
    let page = service
        .list_tasks(owner, ListQuery { per_page: MAX_PER_PAGE, ..ListQuery::default() })
        .await?;
    Ok(page.items.iter().all(|t| t.status.is_terminal()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    anyhow::ensure!(
        (0.0..=1.0).contains(&cli.failure_rate),
        "--failure-rate must be within 0.0..=1.0"
    );

    let config = load_config(&cli)?;
    telemetry::init_tracing(&config.logging)?;

    let store = Arc::new(InMemoryTaskStore::default());
    let mut builder = SchedulerBuilder::new(store).config(config.clone());
    for task_type in TaskType::ALL {
        builder = builder.register(task_type, SimulatedHandler::new(task_type, cli.failure_rate))?;
    }
    let scheduler = builder.expect_types(&TaskType::ALL).build()?;
    let handle = scheduler.start().await?;
    let service = handle.service();

    let commands: Vec<String> = if cli.commands.is_empty() {
        DEFAULT_COMMANDS.iter().map(|c| c.to_string()).collect()
    } else {
        cli.commands.clone()
    };

    let mut submitted = 0usize;
    for command in &commands {
        match service
            .submit_command(CommandRequest::new(&cli.owner, command))
            .await
        {
            Ok(task) => {
                submitted += 1;
                info!(task_id = %task.id, task_type = %task.task_type, "submitted '{command}'");
            }
            Err(e) => warn!(error = %e, "skipped '{command}'"),
        }
    }

    if submitted > 0 {
        let poll = config.poll_interval().min(Duration::from_millis(200));
        let wait = async {
            loop {
                if all_terminal(&service, &cli.owner).await? {
                    return anyhow::Ok(());
                }
                tokio::time::sleep(poll).await;
            }
        };
        tokio::select! {
            res = wait => res?,
            _ = tokio::signal::ctrl_c() => warn!("interrupted, shutting down"),
        }
    }

    let page = service
        .list_tasks(&cli.owner, ListQuery { per_page: MAX_PER_PAGE, ..ListQuery::default() })
        .await?;
    let report = Report {
        counts: service.counts().await?,
        tasks: page.items,
    };

    handle.shutdown_and_join().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
