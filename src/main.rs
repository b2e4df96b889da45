//! # Larkbot: chat-bot automation runner
//!
//! Usage:
//!   larkbot run                          # Start scheduler + triggers until Ctrl-C
//!   larkbot check                        # Validate config, list rules and jobs
//!   larkbot trigger morning-report       # Run one rule now and print the result
//!   larkbot templates --tag alert        # List workflow templates
//!   larkbot history --job trigger:x      # Show recorded job executions

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use larkbot_core::LarkbotConfig;
use larkbot_scheduler::AutomationEngine;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "larkbot",
    version,
    about = "🤖 Larkbot — triggers, workflows and scheduled tasks for chat bots"
)]
struct Cli {
    /// Config file (default: ~/.larkbot/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler and all triggers; stop on Ctrl-C
    Run,
    /// Validate the configuration and list rules, tasks and jobs
    Check,
    /// Run one automation rule now, whatever its trigger
    Trigger {
        rule: String,
        /// JSON payload passed as the trigger payload
        #[arg(long)]
        payload: Option<String>,
    },
    /// List workflow templates
    Templates {
        /// Only templates carrying one of these tags
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Show recorded job executions, newest first
    History {
        #[arg(long)]
        job: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<LarkbotConfig> {
    let config = match path {
        Some(p) => LarkbotConfig::load_from(p).with_context(|| format!("loading {}", p.display()))?,
        None => LarkbotConfig::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "larkbot=debug,larkbot_core=debug,larkbot_scheduler=debug"
    } else {
        "larkbot=info,larkbot_core=info,larkbot_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Run => run(&config).await,
        Command::Check => check(&config),
        Command::Trigger { rule, payload } => trigger(&config, &rule, payload.as_deref()).await,
        Command::Templates { tags } => {
            templates(&config, &tags);
            Ok(())
        }
        Command::History { job, limit } => history(&config, job.as_deref(), limit),
    }
}

async fn run(config: &LarkbotConfig) -> Result<()> {
    let engine = AutomationEngine::from_config(config)?;
    for problem in engine.problems() {
        println!("⚠️  {problem}");
    }
    engine.start()?;
    println!("🤖 Larkbot running with {} rules — Ctrl-C to stop", engine.rules().len());

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    println!();
    engine.shutdown();
    Ok(())
}

fn check(config: &LarkbotConfig) -> Result<()> {
    let engine = AutomationEngine::from_config(config)?;

    println!("📋 Tasks ({}):", engine.tasks().len());
    for task in engine.tasks() {
        println!(
            "   {} — {} actions{}",
            task.name,
            task.actions.len(),
            if task.enabled { "" } else { " (disabled)" }
        );
    }

    println!("🤖 Rules ({}):", engine.rules().len());
    for rule in engine.rules() {
        let trigger = engine
            .triggers()
            .get_trigger(&rule.name)
            .map(|t| t.trigger_type())
            .unwrap_or("?");
        let target = match (&rule.task, &rule.workflow) {
            (Some(task), _) => format!("task '{task}'"),
            (_, Some(workflow)) => format!("workflow '{workflow}'"),
            _ => "nothing".into(),
        };
        println!("   {} [{}] → {}", rule.name, trigger, target);
    }

    if let Some(scheduler) = engine.scheduler() {
        let jobs = scheduler.get_jobs();
        println!("⏰ Jobs ({}):", jobs.len());
        for job in jobs {
            println!(
                "   {} ({}){}",
                job.id,
                job.trigger.trigger_type(),
                if job.paused { " — paused" } else { "" }
            );
        }
    } else {
        println!("⏸️  Scheduler disabled");
    }

    let problems = engine.problems();
    if problems.is_empty() {
        println!("✅ Configuration OK");
        Ok(())
    } else {
        for problem in &problems {
            println!("❌ {problem}");
        }
        bail!("{} config entries rejected", problems.len())
    }
}

async fn trigger(config: &LarkbotConfig, rule: &str, payload: Option<&str>) -> Result<()> {
    let payload: Option<serde_json::Value> = payload
        .map(serde_json::from_str)
        .transpose()
        .context("--payload is not valid JSON")?;
    let engine = AutomationEngine::from_config(config)?;
    let outcome = engine.run_rule(rule, payload).await?;

    println!("{}", outcome.summary());
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.success() {
        bail!("rule '{}' failed: {}", rule, outcome.error().unwrap_or("see step results"));
    }
    Ok(())
}

fn templates(config: &LarkbotConfig, tags: &[String]) {
    let engine = match AutomationEngine::from_config(config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::warn!("⚠️ Falling back to built-in templates: {e}");
            AutomationEngine::new(None, Default::default())
        }
    };
    let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
    let filter = (!tags.is_empty()).then_some(tags.as_slice());

    for t in engine.templates().list_templates(filter) {
        let tag_list: Vec<&str> = t.tags.iter().map(String::as_str).collect();
        let params: Vec<String> = t.parameters().into_iter().collect();
        println!("🧩 {} [{}]", t.name, tag_list.join(", "));
        println!("   {}", t.description);
        println!(
            "   steps: {}",
            t.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
        );
        if !params.is_empty() {
            println!("   params: {}", params.join(", "));
        }
    }
}

fn history(config: &LarkbotConfig, job: Option<&str>, limit: usize) -> Result<()> {
    let engine = AutomationEngine::from_config(config)?;
    let Some(scheduler) = engine.scheduler() else {
        println!("⏸️  Scheduler disabled — no history");
        return Ok(());
    };
    let records = scheduler.get_execution_history(job, limit)?;
    if records.is_empty() {
        println!("📭 No executions recorded");
        return Ok(());
    }
    for r in records {
        println!(
            "{} {} {} ({}ms){}",
            if r.success { "✅" } else { "❌" },
            r.executed_at.format("%Y-%m-%d %H:%M:%S"),
            r.job_id,
            r.duration_ms,
            r.error.map(|e| format!(" — {e}")).unwrap_or_default()
        );
    }
    if let Some(job) = job
        && let Some(status) = scheduler.get_task_status(job)?
    {
        println!(
            "📊 {}: {} runs, {} ok, {} failed, avg {:.0}ms",
            status.job_id, status.total_runs, status.successes, status.failures, status.avg_duration_ms
        );
    }
    Ok(())
}
