use std::{
    io::{self, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;
use shared_logging::{init_tracing, TracingFormat};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use xmrt_autonomy::{AutonomyRuntime, CoordinatorConfig, FeedsConfig};

const DEFAULT_HISTORY: usize = 10;

/// XMRT autonomous coordinator console.
#[derive(Debug, Parser)]
#[command(name = "xmrt-coordinator", version, about)]
struct Cli {
    /// Coordinator TOML document. Without it, simulated feeds and an
    /// in-memory store are used.
    #[arg(long, env = "XMRT_COORDINATOR_CONFIG")]
    config: Option<PathBuf>,
    /// Default tracing filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_filter: String,
    /// Emit tracing output as JSON.
    #[arg(long)]
    log_json: bool,
    /// Register components without starting their loops.
    #[arg(long)]
    no_autostart: bool,
}

struct Console {
    runtime: AutonomyRuntime,
}

impl Console {
    async fn run(&self) -> Result<()> {
        Self::print_help();
        let mut reader = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("coordinator> ");
            io::stdout().flush()?;
            let line = tokio::select! {
                line = reader.next_line() => line?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let command = parts.next().unwrap_or_default();
            let args: Vec<&str> = parts.collect();
            match command {
                "status" => self.print_status(),
                "leaderboard" => self.print_leaderboard().await,
                "allocation" => self.print_allocation().await,
                "history" => self.print_history(&args).await,
                "start" => self.handle_start(&args),
                "stop" => self.handle_stop(&args).await,
                "events" => self.print_events(&args)?,
                "help" => Self::print_help(),
                "exit" | "quit" => break,
                other => println!("Unknown command: {other}. Type 'help' for usage."),
            }
        }
        Ok(())
    }

    fn print_status(&self) {
        println!("Components:");
        for status in self.runtime.status() {
            println!(
                "  {:<20} {:<10} running={:<5} last_cycle={} outcome={}{}",
                status.id,
                status.lifecycle,
                status.running,
                status
                    .last_cycle_id
                    .map_or_else(|| "-".to_string(), |id| id.to_string()),
                status
                    .last_outcome
                    .map_or_else(|| "-".to_string(), |o| o.to_string()),
                status
                    .last_error
                    .map(|e| format!(" error={e}"))
                    .unwrap_or_default(),
            );
        }
    }

    async fn print_leaderboard(&self) {
        let Some(report) = self.runtime.leaderboard().await else {
            println!("No leaderboard yet.");
            return;
        };
        println!(
            "Leaderboard at {} ({} participants, mesh {}, health {}):",
            report.generated_at.to_rfc3339(),
            report.entries.len(),
            if report.mesh_available { "up" } else { "down" },
            report.summary.health,
        );
        for entry in &report.entries {
            println!(
                "  #{:<3} {:<16} {:>10.2} H/s  x{:.2}  signal {:>3}  earned {:.8}",
                entry.rank,
                entry.identity,
                entry.hash_rate,
                entry.efficiency_bonus,
                entry.connectivity_score,
                entry.earned_amount,
            );
        }
        for skipped in &report.degraded {
            println!("  skipped {}: {}", skipped.identity, skipped.reason);
        }
    }

    async fn print_allocation(&self) {
        match self.runtime.allocation().await {
            Some(result) => {
                let shown = result.rounded(8);
                println!(
                    "Allocation of {:.8}: treasury {:.8} ({:.0}%), operations {:.8}",
                    shown.total,
                    shown.treasury_share,
                    result.treasury_ratio * 100.0,
                    shown.operations_share,
                );
            }
            None => println!("No allocation yet."),
        }
    }

    async fn print_history(&self, args: &[&str]) {
        let Some(id) = args.first() else {
            println!("Usage: history <component> [count]");
            return;
        };
        let limit = args
            .get(1)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_HISTORY);
        match self.runtime.history(id, limit).await {
            Ok(records) if records.is_empty() => println!("No cycles recorded for {id}."),
            Ok(records) => {
                for record in records {
                    let actions: Vec<String> = record
                        .actions_taken
                        .iter()
                        .map(|a| format!("{}{}", a.kind, if a.applied { "" } else { "(failed)" }))
                        .collect();
                    println!(
                        "  cycle {:>5} {} {:<15} [{}] {}",
                        record.cycle_id,
                        record.ended_at.format("%H:%M:%S"),
                        record.outcome,
                        actions.join(", "),
                        record.notes.join("; "),
                    );
                }
            }
            Err(err) => println!("{err}"),
        }
    }

    fn handle_start(&self, args: &[&str]) {
        match args.first() {
            Some(id) => match self.runtime.start(id) {
                Ok(()) => println!("Started {id}."),
                Err(err) => println!("{err}"),
            },
            None => println!("Usage: start <component>"),
        }
    }

    async fn handle_stop(&self, args: &[&str]) {
        match args.first() {
            Some(id) => match self.runtime.stop(id).await {
                Ok(()) => println!("Stopped {id}."),
                Err(err) => println!("{err}"),
            },
            None => println!("Usage: stop <component>"),
        }
    }

    fn print_events(&self, args: &[&str]) -> Result<()> {
        let count = args
            .first()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_HISTORY);
        let events = self.runtime.events().snapshot();
        let recent = &events[events.len().saturating_sub(count)..];
        if recent.is_empty() {
            println!("No events yet.");
        }
        for event in recent {
            println!("{}", serde_json::to_string_pretty(event)?);
        }
        Ok(())
    }

    fn print_help() {
        println!(
            "Commands:
  status                  - Component lifecycle and last cycle outcome
  leaderboard             - Latest fused leaderboard
  allocation              - Latest treasury allocation
  history <id> [count]    - Recent cycles of a component
  start <id>              - Start a component loop
  stop <id>               - Stop a component after its current cycle
  events [count]          - Most recent events on the bus, as JSON
  help                    - Show this message
  exit                    - Stop every component and quit"
        );
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<CoordinatorConfig> {
    match path {
        Some(path) => CoordinatorConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => {
            info!("no configuration given; using simulated feeds and an in-memory store");
            Ok(CoordinatorConfig {
                feeds: FeedsConfig::simulated(),
                ..CoordinatorConfig::default()
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = if cli.log_json {
        TracingFormat::Json
    } else {
        TracingFormat::Compact
    };
    init_tracing(&cli.log_filter, format)?;

    let config = load_config(cli.config.as_ref())?;
    let runtime = AutonomyRuntime::builder(config)
        .build()
        .await
        .context("failed to bootstrap coordinator")?;
    if !cli.no_autostart {
        let started = runtime.start_all()?;
        info!(?started, "components started");
    }

    let console = Console { runtime };
    let outcome = console.run().await;
    console.runtime.shutdown().await;
    outcome
}
