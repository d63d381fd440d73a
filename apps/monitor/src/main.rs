use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use client_core::{
    load_settings, ActionGateway, ClientSettings, PhaseNode, SyncSession, ViewModel,
};
use shared::domain::{ConditionId, ControlAction, PartId};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Follow and drive the phase progression server from a terminal")]
struct Cli {
    /// Settings file; `monitor.toml` in the working directory is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the configured server url.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stay connected and print every view update and notice until Ctrl-C.
    Watch,
    /// One auto-transition control call: start, stop, reset, activate, next or finish.
    Control { action: ControlAction },
    /// Add to a counter condition part and print the server's evaluation.
    Increment {
        condition_id: i64,
        part_id: i64,
        #[arg(long, default_value_t = 1)]
        amount: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => watch(&settings).await,
        Command::Control { action } => {
            let gateway = ActionGateway::new(settings.http_base()?);
            gateway
                .control_auto_transition(action)
                .await
                .with_context(|| format!("control action '{action}' failed"))?;
            println!("{action}: ok");
            Ok(())
        }
        Command::Increment {
            condition_id,
            part_id,
            amount,
        } => {
            let gateway = ActionGateway::new(settings.http_base()?);
            let evaluation = gateway
                .increment_counter(ConditionId(condition_id), PartId(part_id), amount)
                .await
                .context("counter increment failed")?;
            let target = evaluation
                .target_value
                .map(|target| format!(" target={target}"))
                .unwrap_or_default();
            println!(
                "condition={condition_id} part={part_id} current={}{target} satisfied={}",
                evaluation.current_value, evaluation.is_satisfied
            );
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn watch(settings: &ClientSettings) -> Result<()> {
    let session = SyncSession::start(settings).await?;
    info!(server_url = %settings.server_url, "monitor: watching");
    let mut view = session.subscribe_view();
    let mut notices = session.subscribe_status();
    let mut last_printed: Option<Arc<ViewModel>> = None;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                print_view(&current, last_printed.as_deref());
                last_printed = Some(current);
            }
            notice = notices.recv() => match notice {
                Ok(notice) => println!("{notice}"),
                Err(RecvError::Lagged(skipped)) => println!("[warning] {skipped} notices skipped"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => break,
        }
    }

    session.shutdown().await;
    info!("monitor: stopped");
    Ok(())
}

/// Countdown-only changes print a single line; anything else prints the
/// whole view.
fn print_view(view: &ViewModel, previous: Option<&ViewModel>) {
    let countdown_only = previous.is_some_and(|previous| {
        let mut previous = previous.clone();
        previous.countdown = view.countdown;
        previous == *view
    });
    if countdown_only {
        if let Some(countdown) = view.countdown {
            println!("  {countdown}");
        }
        return;
    }

    let state = view
        .current_state
        .as_ref()
        .map_or("unknown", |state| state.as_str());
    let phase = view
        .current_phase
        .as_ref()
        .map(|phase| phase.name.as_str())
        .or(view.phase_label.as_deref())
        .unwrap_or("-");
    let auto = if view.auto_transition_running { "on" } else { "off" };
    println!("state={state} phase={phase} auto-transition={auto}");

    let enabled: Vec<&str> = view.enabled_events().iter().map(|e| e.as_str()).collect();
    if !enabled.is_empty() {
        println!("  controls: {}", enabled.join(", "));
    }
    if let Some(context) = &view.phase_context {
        if let Some(parent) = &context.parent {
            println!("  parent: {}", parent.name);
        }
        for child in &context.children {
            let mark = if child.is_active { "*" } else { " " };
            println!("  {mark} child: {}", child.name);
        }
    }
    print_tree(&view.phase_hierarchy);
    for condition in &view.conditions {
        let clear = if condition.is_clear { "clear" } else { "pending" };
        println!("  condition {} [{clear}] {}", condition.id, condition.label);
        for part in &condition.parts {
            let value = part
                .current_value
                .map(|value| format!(" value={value}"))
                .unwrap_or_default();
            println!(
                "    part {} {} {} {}{value}",
                part.id,
                part.label,
                part.comparison_operator.symbol(),
                part.reference_value_int
            );
        }
    }
    if let Some(countdown) = view.countdown {
        println!("  {countdown}");
    }
}

fn print_tree(roots: &[PhaseNode]) {
    let mut pending: Vec<(&PhaseNode, usize)> = roots.iter().rev().map(|node| (node, 1)).collect();
    while let Some((node, depth)) = pending.pop() {
        let clear = if node.phase.is_clear { " (clear)" } else { "" };
        println!(
            "{:indent$}- {} #{}{clear}",
            "",
            node.phase.name,
            node.phase.id,
            indent = depth * 2
        );
        pending.extend(node.children.iter().rev().map(|child| (child, depth + 1)));
    }
}
