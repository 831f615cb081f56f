//! Command implementations behind `spiced <subcommand>`

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::output::{print_item, print_items, print_kv, EpisodeRow, OutputMode, RunRow};
use crate::api;
use crate::config::DaemonConfig;
use crate::coordination::{install_signal_handlers, GracefulShutdown};
use crate::daemon::{Daemon, DataRow, RunView};
use crate::persistence::{Run, RunStatus};
use crate::training::StartOptions;

/// Run the control API until a termination signal arrives
pub async fn serve(config: DaemonConfig, bind: Option<String>, boot_pods: Vec<String>) -> Result<()> {
    let bind = bind.unwrap_or_else(|| config.api.bind.clone());
    let daemon = Arc::new(Daemon::new(config));

    let shutdown = Arc::new(GracefulShutdown::new());
    install_signal_handlers(shutdown.clone())?;

    for pod in &boot_pods {
        match daemon.train_pod(pod, StartOptions::default()).await {
            Ok(run) => info!(run_id = %run.id, pod = %pod, "Boot training started"),
            Err(e) => error!(pod = %pod, "Boot training failed to start: {}", e),
        }
    }

    let mut token = shutdown.token();
    let server = tokio::spawn(api::serve(daemon.clone(), bind, shutdown.token()));

    let signal = token.wait_for_shutdown().await;
    info!("Shutdown requested ({}), draining runs", signal);
    daemon.shutdown(signal).await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("API server stopped with error: {}", e),
        Err(e) => error!("API server task failed: {}", e),
    }
    info!("Daemon stopped");
    Ok(())
}

/// Train one pod in the foreground; a signal stops it at the next episode boundary
pub async fn train(config: DaemonConfig, pod: &str, resume_paused: bool) -> Result<()> {
    let daemon = Arc::new(Daemon::new(config));
    let started = daemon
        .train_pod(
            pod,
            StartOptions {
                resume_paused,
                ..Default::default()
            },
        )
        .await?;
    println!("Training {} as run {} from {}", pod, started.id, started.progress);

    let shutdown = Arc::new(GracefulShutdown::new());
    install_signal_handlers(shutdown.clone())?;
    let mut token = shutdown.token();
    let stopper = {
        let daemon = daemon.clone();
        let pod = pod.to_string();
        tokio::spawn(async move {
            let signal = token.wait_for_shutdown().await;
            match daemon.signal_run(&pod, signal) {
                Ok(run_id) => warn!(run_id = %run_id, "Stopping at next episode boundary ({})", signal),
                Err(e) => warn!("{}", e),
            }
        })
    };

    let finished = daemon.wait(pod).await;
    stopper.abort();

    let run = match finished {
        Some(result) => result?,
        None => anyhow::bail!("run for pod {} was not started", pod),
    };
    let failed = matches!(run.status, RunStatus::Failed | RunStatus::Paused);
    let status = run.status;
    print_summary(&run_view(run));
    if failed {
        anyhow::bail!("run ended {}", status);
    }
    Ok(())
}

fn run_view(run: Run) -> RunView {
    RunView {
        total_reward: run.total_reward(),
        active: false,
        run,
    }
}

pub fn validate(config: DaemonConfig, pod: &str) -> Result<()> {
    let daemon = Daemon::new(config);
    let pod = daemon.validate_pod(pod)?;
    println!(
        "Pod {} is valid ({}, {} actions, {} epochs of {} steps)",
        pod.name,
        pod.algorithm,
        pod.actions.len(),
        pod.epochs,
        pod.episode_length
    );
    Ok(())
}

pub async fn runs(config: DaemonConfig, json: bool) -> Result<()> {
    let daemon = Daemon::new(config);
    let views = daemon.list_runs().await?;
    match OutputMode::from_json_flag(json) {
        OutputMode::Json => print_item(&views),
        OutputMode::Table => {
            let rows: Vec<RunRow> = views.iter().map(RunRow::from).collect();
            print_items(&rows, OutputMode::Table)
        }
    }
}

pub async fn status(config: DaemonConfig, run_id: &str, json: bool) -> Result<()> {
    let daemon = Daemon::new(config);
    let view = daemon.run_status(run_id).await?;
    if json {
        return print_item(&view);
    }
    print_summary(&view);
    let rows: Vec<EpisodeRow> = view.run.episodes.iter().map(EpisodeRow::from).collect();
    print_items(&rows, OutputMode::Table)
}

pub async fn export(config: DaemonConfig, pod: &str, dest: &Path) -> Result<()> {
    let daemon = Daemon::new(config);
    let path = daemon.export_model(pod, dest).await?;
    println!("Exported {} to {}", pod, path.display());
    Ok(())
}

pub async fn import(config: DaemonConfig, pod: &str, source: &Path) -> Result<()> {
    let daemon = Daemon::new(config);
    let run = daemon.import_model(pod, source).await?;
    println!("Imported model for {} as run {}", pod, run.id);
    Ok(())
}

pub async fn infer(config: DaemonConfig, pod: &str, json: bool) -> Result<()> {
    let daemon = Daemon::new(config);
    let inference = daemon.infer(pod).await?;
    if json {
        return print_item(&inference);
    }
    print_kv("pod", &inference.pod);
    print_kv("action", &inference.action);
    print_kv("time", &inference.time.to_string());
    print_kv("run", &inference.run_id);
    print_kv(
        "checkpoint",
        &format!("{} ({})", inference.checkpoint, inference.coordinates),
    );
    Ok(())
}

pub async fn add_data(config: DaemonConfig, pod: &str, file: &Path) -> Result<()> {
    let text = tokio::fs::read_to_string(file).await?;
    let rows = parse_rows(&text)?;
    let daemon = Daemon::new(config);
    let added = daemon.add_data(pod, rows).await?;
    println!(
        "Added {} record(s) to {} ({} total)",
        added.appended, added.source, added.records
    );
    Ok(())
}

/// One JSON object per non-empty line
fn parse_rows(text: &str) -> Result<Vec<DataRow>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| anyhow::anyhow!("line {}: {}", i + 1, e))
        })
        .collect()
}

fn print_summary(view: &RunView) {
    let run = &view.run;
    print_kv("run", &run.id);
    print_kv("pod", &run.pod_name);
    print_kv("algorithm", &run.algorithm);
    print_kv("status", &run.status.to_string());
    print_kv("next", &run.progress.to_string());
    print_kv("episodes", &run.episodes.len().to_string());
    print_kv("reward", &format!("{:.4}", view.total_reward));
    if let Some(checkpoint) = &run.checkpoint {
        print_kv("checkpoint", &format!("{} ({})", checkpoint.id, checkpoint.coordinates));
    }
    if let Some(failure) = &run.failure {
        print_kv("failure", &format!("{} [{}]: {}", failure.code, failure.class, failure.message));
    }
}
