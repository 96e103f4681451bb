mod cli;
mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use vmgather_core::job_manager::JobManagerOptions;
use vmgather_core::model::{
    AuthVariant, BatchSettings, BatchStrategy, ExportConfig, ObfuscationConfig, TimeRange,
    VmConnection,
};
use vmgather_core::{JobManager, JobState, SystemClock, VmClient};

use crate::cli::Cli;
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController, ShutdownEvent};

fn auth_from_cli(cli: &Cli) -> AuthVariant {
    if let Some(token) = &cli.bearer_token {
        return AuthVariant::Bearer { token: token.clone() };
    }
    if let (Some(user), Some(pass)) = (&cli.basic_user, &cli.basic_pass) {
        return AuthVariant::Basic {
            user: user.clone(),
            pass: pass.clone(),
        };
    }
    AuthVariant::None
}

fn config_from_cli(cli: &Cli) -> anyhow::Result<ExportConfig> {
    let time_range = TimeRange::new(cli.start, cli.end)
        .map_err(|e| anyhow::anyhow!("invalid --start/--end range: {e}"))?;

    let obfuscation_enabled =
        cli.obfuscate_instance || cli.obfuscate_job || !cli.custom_labels.is_empty();

    let batch = if cli.no_batch {
        BatchSettings {
            enabled: false,
            strategy: BatchStrategy::Auto,
            custom_interval_seconds: 0,
        }
    } else if let Some(secs) = cli.batch_interval_seconds {
        BatchSettings {
            enabled: true,
            strategy: BatchStrategy::Custom,
            custom_interval_seconds: secs,
        }
    } else {
        BatchSettings::default()
    };

    Ok(ExportConfig {
        connection: VmConnection {
            base_url: cli.vm_url.clone(),
            api_base_path: cli.api_base_path.clone(),
            tenant_id: cli.tenant_id.clone(),
            multitenant: cli.multitenant,
            auth: auth_from_cli(cli),
            tls_skip_verify: cli.tls_skip_verify,
        },
        time_range,
        batch,
        obfuscation: ObfuscationConfig {
            enabled: obfuscation_enabled,
            obfuscate_instance: cli.obfuscate_instance,
            obfuscate_job: cli.obfuscate_job,
            preserve_structure: false,
            custom_labels: cli.custom_labels.clone(),
        },
        components: cli.components.clone(),
        jobs: cli.jobs.clone(),
        metric_step_seconds: cli.metric_step_seconds.max(30),
        staging_dir: cli.staging_dir.clone(),
        staging_file: None,
        resume_from_batch: 0,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = config_from_cli(&cli)?;

    let output_dir = std::path::PathBuf::from(&cli.output_dir);
    std::fs::create_dir_all(&output_dir)?;

    let http = reqwest::Client::new();
    let client = VmClient::new(http);
    let mut options = JobManagerOptions::new(output_dir);
    options.max_concurrent_jobs = cli.max_concurrent_jobs;

    let manager = JobManager::new(client, Arc::new(SystemClock), options);
    let record = manager.start(config)?;
    let job_id = record.id;
    println!("vmgather {} started job {}", env!("CARGO_PKG_VERSION"), job_id);

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            ev = shutdown_rx.recv() => {
                match ev {
                    Some(ShutdownEvent::Graceful) => {
                        eprintln!("stop requested, canceling job {job_id} (press CTRL+C again to exit immediately)");
                        match manager.cancel(job_id) {
                            Ok(()) | Err(vmgather_core::GatherError::AlreadyTerminal(_)) => {}
                            Err(e) => eprintln!("warning: cancel failed: {e}"),
                        }
                    }
                    Some(ShutdownEvent::Immediate) => {
                        eprintln!("stop requested again, exiting immediately");
                        std::process::exit(130);
                    }
                    None => {}
                }
            }
            _ = ticker.tick() => {
                let record = manager.status(job_id)?;
                if record.state.is_terminal() {
                    print_summary(&record);
                    std::process::exit(exit_code_for(record.state));
                }
                print_progress(&record);
            }
        }
    }
}

fn print_progress(record: &vmgather_core::JobRecord) {
    let eta = record
        .eta
        .map(|e| e.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string());
    println!(
        "batch {}/{} metrics={} avg_batch={:.1}s eta={}",
        record.completed_batches, record.total_batches, record.metrics_processed, record.average_batch_seconds, eta
    );
}

fn print_summary(record: &vmgather_core::JobRecord) {
    match record.state {
        JobState::Completed => {
            if let Some(result) = &record.result {
                println!(
                    "completed: archive={} size={}B metrics={} sha256={}",
                    result.archive_path, result.size_bytes, result.metrics_count, result.sha256
                );
            }
        }
        JobState::Failed => {
            eprintln!("failed: {}", record.error.as_deref().unwrap_or("unknown error"));
        }
        JobState::Canceled => {
            eprintln!(
                "canceled after {}/{} batches; staging file retained at {}",
                record.completed_batches, record.total_batches, record.staging_path
            );
        }
        JobState::Pending | JobState::Running => unreachable!("terminal summary requested for non-terminal job"),
    }
}

fn exit_code_for(state: JobState) -> i32 {
    match state {
        JobState::Completed => 0,
        JobState::Canceled => 130,
        _ => 1,
    }
}
