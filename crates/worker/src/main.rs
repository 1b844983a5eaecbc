use std::path::PathBuf;
use std::sync::Arc;

use atelier_comfyui::events::ComfyUIEvent;
use atelier_comfyui::manager::ComfyUIManager;
use atelier_pipeline::WorkflowTemplate;
use atelier_worker::config::WorkerConfig;
use atelier_worker::intake;
use atelier_worker::job::{JobResult, ResultSink};
use atelier_worker::queue::ExecutionQueue;
use atelier_worker::runner::ComfyUIRunner;
use atelier_worker::watchdog::spawn_watchdog;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atelier_worker=info,atelier_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Worker stopped");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), BoxError> {
    let config = WorkerConfig::from_env()?;

    let template = match &config.workflow_json {
        Some(json) => WorkflowTemplate::from_json(json)?,
        None => WorkflowTemplate::load(&config.workflow_path)?,
    };
    tokio::fs::create_dir_all(&config.output_dir).await?;

    let manager = Arc::new(ComfyUIManager::new(
        &config.comfyui_url,
        config.completion.clone(),
    )?);
    let caps = manager.fetch_metadata().await;
    tracing::info!(
        samplers = caps.samplers.len(),
        schedulers = caps.schedulers.len(),
        placeholders = ?template.placeholders(),
        "Worker ready",
    );

    let progress = tokio::spawn(log_progress(manager.subscribe()));

    let runner = Arc::new(ComfyUIRunner::new(Arc::clone(&manager)));
    let queue = ExecutionQueue::new(runner, config.queue_config());
    let cancel = CancellationToken::new();
    let watchdog = spawn_watchdog(queue.clone(), config.watchdog_interval, cancel.clone());

    println!("Enter a prompt, a JSON parameter object, or /queue. Ctrl-D to finish.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut deliveries = JoinSet::new();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, finishing queued jobs");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/queue" {
            print_queue(&queue);
            continue;
        }

        let prepared =
            intake::parse_line(line, &caps).and_then(|params| intake::prepare(params, &template));
        let (params, request) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                println!("Rejected: {e}");
                continue;
            }
        };

        let seed = params.seed.unwrap_or_default();
        let (sink, rx) = ResultSink::channel();
        let position = queue.enqueue(request, sink);
        println!("Queued at position {position} (seed {seed})");

        deliveries.spawn(report(rx, config.output_dir.clone(), seed));
    }

    while deliveries.join_next().await.is_some() {}

    cancel.cancel();
    let _ = watchdog.await;
    progress.abort();
    tracing::info!("Worker finished");
    Ok(())
}

/// Print the outcome of one job and save its image.
async fn report(rx: oneshot::Receiver<JobResult>, output_dir: PathBuf, seed: i64) {
    match rx.await {
        Ok(Ok(success)) => {
            let path = output_dir.join(format!("comfyui_{seed}.png"));
            match tokio::fs::write(&path, &success.bytes).await {
                Ok(()) => println!(
                    "Job {} done in {:.1}s: {}",
                    success.job_id,
                    success.elapsed.as_secs_f64(),
                    path.display()
                ),
                Err(e) => {
                    tracing::error!(job_id = success.job_id, path = %path.display(), error = %e, "Could not save image");
                }
            }
        }
        Ok(Err(failure)) => println!("Job {} failed ({}): {}", failure.job_id, failure.kind, failure.reason),
        Err(_) => tracing::error!("Job result was never delivered"),
    }
}

fn print_queue(queue: &ExecutionQueue) {
    let snapshot = queue.snapshot();
    match snapshot.running {
        Some(job_id) => println!("Running: job {job_id}"),
        None => println!("Running: nothing"),
    }
    println!("Waiting: {}", snapshot.pending);
    for (i, entry) in snapshot.head.iter().enumerate() {
        println!(
            "  {}. job {} ({}) queued {}",
            i + 1,
            entry.job_id,
            entry.requester.as_deref().unwrap_or("stdin"),
            entry.enqueued_at.format("%H:%M:%S"),
        );
    }
    if snapshot.pending > snapshot.head.len() {
        println!("  ... and {} more", snapshot.pending - snapshot.head.len());
    }
}

async fn log_progress(mut events: broadcast::Receiver<ComfyUIEvent>) {
    loop {
        match events.recv().await {
            Ok(ComfyUIEvent::GenerationProgress {
                prompt_id,
                value,
                max,
                percent,
            }) => {
                tracing::info!(prompt_id = %prompt_id, step = value, steps = max, percent, "Sampling");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Progress display lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
