use std::sync::Arc;

use anyhow::Context;
use ecocompute::config::ProviderConfig;
use ecocompute::device::{self, ManualPower, PowerSource};
use ecocompute::jobs::{JobBoard, JobInput, JobStatus, NewJob, progress};
use ecocompute::provider::{Session, SessionStats};
use ecocompute::store::{BlobStore, JobStore, LibSqlBlobStore};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keep the guard alive so buffered file output is flushed on exit
    let _log_guard = init_tracing();

    let config = ProviderConfig::from_env().context("invalid configuration")?;

    eprintln!("EcoCompute v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Units: {}", config.pool_size);
    eprintln!(
        "   Tick: {}ms, timeout: {}ms, max attempts: {}",
        config.dispatch_interval.as_millis(),
        config.task_timeout.as_millis(),
        config.max_attempts
    );
    eprintln!("   Dispatch mode: {:?}", config.dispatch_mode);

    // ── Store ────────────────────────────────────────────────────────────
    let blobs: Arc<dyn BlobStore> = Arc::new(
        LibSqlBlobStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open store at {}", config.db_path.display()))?,
    );
    let store = JobStore::new(Arc::clone(&blobs));

    let device_id = device::load_or_create_device_id(blobs.as_ref())
        .await
        .context("failed to load device identifier")?;
    eprintln!("   Device: {}", device_id);

    // ── Demo job ─────────────────────────────────────────────────────────
    let board = JobBoard::new(store.clone(), config.max_attempts);
    if env_flag("ECOCOMPUTE_SEED_DEMO") {
        let job = board.submit(demo_matrix_job()).await?;
        eprintln!("   Seeded demo job {} ({} microtasks)", job.id, job.microtasks.len());
    }

    // ── Sharing session ──────────────────────────────────────────────────
    let power: Arc<dyn PowerSource> = ManualPower::unknown();
    let session = Session::start(&config, store, device_id, power);
    let mut stats = session.stats();

    eprintln!("   Sharing. Press Ctrl-C to stop.\n");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = stats.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot: SessionStats = stats.borrow_and_update().clone();
                tracing::debug!(
                    assigned = snapshot.assigned_to_me,
                    running = snapshot.running,
                    processed = snapshot.processed,
                    "Session stats"
                );
            }
        }
    }

    session.stop().await;

    for job in board.list().await {
        let p = progress(&job);
        eprintln!(
            "{} [{}] {}/{} ({}%){}",
            job.title,
            job.status,
            p.completed,
            p.total,
            p.percent(),
            if job.status == JobStatus::Completed { " done" } else { "" }
        );
        if let Some(matrix_c) = job.final_result.as_ref().and_then(|r| r.matrix_c.as_ref()) {
            eprintln!("   C = {:?}", matrix_c);
        }
    }

    Ok(())
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var("ECOCOMPUTE_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "ecocompute.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// 4x3 times 3x2, one microtask per row of A.
fn demo_matrix_job() -> NewJob {
    NewJob {
        title: "Demo matrix multiply".to_string(),
        description: "Row-wise A x B".to_string(),
        job_type: "matrix".to_string(),
        chunk_size: 1,
        redundancy: 1,
        priority: None,
        budget: None,
        input: JobInput::Matrix {
            a: vec![
                vec![1.0, 2.0, 3.0],
                vec![4.0, 5.0, 6.0],
                vec![7.0, 8.0, 9.0],
                vec![2.0, 3.0, 4.0],
            ],
            b: vec![vec![7.0, 8.0], vec![9.0, 10.0], vec![11.0, 12.0]],
        },
    }
}
