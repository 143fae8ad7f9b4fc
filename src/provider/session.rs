//! A sharing session: the pool plus the single loop that coordinates it.
//!
//! The loop owns the [`Dispatcher`] and is the only writer of the job
//! collection while the session runs. It wakes on the dispatch interval,
//! on unit results, on fired timeout watchers, and on stop.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::ProviderConfig;
use crate::device::{PauseReason, PowerSource};
use crate::provider::dispatcher::{DispatchCounters, Dispatcher, TickOutcome};
use crate::provider::slots::TaskRef;
use crate::sandbox::{LatencyRange, ResultMessage, SandboxPool};
use crate::store::JobStore;

/// Snapshot published after every loop iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub assigned_to_me: usize,
    pub running: usize,
    pub processed: u64,
    /// Set while the eligibility gate holds dispatch back.
    pub paused: Option<PauseReason>,
}

impl SessionStats {
    fn from_counters(counters: DispatchCounters, paused: Option<PauseReason>) -> Self {
        Self {
            assigned_to_me: counters.assigned_to_me,
            running: counters.running,
            processed: counters.processed,
            paused,
        }
    }
}

/// Handle to a running session.
pub struct Session {
    device_id: String,
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    stats: watch::Receiver<SessionStats>,
}

impl Session {
    /// Start the pool and the coordinating loop.
    pub fn start(
        config: &ProviderConfig,
        store: JobStore,
        device_id: impl Into<String>,
        power: Arc<dyn PowerSource>,
    ) -> Self {
        let device_id = device_id.into();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (timeouts_tx, timeouts_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (stats_tx, stats) = watch::channel(SessionStats::default());

        let latency = LatencyRange::new(config.latency_min, config.latency_max);
        let pool = SandboxPool::start(config.pool_size, latency, results_tx);
        let dispatcher = Dispatcher::new(
            config,
            store,
            device_id.clone(),
            power,
            pool.size(),
            timeouts_tx,
        );

        info!(
            device_id = %device_id,
            units = pool.size(),
            interval_ms = config.dispatch_interval.as_millis() as u64,
            mode = ?config.dispatch_mode,
            "Sharing session started"
        );

        let handle = tokio::spawn(run_loop(
            dispatcher,
            pool,
            LoopChannels {
                results: results_rx,
                timeouts: timeouts_rx,
                stop: stop_rx,
                stats: stats_tx,
            },
            config.dispatch_interval,
        ));

        Self {
            device_id,
            stop_tx,
            handle,
            stats,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Subscribe to stats snapshots.
    pub fn stats(&self) -> watch::Receiver<SessionStats> {
        self.stats.clone()
    }

    /// Stop sharing. Watchers are cleared and the pool torn down; in-flight
    /// microtasks stay assigned in storage.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Session loop ended abnormally");
        }
        info!(device_id = %self.device_id, "Sharing session stopped");
    }
}

struct LoopChannels {
    results: mpsc::UnboundedReceiver<ResultMessage>,
    timeouts: mpsc::UnboundedReceiver<TaskRef>,
    stop: oneshot::Receiver<()>,
    stats: watch::Sender<SessionStats>,
}

async fn run_loop(
    mut dispatcher: Dispatcher,
    pool: SandboxPool,
    mut channels: LoopChannels,
    interval: std::time::Duration,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut paused: Option<PauseReason> = None;

    loop {
        tokio::select! {
            biased;

            _ = &mut channels.stop => break,

            Some(message) = channels.results.recv() => {
                dispatcher.handle_result(message, Utc::now()).await;
            }

            Some(task) = channels.timeouts.recv() => {
                dispatcher.handle_timeout(task, Utc::now()).await;
            }

            _ = tick.tick() => {
                let outcome = dispatcher.tick(&pool, Utc::now()).await;
                let now_paused = match outcome {
                    TickOutcome::Paused(reason) => Some(reason),
                    _ => None,
                };
                if now_paused != paused {
                    match &now_paused {
                        Some(reason) => info!(reason = %reason, "Dispatch paused"),
                        None => info!("Dispatch resumed"),
                    }
                    paused = now_paused;
                }
            }
        }

        channels
            .stats
            .send_replace(SessionStats::from_counters(dispatcher.counters(), paused.clone()));
    }

    dispatcher.shutdown();
    pool.shutdown().await;
    channels
        .stats
        .send_replace(SessionStats::from_counters(dispatcher.counters(), paused));
}
