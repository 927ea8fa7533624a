use std::sync::Arc;

use anyhow::{Context, Result};
use ff_agents::{Orchestrator, OrchestratorError, RunReport, Started, Worker};
use ff_core::config::Config;
use ff_core::types::{AgentId, TaskId};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::http_api::{self, ApiState};
use crate::patrol::PatrolRunner;
use crate::shutdown::{ShutdownReason, ShutdownSignal};

// ---------------------------------------------------------------------------
// Loop commands
// ---------------------------------------------------------------------------

/// A run accepted by the scheduling loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTicket {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub attempt: u32,
}

impl From<&Started> for RunTicket {
    fn from(started: &Started) -> Self {
        Self {
            task_id: started.task_id.clone(),
            agent_id: started.agent_id.clone(),
            attempt: started.attempt,
        }
    }
}

#[derive(Debug)]
pub enum LoopCommand {
    /// Start one specific task now and report whether it started.
    TriggerRun {
        task_id: TaskId,
        reply: oneshot::Sender<Result<RunTicket, OrchestratorError>>,
    },
    /// Run a scheduling pass without waiting for the next interval.
    Tick,
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("scheduling loop is not running")]
    Stopped,
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Cheap, cloneable way for the HTTP API to reach the scheduling loop.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    commands: flume::Sender<LoopCommand>,
    shutdown: ShutdownSignal,
}

impl LoopHandle {
    pub async fn trigger_run(&self, task_id: TaskId) -> Result<RunTicket, LoopError> {
        if self.shutdown.is_shutting_down() {
            return Err(LoopError::Stopped);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send_async(LoopCommand::TriggerRun { task_id, reply })
            .await
            .map_err(|_| LoopError::Stopped)?;
        tokio::select! {
            answer = rx => answer.map_err(|_| LoopError::Stopped)?.map_err(LoopError::from),
            _ = self.shutdown.wait() => Err(LoopError::Stopped),
        }
    }

    pub fn request_tick(&self) -> Result<(), LoopError> {
        if self.shutdown.is_shutting_down() {
            return Err(LoopError::Stopped);
        }
        self.commands
            .send(LoopCommand::Tick)
            .map_err(|_| LoopError::Stopped)
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_shutting_down()
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Outcome of a finished run task inside the loop's `JoinSet`. Triggered
/// runs that never started yield `Ok(None)`.
type RunResult = ff_agents::Result<Option<RunReport>>;

/// The orchestrator daemon: scheduling loop, patrol and HTTP API.
pub struct Daemon {
    config: Config,
    orchestrator: Arc<Orchestrator>,
    shutdown: ShutdownSignal,
    commands_tx: flume::Sender<LoopCommand>,
    commands_rx: flume::Receiver<LoopCommand>,
}

impl Daemon {
    /// Open the state database from config and recover interrupted runs.
    pub async fn new(config: Config, worker: Arc<dyn Worker>) -> Result<Self> {
        let orchestrator = Orchestrator::open(&config, worker)
            .await
            .context("failed to open orchestrator state")?;
        Ok(Self::with_orchestrator(config, Arc::new(orchestrator)))
    }

    pub fn with_orchestrator(config: Config, orchestrator: Arc<Orchestrator>) -> Self {
        let (commands_tx, commands_rx) = flume::unbounded();
        Self {
            config,
            orchestrator,
            shutdown: ShutdownSignal::new(),
            commands_tx,
            commands_rx,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger(ShutdownReason::Operator);
    }

    pub fn loop_handle(&self) -> LoopHandle {
        LoopHandle {
            commands: self.commands_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn api_state(&self) -> Arc<ApiState> {
        Arc::new(
            ApiState::new(self.orchestrator.clone(), self.loop_handle())
                .with_project_name(self.config.general.project_name.clone()),
        )
    }

    // ------------------------------------------------------------------
    // Standalone mode
    // ------------------------------------------------------------------

    /// Bind the configured address and run until shutdown (blocking).
    pub async fn run(&self) -> Result<()> {
        let bind_addr = self.config.daemon.bind_addr();
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Serve the API on a pre-bound listener and run the scheduling loop
    /// inline until shutdown or a storage failure.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let router = http_api::api_router(self.api_state());
        let bind_addr = listener.local_addr()?;
        let shutdown = self.shutdown.clone();
        let api_handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown.wait().await;
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "API server error");
            }
        });
        info!(%bind_addr, "API server listening");

        let outcome = self.run_loop().await;

        if let Err(e) = api_handle.await {
            warn!(error = %e, "API server task ended abnormally");
        }
        let reason = self.shutdown.reason().unwrap_or(ShutdownReason::LoopStopped);
        info!(%reason, "daemon stopped");
        outcome
    }

    /// The scheduling loop: interval ticks, loop commands, patrol and run
    /// completions, until shutdown. A storage failure stops the loop and is
    /// returned as an error.
    pub async fn run_loop(&self) -> Result<()> {
        let scheduler = self.config.scheduler.clone();
        let patrol = PatrolRunner::new(scheduler.stalled_after());

        let mut tick_interval = tokio::time::interval(scheduler.tick_interval());
        let mut patrol_interval = tokio::time::interval(scheduler.patrol_interval());
        tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Consume the first immediate patrol so it doesn't fire at t=0.
        patrol_interval.tick().await;

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut runs: JoinSet<RunResult> = JoinSet::new();
        let mut fatal: Option<OrchestratorError> = None;

        info!(
            tick_secs = scheduler.tick_secs,
            patrol_secs = scheduler.patrol_secs,
            max_concurrent = scheduler.max_concurrent,
            "scheduling loop starting"
        );

        while !self.shutdown.is_shutting_down() {
            let step = tokio::select! {
                _ = tick_interval.tick() => self.tick(&mut runs).await,
                command = self.commands_rx.recv_async() => match command {
                    Ok(LoopCommand::Tick) => self.tick(&mut runs).await,
                    Ok(LoopCommand::TriggerRun { task_id, reply }) => {
                        self.spawn_triggered(&mut runs, task_id, reply);
                        Ok(())
                    }
                    // Unreachable while the daemon holds a sender.
                    Err(_) => Ok(()),
                },
                Some(joined) = runs.join_next() => self.on_run_finished(joined),
                _ = patrol_interval.tick() => {
                    patrol.run_patrol(&self.orchestrator);
                    Ok(())
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping scheduling loop");
                    break;
                }
            };
            if let Err(e) = step {
                error!(error = %e, "storage failure, halting scheduling loop");
                fatal = Some(e);
                break;
            }
        }

        // Wake anyone waiting on a loop reply before draining.
        let reason = if fatal.is_some() {
            ShutdownReason::StorageFailure
        } else {
            ShutdownReason::LoopStopped
        };
        self.shutdown.trigger(reason);
        self.drain(&mut runs).await;

        match fatal {
            Some(e) => Err(anyhow::Error::new(e).context("scheduling loop halted")),
            None => Ok(()),
        }
    }

    async fn tick(&self, runs: &mut JoinSet<RunResult>) -> ff_agents::Result<()> {
        let started = self.orchestrator.tick().await?;
        if !started.is_empty() {
            info!(count = started.len(), "tick started runs");
        }
        for run in started {
            let orchestrator = self.orchestrator.clone();
            runs.spawn(async move { orchestrator.drive(run).await.map(Some) });
        }
        Ok(())
    }

    fn spawn_triggered(
        &self,
        runs: &mut JoinSet<RunResult>,
        task_id: TaskId,
        reply: oneshot::Sender<Result<RunTicket, OrchestratorError>>,
    ) {
        let orchestrator = self.orchestrator.clone();
        runs.spawn(async move {
            let started = match orchestrator.trigger_run(&task_id).await {
                Ok(started) => started,
                Err(e) => {
                    let fatal = match &e {
                        OrchestratorError::Storage(msg) => {
                            Some(OrchestratorError::Storage(msg.clone()))
                        }
                        _ => None,
                    };
                    let _ = reply.send(Err(e));
                    return fatal.map_or(Ok(None), Err);
                }
            };
            let _ = reply.send(Ok(RunTicket::from(&started)));
            orchestrator.drive(started).await.map(Some)
        });
    }

    fn on_run_finished(
        &self,
        joined: Result<RunResult, tokio::task::JoinError>,
    ) -> ff_agents::Result<()> {
        match joined {
            Ok(Ok(Some(report))) => {
                debug!(
                    task_id = %report.task_id,
                    status = %report.status,
                    discarded = report.discarded,
                    "run recorded"
                );
                Ok(())
            }
            Ok(Ok(None)) => Ok(()),
            Ok(Err(e)) if e.is_fatal() => Err(e),
            Ok(Err(e)) => {
                warn!(error = %e, "run could not be recorded");
                Ok(())
            }
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => {
                error!(error = %e, "run task panicked");
                Ok(())
            }
        }
    }

    /// Wait up to `drain_secs` for in-flight runs, then abort the rest. The
    /// aborted tasks stay in progress and are reset by the next recovery.
    async fn drain(&self, runs: &mut JoinSet<RunResult>) {
        if runs.is_empty() {
            return;
        }
        let in_flight = runs.len();
        info!(in_flight, "draining in-flight runs");
        let deadline = self.config.scheduler.drain();
        let drained = tokio::time::timeout(deadline, async {
            while let Some(joined) = runs.join_next().await {
                if let Err(e) = self.on_run_finished(joined) {
                    error!(error = %e, "storage failure while draining");
                }
            }
        })
        .await;

        if drained.is_err() {
            let remaining = runs.len();
            runs.abort_all();
            while runs.join_next().await.is_some() {}
            let workers = self.orchestrator.coordinator().abort_workers();
            warn!(
                remaining,
                workers, "drain timed out, aborted runs left for recovery"
            );
        }
    }
}
