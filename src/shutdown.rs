//! Process shutdown: signal intake and the ordered controller drain.
//!
//! The controller moves `Running -> Draining -> Stopped` exactly once. The
//! first SIGINT/SIGTERM (or a call to [`ShutdownOrchestrator::initiate_drain`])
//! starts the drain; SIGHUP is ignored. While draining, a second termination
//! signal exits the process immediately through the exit hook.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_SHUTDOWN_TIMEOUT;
use crate::scheduler::Scheduler;
use crate::store::TaskLogStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Terminal disconnected. Never a shutdown trigger.
    Hangup,
    Interrupt,
    Terminate,
}

impl ProcessSignal {
    pub fn is_termination(self) -> bool {
        !matches!(self, ProcessSignal::Hangup)
    }
}

impl fmt::Display for ProcessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessSignal::Hangup => write!(f, "SIGHUP"),
            ProcessSignal::Interrupt => write!(f, "SIGINT"),
            ProcessSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Install handlers for SIGHUP, SIGINT and SIGTERM and forward every delivery
/// into the returned channel.
pub fn listen_for_signals() -> std::io::Result<mpsc::UnboundedReceiver<ProcessSignal>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = hangup.recv() => ProcessSignal::Hangup,
                Some(()) = interrupt.recv() => ProcessSignal::Interrupt,
                Some(()) = terminate.recv() => ProcessSignal::Terminate,
                else => break,
            };
            if tx.send(received).is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

/// Wait for the first SIGINT/SIGTERM, skipping SIGHUP.
///
/// Returns `None` if the signal source is gone.
pub async fn wait_for_termination(
    signals: &mut mpsc::UnboundedReceiver<ProcessSignal>,
) -> Option<ProcessSignal> {
    while let Some(sig) = signals.recv().await {
        if sig.is_termination() {
            tracing::info!(signal = %sig, "Received termination signal");
            return Some(sig);
        }
        tracing::info!(signal = %sig, "Ignoring signal");
    }
    None
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A request-serving front end that can stop accepting and drain.
#[async_trait]
pub trait FrontEnd: Send + Sync {
    /// Stop accepting new connections and return once in-flight requests
    /// have completed.
    async fn shutdown(&self) -> Result<(), ShutdownError>;
}

/// The collaborators drained on shutdown, in order.
pub struct DrainPlan {
    pub front_end: Arc<dyn FrontEnd>,
    pub scheduler: Arc<dyn Scheduler>,
    pub storage: Arc<dyn TaskLogStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStep {
    FrontEnd,
    Scheduler,
    Storage,
}

impl fmt::Display for DrainStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainStep::FrontEnd => write!(f, "http"),
            DrainStep::Scheduler => write!(f, "scheduler"),
            DrainStep::Storage => write!(f, "storage"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every step ran; `failed` lists the steps that errored or ran out of time.
    Completed { failed: Vec<DrainStep> },
    /// A repeated termination signal cut the drain short.
    Forced,
}

type ExitHook = Box<dyn Fn(i32) + Send + Sync>;

pub struct ShutdownOrchestrator {
    state: watch::Sender<ShutdownState>,
    trigger: CancellationToken,
    timeout: Duration,
    exit: ExitHook,
}

impl Default for ShutdownOrchestrator {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT)
    }
}

impl ShutdownOrchestrator {
    /// `timeout` bounds the whole drain sequence, not each step.
    pub fn new(timeout: Duration) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            state,
            trigger: CancellationToken::new(),
            timeout,
            exit: Box::new(|code| {
                std::process::exit(code);
            }),
        }
    }

    /// Replace the forced-exit action. Tests use this to observe the escape
    /// hatch without terminating the test process.
    pub fn with_exit_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.exit = Box::new(hook);
        self
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Move to `Draining`. Returns false if a drain was already started.
    pub fn initiate_drain(&self) -> bool {
        let started = self.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Draining;
                true
            } else {
                false
            }
        });
        if started {
            tracing::info!("Shutdown initiated, draining");
            self.trigger.cancel();
        }
        started
    }

    /// Wait for a shutdown trigger, then drain `plan`.
    pub async fn run(
        &self,
        mut signals: mpsc::UnboundedReceiver<ProcessSignal>,
        plan: DrainPlan,
    ) -> ShutdownOutcome {
        let mut signals_open = true;

        loop {
            tokio::select! {
                _ = self.trigger.cancelled() => break,
                sig = signals.recv(), if signals_open => match sig {
                    Some(sig) if sig.is_termination() => {
                        tracing::info!(signal = %sig, "Received termination signal");
                        self.initiate_drain();
                        break;
                    }
                    Some(sig) => tracing::info!(signal = %sig, "Ignoring signal while running"),
                    None => signals_open = false,
                },
            }
        }

        let deadline = Instant::now() + self.timeout;
        let steps = drain(&plan, deadline);
        tokio::pin!(steps);

        loop {
            tokio::select! {
                failed = &mut steps => {
                    self.state.send_replace(ShutdownState::Stopped);
                    tracing::info!(failed_steps = failed.len(), "Shutdown complete");
                    return ShutdownOutcome::Completed { failed };
                }
                sig = signals.recv(), if signals_open => match sig {
                    Some(sig) if sig.is_termination() => {
                        tracing::warn!(signal = %sig, "Repeated termination signal, forcing exit");
                        self.state.send_replace(ShutdownState::Stopped);
                        (self.exit)(1);
                        return ShutdownOutcome::Forced;
                    }
                    Some(sig) => tracing::info!(signal = %sig, "Ignoring signal while draining"),
                    None => signals_open = false,
                },
            }
        }
    }
}

async fn drain(plan: &DrainPlan, deadline: Instant) -> Vec<DrainStep> {
    let mut failed = Vec::new();

    tracing::info!(step = %DrainStep::FrontEnd, "Stopping HTTP front end");
    match timeout_at(deadline, plan.front_end.shutdown()).await {
        Ok(Ok(())) => tracing::info!(step = %DrainStep::FrontEnd, "HTTP front end stopped"),
        Ok(Err(e)) => {
            tracing::error!(step = %DrainStep::FrontEnd, error = %e, "HTTP front end shutdown failed");
            failed.push(DrainStep::FrontEnd);
        }
        Err(_) => {
            tracing::warn!(step = %DrainStep::FrontEnd, "HTTP front end did not drain before deadline");
            failed.push(DrainStep::FrontEnd);
        }
    }

    tracing::info!(step = %DrainStep::Scheduler, "Waiting for scheduler");
    match timeout_at(deadline, plan.scheduler.wait_and_exit()).await {
        Ok(()) => tracing::info!(step = %DrainStep::Scheduler, "Scheduler drained"),
        Err(_) => {
            tracing::warn!(step = %DrainStep::Scheduler, "Running jobs abandoned at deadline");
            failed.push(DrainStep::Scheduler);
        }
    }

    tracing::info!(step = %DrainStep::Storage, "Closing task log store");
    match timeout_at(deadline, plan.storage.close()).await {
        Ok(Ok(())) => tracing::info!(step = %DrainStep::Storage, "Task log store closed"),
        Ok(Err(e)) => {
            tracing::error!(step = %DrainStep::Storage, error = %e, "Failed to close task log store");
            failed.push(DrainStep::Storage);
        }
        Err(_) => {
            tracing::warn!(step = %DrainStep::Storage, "Task log store close timed out");
            failed.push(DrainStep::Storage);
        }
    }

    failed
}
