use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{DispatchError, DispatchFailure};
use crate::proto::TaskRequest;
use crate::rpc::{AgentAddr, DispatchClient, StopOutcome};
use crate::scheduler::{Job, Scheduler, SchedulerError};
use crate::store::{finished_fields, NewTaskLog, TaskLog, TaskLogStatus, TaskLogStore};

/// Runs jobs on agents through the [`DispatchClient`] and records each run in
/// the task-log store.
///
/// Every run is tracked so [`wait_and_exit`](Scheduler::wait_and_exit) can
/// block until in-flight dispatches have finished. Each run also owns a stop
/// token that covers its retry backoff, when no call is registered.
pub struct JobScheduler {
    client: Arc<DispatchClient>,
    store: Arc<dyn TaskLogStore>,
    tracker: TaskTracker,
    accepting: AtomicBool,
    runs: Arc<DashMap<i64, CancellationToken>>,
}

/// Outcome of a job on a single host.
#[derive(Debug)]
struct HostRun {
    host: AgentAddr,
    result: Result<String, DispatchFailure>,
}

impl JobScheduler {
    pub fn new(client: Arc<DispatchClient>, store: Arc<dyn TaskLogStore>) -> Self {
        Self {
            client,
            store,
            tracker: TaskTracker::new(),
            accepting: AtomicBool::new(false),
            runs: Arc::new(DashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<DispatchClient> {
        &self.client
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Number of runs still in flight.
    pub fn running(&self) -> usize {
        self.tracker.len()
    }

    /// Start `job` on all of its hosts and return the run's task-log record.
    ///
    /// The record id is the run identifier sent to the agents.
    pub async fn dispatch(&self, job: Job) -> Result<TaskLog, SchedulerError> {
        if !self.is_accepting() {
            return Err(SchedulerError::ShuttingDown);
        }
        if job.command.trim().is_empty() {
            return Err(SchedulerError::InvalidJob("command cannot be empty".to_string()));
        }
        if job.hosts.is_empty() {
            return Err(SchedulerError::InvalidJob("job has no hosts".to_string()));
        }

        let log = self
            .store
            .create(NewTaskLog {
                task_id: job.task_id,
                name: job.name.clone(),
                command: job.command.clone(),
                hosts: job.hosts.iter().map(ToString::to_string).collect(),
            })
            .await?;
        tracing::info!(task_id = job.task_id, run_id = log.id, hosts = job.hosts.len(), "Dispatching job");

        let client = Arc::clone(&self.client);
        let store = Arc::clone(&self.store);
        let runs = Arc::clone(&self.runs);
        let run_id = log.id;
        let stop = CancellationToken::new();
        runs.insert(run_id, stop.clone());
        self.tracker.spawn(async move {
            let host_runs = run_on_hosts(&client, &job, run_id, &stop).await;
            let (status, result) = summarize(&host_runs);
            // A record that already left `running` keeps its final state.
            match store
                .update_if(run_id, TaskLogStatus::Running, finished_fields(status, &result))
                .await
            {
                Ok(0) => tracing::warn!(run_id, status = %status, "Task log already closed, result not recorded"),
                Ok(_) => tracing::info!(run_id, status = %status, "Job finished"),
                Err(e) => tracing::error!(run_id, error = %e, "Failed to record job result"),
            }
            runs.remove(&run_id);
        });

        Ok(log)
    }

    /// Stop run `run_id` on each of `hosts`.
    ///
    /// A run this scheduler still owns is stopped as a whole: no further
    /// attempt starts and live calls are cancelled. Anything else goes through
    /// [`DispatchClient::stop`] per host.
    pub async fn stop(&self, run_id: i64, hosts: &[AgentAddr]) -> Vec<StopOutcome> {
        let owned = self.runs.get(&run_id).map(|entry| entry.value().clone());
        if let Some(stop) = owned {
            tracing::info!(run_id, hosts = hosts.len(), "Stopping scheduled run");
            stop.cancel();
            for host in hosts {
                self.client.signal(host, run_id);
            }
            return vec![StopOutcome::Signalled; hosts.len()];
        }

        let mut outcomes = Vec::with_capacity(hosts.len());
        for host in hosts {
            outcomes.push(self.client.stop(host, run_id).await);
        }
        outcomes
    }
}

#[async_trait]
impl Scheduler for JobScheduler {
    fn initialize(&self) {
        self.tracker.reopen();
        self.accepting.store(true, Ordering::Release);
        tracing::info!("Scheduler accepting jobs");
    }

    async fn wait_and_exit(&self) {
        self.accepting.store(false, Ordering::Release);
        self.tracker.close();
        tracing::info!(running = self.tracker.len(), "Scheduler waiting for running jobs");
        self.tracker.wait().await;
        tracing::info!("Scheduler stopped");
    }
}

async fn run_on_hosts(
    client: &Arc<DispatchClient>,
    job: &Job,
    run_id: i64,
    stop: &CancellationToken,
) -> Vec<HostRun> {
    let handles: Vec<_> = job
        .hosts
        .iter()
        .cloned()
        .map(|host| {
            let client = Arc::clone(client);
            let job = job.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let result = run_with_retry(&client, &host, &job, run_id, &stop).await;
                HostRun { host, result }
            })
        })
        .collect();

    let mut runs = Vec::with_capacity(handles.len());
    for (handle, host) in handles.into_iter().zip(job.hosts.iter()) {
        match handle.await {
            Ok(run) => runs.push(run),
            Err(e) => {
                tracing::error!(run_id, host = %host, error = %e, "Host run task failed");
                runs.push(HostRun {
                    host: host.clone(),
                    result: Err(DispatchFailure::new(DispatchError::Application(format!(
                        "host run aborted: {e}"
                    )))),
                });
            }
        }
    }
    runs
}

async fn run_with_retry(
    client: &DispatchClient,
    host: &AgentAddr,
    job: &Job,
    run_id: i64,
    stop: &CancellationToken,
) -> Result<String, DispatchFailure> {
    let mut attempt = 0;
    loop {
        if stop.is_cancelled() {
            return Err(DispatchFailure::new(DispatchError::ManuallyStopped));
        }
        let request = TaskRequest {
            id: run_id,
            command: job.command.clone(),
            timeout: job.timeout,
        };
        // Dropping the call on stop also covers a stop that lands just
        // before the call registered itself.
        let result = tokio::select! {
            result = client.exec(host, request) => result,
            _ = stop.cancelled() => Err(DispatchFailure::new(DispatchError::ManuallyStopped)),
        };
        match result {
            Ok(output) => return Ok(output),
            Err(failure) if failure.error.is_manual_stop() || attempt >= job.retry_times => {
                return Err(failure)
            }
            Err(failure) => {
                attempt += 1;
                tracing::warn!(
                    run_id,
                    host = %host,
                    attempt,
                    error = %failure,
                    "Job failed on host, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(job.retry_interval) => {}
                    _ = stop.cancelled() => {
                        tracing::info!(run_id, host = %host, "Run stopped during retry backoff");
                        return Err(DispatchFailure::with_output(
                            DispatchError::ManuallyStopped,
                            failure.output,
                        ));
                    }
                }
            }
        }
    }
}

fn summarize(runs: &[HostRun]) -> (TaskLogStatus, String) {
    let mut status = TaskLogStatus::Finish;
    let mut result = String::new();

    for run in runs {
        let section = match &run.result {
            Ok(output) => output.clone(),
            Err(failure) => {
                if failure.error.is_manual_stop() {
                    if status != TaskLogStatus::Failure {
                        status = TaskLogStatus::Cancel;
                    }
                } else {
                    status = TaskLogStatus::Failure;
                }
                if failure.output.is_empty() {
                    failure.error.to_string()
                } else {
                    format!("{}\n{}", failure.output, failure.error)
                }
            }
        };
        if runs.len() > 1 {
            result.push_str(&format!("Host: [{}]\n", run.host));
        }
        result.push_str(&section);
        if runs.len() > 1 {
            result.push_str("\n\n");
        }
    }

    (status, result)
}
