use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tonic::Request;

use crate::config::{call_deadline, normalize_timeout};
use crate::error::{DispatchError, DispatchFailure, Result};
use crate::proto::{ErrorKind, TaskRequest, TaskResponse};
use crate::rpc::pool::ConnectionPool;
use crate::rpc::registry::{CancellationRegistry, InvocationKey};
use crate::store::{cancelled_fields, TaskLogStatus, TaskLogStore, ORPHANED_STOP_NOTE};

/// Network address of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentAddr {
    pub host: String,
    pub port: u16,
}

impl AgentAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn invocation_key(&self, run_id: i64) -> InvocationKey {
        InvocationKey::new(self.host.clone(), self.port, run_id)
    }
}

impl fmt::Display for AgentAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for AgentAddr {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid agent address {s:?}, expected host:port"))?;
        if host.is_empty() {
            return Err(format!("invalid agent address {s:?}, empty host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid agent address {s:?}, bad port"))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for AgentAddr {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AgentAddr> for String {
    fn from(addr: AgentAddr) -> Self {
        addr.to_string()
    }
}

/// What a [`DispatchClient::stop`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A live invocation was found and its call cancelled.
    Signalled,
    /// No live invocation; the task-log record was marked cancelled directly.
    Orphaned,
}

/// Controller-side entry point for running tasks on agents.
pub struct DispatchClient {
    pool: Arc<ConnectionPool>,
    registry: Arc<CancellationRegistry>,
    store: Arc<dyn TaskLogStore>,
}

impl DispatchClient {
    pub fn new(pool: Arc<ConnectionPool>, store: Arc<dyn TaskLogStore>) -> Self {
        Self {
            pool,
            registry: Arc::new(CancellationRegistry::new()),
            store,
        }
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    /// Run `request` on the agent at `addr` and wait for its output.
    ///
    /// The call is bounded by the normalized task timeout plus a grace period
    /// and can be interrupted with [`stop`](Self::stop) while it runs. On
    /// failure the error carries any output the agent produced.
    pub async fn exec(&self, addr: &AgentAddr, mut request: TaskRequest) -> Result<String> {
        let target = addr.to_string();
        let pooled = self.pool.checkout(&target).await?;
        let mut client = pooled.client.clone();

        request.timeout = normalize_timeout(request.timeout);
        let deadline = call_deadline(request.timeout);
        let run_id = request.id;

        let trigger = CancellationToken::new();
        let registration = self
            .registry
            .register(addr.invocation_key(run_id), trigger.clone());
        tracing::info!(key = %registration.key(), run_id, timeout_secs = request.timeout, "Dispatching task");

        let mut call = Request::new(request);
        call.set_timeout(deadline);

        let result = tokio::select! {
            res = tokio::time::timeout(deadline, client.run(call)) => match res {
                Ok(res) => res,
                Err(_) => {
                    tracing::warn!(key = %registration.key(), "Call deadline elapsed");
                    Err(tonic::Status::deadline_exceeded("call deadline elapsed"))
                }
            },
            _ = trigger.cancelled() => {
                tracing::info!(key = %registration.key(), "Call cancelled by stop request");
                Err(tonic::Status::cancelled("stopped by controller"))
            }
        };
        drop(registration);

        match result {
            Ok(response) => response_to_result(response.into_inner()),
            Err(status) => {
                let error = DispatchError::classify(status);
                if error.is_unavailable() {
                    self.pool.evict(&target, &pooled).await;
                }
                tracing::warn!(addr = %target, run_id, error = %error, "Task dispatch failed");
                Err(DispatchFailure::new(error))
            }
        }
    }

    /// Cancel the live call for `run_id` on `addr`, if this process has one.
    pub fn signal(&self, addr: &AgentAddr, run_id: i64) -> bool {
        let key = addr.invocation_key(run_id);
        match self.registry.lookup(&key) {
            Some(trigger) => {
                tracing::info!(key = %key, "Found running task, cancelling call");
                trigger.cancel();
                true
            }
            None => false,
        }
    }

    /// Interrupt run `run_id` on `addr`.
    ///
    /// If this process still tracks the invocation, its call is cancelled and
    /// the agent observes the cancellation. Otherwise the run is orphaned (it
    /// finished or predates this process) and its task-log record is marked
    /// cancelled without contacting the agent, but only while it is still
    /// running. Never fails.
    pub async fn stop(&self, addr: &AgentAddr, run_id: i64) -> StopOutcome {
        tracing::info!(addr = %addr, run_id, "Stopping task");
        if self.signal(addr, run_id) {
            return StopOutcome::Signalled;
        }

        tracing::warn!(addr = %addr, run_id, "No running task found, marking task log cancelled");
        match self
            .store
            .update_if(run_id, TaskLogStatus::Running, cancelled_fields(ORPHANED_STOP_NOTE))
            .await
        {
            Ok(0) => tracing::info!(run_id, "Task log no longer running, left unchanged"),
            Ok(_) => tracing::info!(run_id, "Orphaned task log marked cancelled"),
            Err(e) => tracing::error!(run_id, error = %e, "Failed to update orphaned task log"),
        }
        StopOutcome::Orphaned
    }
}

fn response_to_result(resp: TaskResponse) -> Result<String> {
    if resp.error.is_empty() {
        return Ok(resp.output);
    }

    let error = match ErrorKind::try_from(resp.kind) {
        Ok(ErrorKind::Timeout) => DispatchError::ExecutionTimeout,
        Ok(ErrorKind::Cancelled) => DispatchError::ManuallyStopped,
        _ => DispatchError::Application(resp.error),
    };
    Err(DispatchFailure::with_output(error, resp.output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{finished_fields, MemoryTaskLogStore, NewTaskLog};
    use crate::config::KeepAliveConfig;

    fn response(output: &str, error: &str, kind: ErrorKind) -> TaskResponse {
        TaskResponse {
            output: output.to_string(),
            error: error.to_string(),
            kind: kind as i32,
        }
    }

    #[test]
    fn agent_addr_parses_and_formats() {
        let addr: AgentAddr = "10.1.2.3:5921".parse().unwrap();
        assert_eq!(addr, AgentAddr::new("10.1.2.3", 5921));
        assert_eq!(addr.to_string(), "10.1.2.3:5921");
        assert_eq!(addr.invocation_key(9).to_string(), "10.1.2.3:5921:9");
    }

    #[test]
    fn agent_addr_rejects_garbage() {
        assert!("no-port".parse::<AgentAddr>().is_err());
        assert!(":5921".parse::<AgentAddr>().is_err());
        assert!("host:99999".parse::<AgentAddr>().is_err());
    }

    #[test]
    fn agent_addr_serde_as_string() {
        let addr: AgentAddr = serde_json::from_str("\"agent-1:7000\"").unwrap();
        assert_eq!(addr, AgentAddr::new("agent-1", 7000));
        assert_eq!(serde_json::to_string(&addr).unwrap(), "\"agent-1:7000\"");
    }

    #[test]
    fn empty_error_is_success() {
        let out = response_to_result(response("hello\n", "", ErrorKind::Unspecified)).unwrap();
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn reported_error_keeps_output() {
        let failure =
            response_to_result(response("partial", "exit status 1", ErrorKind::Failed)).unwrap_err();
        assert_eq!(failure.output, "partial");
        match failure.error {
            DispatchError::Application(msg) => assert_eq!(msg, "exit status 1"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn agent_timeout_is_execution_timeout() {
        let failure =
            response_to_result(response("tick\n", "execution timed out", ErrorKind::Timeout))
                .unwrap_err();
        assert!(matches!(failure.error, DispatchError::ExecutionTimeout));
        assert_eq!(failure.output, "tick\n");
    }

    #[test]
    fn agent_cancel_is_manual_stop() {
        let failure =
            response_to_result(response("", "execution cancelled", ErrorKind::Cancelled))
                .unwrap_err();
        assert!(failure.error.is_manual_stop());
    }

    #[tokio::test]
    async fn stop_untracked_run_marks_log_cancelled() {
        let store = Arc::new(MemoryTaskLogStore::new());
        let log = store
            .create(NewTaskLog {
                task_id: 1,
                name: "t".to_string(),
                command: "sleep 100".to_string(),
                hosts: vec!["127.0.0.1:5921".to_string()],
            })
            .await
            .unwrap();
        let client = DispatchClient::new(
            Arc::new(ConnectionPool::new(None, KeepAliveConfig::default())),
            store.clone(),
        );

        let outcome = client.stop(&AgentAddr::new("127.0.0.1", 5921), log.id).await;
        assert_eq!(outcome, StopOutcome::Orphaned);

        let log = store.get(log.id).await.unwrap().unwrap();
        assert_eq!(log.status, TaskLogStatus::Cancel);
        assert_eq!(log.result, ORPHANED_STOP_NOTE);
    }

    #[tokio::test]
    async fn repeated_stop_cancels_once() {
        let store = Arc::new(MemoryTaskLogStore::new());
        let log = store
            .create(NewTaskLog {
                task_id: 1,
                name: "t".to_string(),
                command: "sleep 100".to_string(),
                hosts: vec!["127.0.0.1:5921".to_string()],
            })
            .await
            .unwrap();
        let client = DispatchClient::new(
            Arc::new(ConnectionPool::new(None, KeepAliveConfig::default())),
            store.clone(),
        );
        let addr = AgentAddr::new("127.0.0.1", 5921);

        assert_eq!(client.stop(&addr, log.id).await, StopOutcome::Orphaned);
        let first = store.get(log.id).await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(client.stop(&addr, log.id).await, StopOutcome::Orphaned);
        let second = store.get(log.id).await.unwrap().unwrap();

        assert_eq!(second.status, TaskLogStatus::Cancel);
        assert_eq!(second.end_time, first.end_time);
    }

    #[tokio::test]
    async fn stop_leaves_finished_run_alone() {
        let store = Arc::new(MemoryTaskLogStore::new());
        let log = store
            .create(NewTaskLog {
                task_id: 1,
                name: "t".to_string(),
                command: "echo done".to_string(),
                hosts: vec!["127.0.0.1:5921".to_string()],
            })
            .await
            .unwrap();
        store
            .update(log.id, finished_fields(TaskLogStatus::Finish, "done\n"))
            .await
            .unwrap();
        let finished = store.get(log.id).await.unwrap().unwrap();
        let client = DispatchClient::new(
            Arc::new(ConnectionPool::new(None, KeepAliveConfig::default())),
            store.clone(),
        );

        let outcome = client.stop(&AgentAddr::new("127.0.0.1", 5921), log.id).await;
        assert_eq!(outcome, StopOutcome::Orphaned);

        let log = store.get(log.id).await.unwrap().unwrap();
        assert_eq!(log.status, TaskLogStatus::Finish);
        assert_eq!(log.result, "done\n");
        assert_eq!(log.end_time, finished.end_time);
    }

    #[tokio::test]
    async fn stop_tracked_run_fires_trigger() {
        let store = Arc::new(MemoryTaskLogStore::new());
        let client = DispatchClient::new(
            Arc::new(ConnectionPool::new(None, KeepAliveConfig::default())),
            store,
        );
        let addr = AgentAddr::new("127.0.0.1", 5921);
        let token = CancellationToken::new();
        let _registration = client
            .registry()
            .register(addr.invocation_key(3), token.clone());

        assert_eq!(client.stop(&addr, 3).await, StopOutcome::Signalled);
        assert!(token.is_cancelled());
    }
}
