use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::config::{normalize_timeout, AgentConfig};
use crate::proto::agent_server::{Agent, AgentServer as AgentGrpcServer};
use crate::proto::{ErrorKind, TaskRequest, TaskResponse};
use crate::tls::TlsIdentity;
use crate::worker::{clean_html_entities, ExecError, ExecOutput, Execute, ShellExecutor};

/// Agent-side `Run` handler.
pub struct TaskService<E = ShellExecutor> {
    executor: Arc<E>,
}

impl TaskService<ShellExecutor> {
    pub fn new() -> Self {
        Self::with_executor(ShellExecutor::new())
    }
}

impl Default for TaskService<ShellExecutor> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Execute> TaskService<E> {
    pub fn with_executor(executor: E) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }

    /// Execute `req` locally.
    ///
    /// `caller` is the inbound call's cancellation; a relay task forwards it
    /// into the local deadline for as long as this invocation lives. Execution
    /// failures, including panics, are reported in the response, never as a
    /// call failure.
    pub async fn execute(&self, caller: CancellationToken, req: TaskRequest) -> TaskResponse {
        let command = clean_html_entities(&req.command);
        let timeout = Duration::from_secs(normalize_timeout(req.timeout) as u64);
        tracing::info!(run_id = req.id, timeout_secs = timeout.as_secs(), "Execute command start");

        let local = CancellationToken::new();
        // Cancels `local` on every exit path, which also ends the relay.
        let _local_guard = local.clone().drop_guard();

        let relay_local = local.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = caller.cancelled() => {
                    tracing::info!("Caller cancelled, stopping local execution");
                    relay_local.cancel();
                }
                _ = relay_local.cancelled() => {}
            }
        });

        let executor = Arc::clone(&self.executor);
        let exec_token = local.clone();
        let handle =
            tokio::spawn(async move { executor.execute(&command, timeout, exec_token).await });

        let result = match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                tracing::error!(run_id = req.id, error = %e, "Command execution panicked");
                ExecOutput {
                    output: String::new(),
                    error: Some(ExecError::Panicked),
                }
            }
            Err(e) => {
                tracing::error!(run_id = req.id, error = %e, "Command execution aborted");
                ExecOutput {
                    output: String::new(),
                    error: Some(ExecError::Cancelled),
                }
            }
        };

        let response = to_response(result);
        tracing::info!(
            run_id = req.id,
            output_len = response.output.len(),
            error = %response.error,
            "Execute command end"
        );
        response
    }
}

fn to_response(result: ExecOutput) -> TaskResponse {
    let kind = match result.error {
        None => ErrorKind::Unspecified,
        Some(ExecError::Timeout) => ErrorKind::Timeout,
        Some(ExecError::Cancelled) => ErrorKind::Cancelled,
        Some(_) => ErrorKind::Failed,
    };
    TaskResponse {
        output: result.output,
        error: result.error.map(|e| e.to_string()).unwrap_or_default(),
        kind: kind as i32,
    }
}

#[tonic::async_trait]
impl<E: Execute> Agent for TaskService<E> {
    async fn run(&self, request: Request<TaskRequest>) -> Result<Response<TaskResponse>, Status> {
        // tonic drops this future when the caller resets the stream or its
        // deadline passes; the guard turns that drop into a cancellation.
        let caller = CancellationToken::new();
        let _caller_guard = caller.clone().drop_guard();

        let response = self.execute(caller, request.into_inner()).await;
        Ok(Response::new(response))
    }
}

/// gRPC listener for an agent node.
pub struct AgentServer<E = ShellExecutor> {
    config: AgentConfig,
    service: TaskService<E>,
    tls_identity: Option<TlsIdentity>,
}

impl AgentServer<ShellExecutor> {
    pub fn new(config: AgentConfig, tls_identity: Option<TlsIdentity>) -> Self {
        Self::with_service(config, TaskService::new(), tls_identity)
    }
}

impl<E: Execute> AgentServer<E> {
    pub fn with_service(
        config: AgentConfig,
        service: TaskService<E>,
        tls_identity: Option<TlsIdentity>,
    ) -> Self {
        Self {
            config,
            service,
            tls_identity,
        }
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(self.config.listen_addr).await
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves, then stop
    /// accepting calls and let in-flight calls finish.
    pub async fn serve<F>(
        self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send,
    {
        let local_addr: SocketAddr = listener.local_addr()?;
        let keep_alive = &self.config.keep_alive;

        let mut builder = Server::builder()
            .http2_keepalive_interval(Some(keep_alive.ping_interval))
            .http2_keepalive_timeout(Some(keep_alive.ping_timeout))
            .tcp_keepalive(Some(keep_alive.tcp_keepalive));

        if let Some(ref tls_identity) = self.tls_identity {
            builder = builder.tls_config(tls_identity.server_tls_config())?;
            tracing::info!("TLS enabled for agent server");
        }

        tracing::info!(addr = %local_addr, "Agent server listening");

        builder
            .add_service(AgentGrpcServer::new(self.service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await?;

        tracing::info!("Agent server stopped");
        Ok(())
    }
}
