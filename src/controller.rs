use std::sync::Arc;

use crate::config::ControllerConfig;
use crate::http::{HttpServerHandle, HttpState};
use crate::rpc::{ConnectionPool, DispatchClient};
use crate::scheduler::{JobScheduler, Scheduler};
use crate::shutdown::{listen_for_signals, DrainPlan, ShutdownOrchestrator, ShutdownOutcome};
use crate::store::{MemoryTaskLogStore, TaskLogStore};
use crate::tls::TlsIdentity;

/// The controller process: dispatches jobs to agents and serves the HTTP API.
pub struct Controller {
    pub config: ControllerConfig,
    pub store: Arc<dyn TaskLogStore>,
    pub client: Arc<DispatchClient>,
    pub scheduler: Arc<JobScheduler>,
}

impl Controller {
    pub fn new(config: ControllerConfig, tls_identity: Option<TlsIdentity>) -> Self {
        Self::with_store(config, tls_identity, Arc::new(MemoryTaskLogStore::new()))
    }

    pub fn with_store(
        config: ControllerConfig,
        tls_identity: Option<TlsIdentity>,
        store: Arc<dyn TaskLogStore>,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(tls_identity, config.keep_alive.clone()));
        let client = Arc::new(DispatchClient::new(pool, Arc::clone(&store)));
        let scheduler = Arc::new(JobScheduler::new(Arc::clone(&client), Arc::clone(&store)));

        Self {
            config,
            store,
            client,
            scheduler,
        }
    }

    /// Run the controller until it is shut down.
    ///
    /// Starts the scheduler and the HTTP front end, then hands control to the
    /// shutdown orchestrator, which drains HTTP, then the scheduler, then the
    /// store once SIGINT or SIGTERM arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP listener cannot be bound or signal
    /// handlers cannot be installed. Drain-step failures are only logged.
    pub async fn run(self) -> Result<ShutdownOutcome, Box<dyn std::error::Error + Send + Sync>> {
        let signals = listen_for_signals()?;

        self.scheduler.initialize();

        let http = Arc::new(
            HttpServerHandle::bind(
                self.config.http_addr,
                HttpState {
                    scheduler: Arc::clone(&self.scheduler),
                    store: Arc::clone(&self.store),
                },
            )
            .await?,
        );

        let orchestrator = ShutdownOrchestrator::new(self.config.shutdown_timeout);
        let outcome = orchestrator
            .run(
                signals,
                DrainPlan {
                    front_end: http,
                    scheduler: self.scheduler,
                    storage: self.store,
                },
            )
            .await;

        Ok(outcome)
    }
}
