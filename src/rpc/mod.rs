//! Controller/agent RPC plumbing: the pooled connections and cancellation
//! registry the controller dispatches through, and the agent's `Run` server.

pub mod client;
pub mod pool;
pub mod registry;
pub mod server;

pub use client::{AgentAddr, DispatchClient, StopOutcome};
pub use pool::{ConnectionPool, PooledClient};
pub use registry::{CancellationRegistry, InvocationKey, Registration};
pub use server::{AgentServer, TaskService};
