use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rpc::AgentAddr;

/// A shell task to run once on every listed agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub task_id: i64,
    #[serde(default)]
    pub name: String,
    pub command: String,
    /// Seconds; normalized before dispatch.
    #[serde(default)]
    pub timeout: i64,
    pub hosts: Vec<AgentAddr>,
    /// Extra attempts per host after a failed run. Manual stops are never retried.
    #[serde(default)]
    pub retry_times: u32,
    #[serde(default, with = "secs")]
    pub retry_interval: Duration,
}

impl Job {
    pub fn new(task_id: i64, command: impl Into<String>, hosts: Vec<AgentAddr>) -> Self {
        Self {
            task_id,
            name: String::new(),
            command: command.into(),
            timeout: 0,
            hosts,
            retry_times: 0,
            retry_interval: Duration::ZERO,
        }
    }

    pub fn with_timeout(mut self, secs: i64) -> Self {
        self.timeout = secs;
        self
    }

    pub fn with_retry(mut self, times: u32, interval: Duration) -> Self {
        self.retry_times = times;
        self.retry_interval = interval;
        self
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
