use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::models::TaskPoll;
use super::CasApi;
use crate::config::PollingConfig;
use crate::utils::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub deadline: Option<Duration>,
}

impl PollPolicy {
    pub fn from_config(config: &PollingConfig) -> Self {
        Self {
            interval: config.interval(),
            deadline: config.deadline(),
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            deadline: Some(Duration::from_secs(600)),
        }
    }
}

/// 轮询 CAS 直到任务结果就绪
pub struct TaskPoller<'a> {
    cas: &'a dyn CasApi,
    policy: PollPolicy,
}

impl<'a> TaskPoller<'a> {
    pub fn new(cas: &'a dyn CasApi, policy: PollPolicy) -> Self {
        Self { cas, policy }
    }

    pub async fn resolve(&self, task_id: Uuid) -> GatewayResult<Vec<u8>> {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.cas.get_task_result(task_id).await? {
                TaskPoll::Ready(bytes) => {
                    debug!(%task_id, attempts, "任务结果就绪 ({} 字节)", bytes.len());
                    return Ok(bytes);
                }
                TaskPoll::Pending => {
                    if let Some(deadline) = self.policy.deadline {
                        if started.elapsed() + self.policy.interval > deadline {
                            return Err(GatewayError::Timeout(task_id.to_string()));
                        }
                    }
                    tokio::time::sleep(self.policy.interval).await;
                }
            }
        }
    }
}
