//! Client side of the hypervisor agent protocol.
//!
//! The reconciler only sees the [`AgentClient`] trait; [`GrpcAgentClient`]
//! is the production implementation over mutually authenticated gRPC.

pub mod grpc;

pub use grpc::{AgentEndpointConfig, GrpcAgentClient};

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, AgentResult};
use crate::vm::{RemoteVmStatus, VmSpec};

/// Acknowledgement of a lifecycle command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ack {
    pub message: String,
}

/// Per-call deadline and stop signal.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    /// Drive `call` to completion unless the deadline passes or the context
    /// is cancelled first. Cancellation wins over a simultaneous timeout.
    pub async fn run<T, F>(&self, call: F) -> AgentResult<T>
    where
        F: Future<Output = AgentResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AgentError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, call) => match outcome {
                Ok(result) => result,
                Err(_elapsed) => Err(AgentError::Timeout(self.timeout)),
            },
        }
    }
}

/// The four-method capability every hypervisor agent exposes.
///
/// Commands are expected to be idempotent on the agent side; the reconciler
/// delivers them at least once.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Create the VM, or start it if it already exists.
    async fn create_vm(&self, spec: &VmSpec, ctx: &CallContext) -> AgentResult<Ack>;

    async fn stop_vm(&self, name: &str, ctx: &CallContext) -> AgentResult<Ack>;

    async fn destroy_vm(&self, name: &str, ctx: &CallContext) -> AgentResult<Ack>;

    /// Current state of every VM the agent knows about.
    async fn fetch_state(&self, ctx: &CallContext) -> AgentResult<Vec<RemoteVmStatus>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_times_out() {
        let ctx = CallContext::new(Duration::from_millis(20), CancellationToken::new());
        let result: AgentResult<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(AgentError::Timeout(Duration::from_millis(20))));
    }

    #[tokio::test]
    async fn test_run_cancelled_before_timeout() {
        let cancel = CancellationToken::new();
        let ctx = CallContext::new(Duration::from_secs(30), cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let result: AgentResult<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        trigger.await.unwrap();

        assert_eq!(result, Err(AgentError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_passes_through_result() {
        let ctx = CallContext::new(Duration::from_secs(1), CancellationToken::new());
        let result = ctx
            .run(async { Err::<(), _>(AgentError::RemoteError("disk full".into())) })
            .await;
        assert_eq!(result, Err(AgentError::RemoteError("disk full".into())));
    }
}
