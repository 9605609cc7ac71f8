//! Admission gate: bounds the number of pipelines running at once

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AdmissionPolicy;
use crate::error::{RunnerError, RunnerResult};
use crate::pipeline::{ExecutionRequest, ExecutionResult, Pipeline};

/// Slot held for the duration of one execution
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

/// Semaphore in front of the pipeline
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    limit: usize,
    policy: AdmissionPolicy,
}

impl AdmissionGate {
    pub fn new(limit: usize, policy: AdmissionPolicy) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
            policy,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Take a slot according to the policy: queue up to a timeout, or refuse
    pub async fn admit(&self, cancel: &CancellationToken) -> RunnerResult<Admission> {
        match self.policy {
            AdmissionPolicy::Reject => match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => Ok(Admission { _permit: permit }),
                Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                    Err(RunnerError::Overloaded { limit: self.limit })
                }
            },
            AdmissionPolicy::Queue { timeout } => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(RunnerError::Cancelled),
                    acquired = tokio::time::timeout(timeout, Arc::clone(&self.permits).acquire_owned()) => {
                        match acquired {
                            Ok(Ok(permit)) => Ok(Admission { _permit: permit }),
                            Ok(Err(_)) | Err(_) => Err(RunnerError::Overloaded { limit: self.limit }),
                        }
                    }
                }
            }
        }
    }

    /// Wait for a slot regardless of policy
    pub async fn acquire(&self, cancel: &CancellationToken) -> RunnerResult<Admission> {
        tokio::select! {
            _ = cancel.cancelled() => Err(RunnerError::Cancelled),
            acquired = Arc::clone(&self.permits).acquire_owned() => acquired
                .map(|permit| Admission { _permit: permit })
                .map_err(|_| RunnerError::Overloaded { limit: self.limit }),
        }
    }
}

/// Admission gate plus pipeline: the entry point both intakes use
pub struct ExecutionService {
    gate: AdmissionGate,
    pipeline: Pipeline,
}

impl ExecutionService {
    pub fn new(gate: AdmissionGate, pipeline: Pipeline) -> Self {
        Self { gate, pipeline }
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Admit per policy, then execute
    pub async fn submit(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> RunnerResult<ExecutionResult> {
        let admission = match self.gate.admit(cancel).await {
            Ok(admission) => admission,
            Err(e) => {
                warn!("Request {} not admitted: {}", request.request_id, e);
                return Err(e);
            }
        };
        self.run_admitted(request, admission, cancel).await
    }

    /// Execute under a slot the caller already holds
    pub async fn run_admitted(
        &self,
        request: &ExecutionRequest,
        _admission: Admission,
        cancel: &CancellationToken,
    ) -> RunnerResult<ExecutionResult> {
        debug!(
            "Request {} admitted ({} slots free)",
            request.request_id,
            self.gate.available()
        );

        let started = Instant::now();
        let result = self.pipeline.execute(request, cancel).await;
        match &result {
            Ok(result) => info!(
                "Request {} ({}) finished: phase {:?}, exit {}, {}ms{}{}{}",
                request.request_id,
                request.language,
                result.phase,
                result.exit_code,
                started.elapsed().as_millis(),
                if result.timed_out { ", timed out" } else { "" },
                if result.memory_exceeded { ", memory exceeded" } else { "" },
                if result.truncated { ", truncated" } else { "" },
            ),
            Err(e) => warn!(
                "Request {} ({}) failed: {}",
                request.request_id, request.language, e
            ),
        }
        result
    }
}
