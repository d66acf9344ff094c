use crate::config::types::{ErrorKind, ExecutionResult, ExecutionStatus, ResultBuilder};
use crate::core::types::CancelToken;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Lifecycle status shared between a worker and its handle
#[derive(Clone, Debug)]
pub(crate) struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ExecutionStatus::Pending.to_u8())))
    }

    pub(crate) fn set(&self, status: ExecutionStatus) {
        self.0.store(status.to_u8(), Ordering::SeqCst);
    }

    pub(crate) fn get(&self) -> ExecutionStatus {
        ExecutionStatus::from_u8(self.0.load(Ordering::SeqCst))
    }
}

/// Caller's view of a submitted execution.
pub struct ExecutionHandle {
    execution_id: String,
    language: String,
    status: StatusCell,
    cancel: CancelToken,
    rx: Receiver<ExecutionResult>,
    result: OnceLock<ExecutionResult>,
}

impl ExecutionHandle {
    pub(crate) fn new(
        execution_id: String,
        language: String,
        status: StatusCell,
        cancel: CancelToken,
        rx: Receiver<ExecutionResult>,
    ) -> Self {
        Self {
            execution_id,
            language,
            status,
            cancel,
            rx,
            result: OnceLock::new(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Pending, running, or the terminal status once the result exists
    pub fn status(&self) -> ExecutionStatus {
        self.status.get()
    }

    /// Ask the execution to stop. The process group is torn down and the
    /// result reports `cancelled`, unless it had already finished.
    pub fn cancel(&self) {
        if !self.status.get().is_terminal() {
            log::info!("Cancellation requested for {}", self.execution_id);
        }
        self.cancel.cancel();
    }

    /// Block until the result is available
    pub fn wait(self) -> ExecutionResult {
        if let Some(result) = self.result.into_inner() {
            return result;
        }
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => lost_worker(&self.execution_id, &self.language, &self.status),
        }
    }

    /// The result, if it arrives within `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExecutionResult> {
        if let Some(result) = self.result.get() {
            return Some(result.clone());
        }
        let result = match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => {
                lost_worker(&self.execution_id, &self.language, &self.status)
            }
        };
        Some(self.result.get_or_init(|| result).clone())
    }
}

fn lost_worker(execution_id: &str, language: &str, status: &StatusCell) -> ExecutionResult {
    log::error!("Execution worker for {} exited without a result", execution_id);
    status.set(ExecutionStatus::Error);
    ResultBuilder::new(execution_id, language, chrono::Utc::now())
        .outcome(ExecutionStatus::Error, Some(ErrorKind::InternalError))
        .message("execution worker exited without a result")
        .finish(Duration::ZERO)
}
