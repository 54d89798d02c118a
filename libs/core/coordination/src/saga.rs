//! Multi-store operations made atomic in effect by compensation.
//!
//! A [`Saga`] runs its steps strictly in the order they were added. When a
//! forward action fails, every step that already completed is compensated in
//! reverse order and the failing step itself is left alone. A compensation
//! that fails does not stop the others; all such failures are collected and
//! returned as [`SagaError::CompensationFailed`], because they mean the
//! stores disagree and someone has to look.
//!
//! `execute` moves the saga onto its own tokio task, so a caller that stops
//! waiting (client disconnect, timeout) cannot abandon a step halfway. An
//! optional cancellation signal is honoured only between steps.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::CoordinationMetrics;

/// Failure of a forward or compensating action
pub type StepError = Box<dyn std::error::Error + Send + Sync>;

/// One unit of a saga. Implementors hold their own inputs, so compensation
/// never depends on state captured elsewhere.
#[async_trait]
pub trait SagaStep: Send {
    fn id(&self) -> &str;

    async fn forward(&mut self) -> Result<(), StepError>;

    /// Undo the effect of a completed `forward`.
    async fn compensate(&mut self) -> Result<(), StepError>;
}

type Action = Box<dyn FnMut() -> BoxFuture<'static, Result<(), StepError>> + Send>;

/// A step assembled from two closures.
pub struct FnStep {
    id: String,
    forward: Action,
    compensate: Action,
}

impl FnStep {
    pub fn new<F, FFut, C, CFut>(id: impl Into<String>, mut forward: F, mut compensate: C) -> Self
    where
        F: FnMut() -> FFut + Send + 'static,
        FFut: Future<Output = Result<(), StepError>> + Send + 'static,
        C: FnMut() -> CFut + Send + 'static,
        CFut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            forward: Box::new(move || forward().boxed()),
            compensate: Box::new(move || compensate().boxed()),
        }
    }
}

#[async_trait]
impl SagaStep for FnStep {
    fn id(&self) -> &str {
        &self.id
    }

    async fn forward(&mut self) -> Result<(), StepError> {
        (self.forward)().await
    }

    async fn compensate(&mut self) -> Result<(), StepError> {
        (self.compensate)().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Done,
    Compensated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    Running,
    Committed,
    Compensating,
    Compensated,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub id: String,
    /// A step whose compensation failed stays `Done`: its effect remains.
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompensationFailure {
    pub step_id: String,
    pub error: String,
}

/// Final outcome of one execution, step by step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SagaReport {
    pub saga_id: Uuid,
    pub name: String,
    pub state: SagaState,
    /// In addition order
    pub steps: Vec<StepReport>,
    pub compensation_failures: Vec<CompensationFailure>,
}

impl SagaReport {
    pub fn step(&self, id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Error)]
pub enum SagaError {
    /// A forward action failed and every completed step was compensated
    #[error("saga '{}' step '{step_id}' failed: {cause}", .report.name)]
    StepFailed {
        step_id: String,
        #[source]
        cause: StepError,
        report: SagaReport,
    },

    /// Cancelled between steps; completed steps were compensated
    #[error("saga '{}' cancelled before step '{next_step}'", .report.name)]
    Cancelled { next_step: String, report: SagaReport },

    /// At least one compensation failed; the stores are inconsistent
    #[error("saga '{}' left inconsistent after {trigger}: {} compensation(s) failed", .report.name, .failures.len())]
    CompensationFailed {
        trigger: String,
        failures: Vec<CompensationFailure>,
        report: SagaReport,
    },

    /// The saga task itself died (runtime shutdown)
    #[error("saga {saga_id} aborted: {reason}")]
    Aborted { saga_id: Uuid, reason: String },
}

impl SagaError {
    /// Whether a compensation failed and cross-store state needs repair.
    pub fn is_inconsistent(&self) -> bool {
        matches!(self, SagaError::CompensationFailed { .. })
    }

    pub fn report(&self) -> Option<&SagaReport> {
        match self {
            SagaError::StepFailed { report, .. }
            | SagaError::Cancelled { report, .. }
            | SagaError::CompensationFailed { report, .. } => Some(report),
            SagaError::Aborted { .. } => None,
        }
    }
}

struct Entry {
    step: Box<dyn SagaStep>,
    status: StepStatus,
}

/// Ordered plan of steps, executed once.
///
/// # Example
/// ```ignore
/// let mut saga = Saga::new("index_news");
/// saga.add(InsertNewsRow::new(db.clone(), item.clone()))
///     .add(UpsertVectors::new(index.clone(), item.id, embedding));
/// let report = saga.execute().await?;
/// ```
pub struct Saga {
    id: Uuid,
    name: String,
    steps: Vec<Entry>,
    cancel: Option<watch::Receiver<bool>>,
    state: SagaState,
}

impl Saga {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            steps: Vec::new(),
            cancel: None,
            state: SagaState::Running,
        }
    }

    /// Stop before the next step once the signal reads `true`.
    pub fn with_cancellation(mut self, signal: watch::Receiver<bool>) -> Self {
        self.cancel = Some(signal);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Append a step. Ids are used for reporting and should be unique.
    pub fn add(&mut self, step: impl SagaStep + 'static) -> &mut Self {
        self.steps.push(Entry {
            step: Box::new(step),
            status: StepStatus::Pending,
        });
        self
    }

    /// Append a step built from a forward and a compensating closure.
    pub fn add_step<F, FFut, C, CFut>(
        &mut self,
        id: impl Into<String>,
        forward: F,
        compensate: C,
    ) -> &mut Self
    where
        F: FnMut() -> FFut + Send + 'static,
        FFut: Future<Output = Result<(), StepError>> + Send + 'static,
        C: FnMut() -> CFut + Send + 'static,
        CFut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.add(FnStep::new(id, forward, compensate))
    }

    /// Run every step, compensating on the first failure.
    pub async fn execute(self) -> Result<SagaReport, SagaError> {
        let saga_id = self.id;
        match tokio::spawn(self.run()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(%saga_id, error = %e, "Saga task aborted");
                Err(SagaError::Aborted {
                    saga_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn run(mut self) -> Result<SagaReport, SagaError> {
        let started = Instant::now();
        info!(saga_id = %self.id, saga = %self.name, steps = self.steps.len(), "Saga started");

        for index in 0..self.steps.len() {
            let step_id = self.steps[index].step.id().to_string();

            if self.is_cancelled() {
                warn!(saga_id = %self.id, next_step = %step_id, "Saga cancelled, compensating");
                let failures = self.compensate_before(index).await;
                let outcome = self.conclude(failures, format!("cancellation before '{step_id}'"), |report| {
                    SagaError::Cancelled {
                        next_step: step_id,
                        report,
                    }
                });
                self.record(started);
                return outcome;
            }

            debug!(saga_id = %self.id, step = %step_id, "Running forward action");
            let outcome = guarded(self.steps[index].step.forward()).await;
            match outcome {
                Ok(()) => self.steps[index].status = StepStatus::Done,
                Err(cause) => {
                    self.steps[index].status = StepStatus::Failed;
                    warn!(
                        saga_id = %self.id,
                        step = %step_id,
                        error = %cause,
                        "Saga step failed, compensating"
                    );

                    let failures = self.compensate_before(index).await;
                    let trigger = format!("step '{step_id}' failed: {cause}");
                    let outcome = self.conclude(failures, trigger, |report| SagaError::StepFailed {
                        step_id,
                        cause,
                        report,
                    });
                    self.record(started);
                    return outcome;
                }
            }
        }

        self.state = SagaState::Committed;
        info!(saga_id = %self.id, saga = %self.name, "Saga committed");
        self.record(started);
        Ok(self.report(Vec::new()))
    }

    /// Compensate completed steps before `index`, newest first.
    async fn compensate_before(&mut self, index: usize) -> Vec<CompensationFailure> {
        self.state = SagaState::Compensating;
        let mut failures = Vec::new();

        for entry in self.steps[..index].iter_mut().rev() {
            if entry.status != StepStatus::Done {
                continue;
            }

            let step_id = entry.step.id().to_string();
            let outcome = guarded(entry.step.compensate()).await;
            match outcome {
                Ok(()) => {
                    entry.status = StepStatus::Compensated;
                    debug!(saga_id = %self.id, step = %step_id, "Step compensated");
                }
                Err(e) => {
                    error!(
                        saga_id = %self.id,
                        saga = %self.name,
                        step = %step_id,
                        error = %e,
                        "Compensation failed, manual repair required"
                    );
                    CoordinationMetrics::compensation_failed(&self.name, &step_id);
                    failures.push(CompensationFailure {
                        step_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        failures
    }

    /// Settle the final state; compensation failures outrank the trigger.
    fn conclude(
        &mut self,
        failures: Vec<CompensationFailure>,
        trigger: String,
        clean: impl FnOnce(SagaReport) -> SagaError,
    ) -> Result<SagaReport, SagaError> {
        if failures.is_empty() {
            self.state = SagaState::Compensated;
            info!(saga_id = %self.id, saga = %self.name, "Saga compensated");
            Err(clean(self.report(Vec::new())))
        } else {
            self.state = SagaState::Failed;
            Err(SagaError::CompensationFailed {
                trigger,
                report: self.report(failures.clone()),
                failures,
            })
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|signal| *signal.borrow())
    }

    fn report(&self, compensation_failures: Vec<CompensationFailure>) -> SagaReport {
        SagaReport {
            saga_id: self.id,
            name: self.name.clone(),
            state: self.state,
            steps: self
                .steps
                .iter()
                .map(|entry| StepReport {
                    id: entry.step.id().to_string(),
                    status: entry.status,
                })
                .collect(),
            compensation_failures,
        }
    }

    fn record(&self, started: Instant) {
        CoordinationMetrics::saga_finished(&self.name, self.state.as_ref(), started.elapsed());
    }
}

/// Turn a panicking action into an ordinary step failure.
async fn guarded<F>(action: F) -> Result<(), StepError>
where
    F: Future<Output = Result<(), StepError>>,
{
    match AssertUnwindSafe(action).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("action panicked: {message}").into())
        }
    }
}
