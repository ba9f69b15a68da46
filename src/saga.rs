//! Compensation chain for multi-step remote sequences.
//!
//! Each forward step that allocates a cloud resource registers a labelled
//! compensating action. On failure the chain unwinds in reverse order; each
//! compensating action is best-effort, and failures are collected so the
//! original error can be surfaced with a rollback note instead of being
//! masked by a secondary error.

use std::future::Future;
use std::pin::Pin;

use crate::error::Ec2Error;
use crate::progress::ProgressSink;

/// Future produced by a compensating action.
pub type CompensationFuture = Pin<Box<dyn Future<Output = Result<(), Ec2Error>> + Send>>;

type CompensationFn = Box<dyn FnOnce() -> CompensationFuture + Send>;

struct Compensation {
    label: String,
    run: CompensationFn,
}

/// Ordered list of compensating actions for an in-flight sequence.
#[derive(Default)]
pub struct Saga {
    compensations: Vec<Compensation>,
}

impl Saga {
    /// Creates an empty compensation chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a compensating action for the step that just succeeded.
    /// Actions run in reverse registration order during [`Saga::unwind`].
    pub fn push<F>(&mut self, label: impl Into<String>, run: F)
    where
        F: FnOnce() -> CompensationFuture + Send + 'static,
    {
        self.compensations.push(Compensation {
            label: label.into(),
            run: Box::new(run),
        });
    }

    /// Runs every registered compensating action in reverse order, returning
    /// the label and error of each one that failed.
    pub async fn unwind(self, sink: &dyn ProgressSink) -> Vec<(String, Ec2Error)> {
        let mut failures = Vec::new();
        for compensation in self.compensations.into_iter().rev() {
            sink.log(&format!("Rolling back: {}", compensation.label));
            if let Err(err) = (compensation.run)().await {
                sink.log(&format!(
                    "Rollback step '{}' failed: {err}",
                    compensation.label
                ));
                failures.push((compensation.label, err));
            }
        }
        failures
    }

    /// Number of compensating actions currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.compensations.len()
    }

    /// Returns `true` when no compensating actions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.compensations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::progress::NullSink;

    fn recording_step(
        order: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
        outcome: Result<(), Ec2Error>,
    ) -> impl FnOnce() -> CompensationFuture + Send + 'static {
        let order = Arc::clone(order);
        move || {
            Box::pin(async move {
                order.lock().expect("order lock").push(name);
                outcome
            })
        }
    }

    #[tokio::test]
    async fn unwinds_in_reverse_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut saga = Saga::new();
        saga.push("first", recording_step(&order, "first", Ok(())));
        saga.push("second", recording_step(&order, "second", Ok(())));
        saga.push("third", recording_step(&order, "third", Ok(())));

        let failures = saga.unwind(&NullSink).await;

        assert!(failures.is_empty());
        assert_eq!(
            *order.lock().expect("order lock"),
            vec!["third", "second", "first"]
        );
    }

    #[tokio::test]
    async fn collects_failures_without_stopping() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut saga = Saga::new();
        saga.push("first", recording_step(&order, "first", Ok(())));
        saga.push(
            "second",
            recording_step(
                &order,
                "second",
                Err(Ec2Error::InvalidArgument(String::from("boom"))),
            ),
        );

        let failures = saga.unwind(&NullSink).await;

        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures.first().map(|(label, _)| label.as_str()),
            Some("second")
        );
        assert_eq!(
            *order.lock().expect("order lock"),
            vec!["second", "first"],
            "a failed step must not stop the chain"
        );
    }

    #[tokio::test]
    async fn rollback_note_preserves_root_cause() {
        let original = Ec2Error::InvalidArgument(String::from("launch refused"));
        let annotated = original.clone().with_rollback_failures(vec![(
            String::from("delete security group"),
            Ec2Error::Timeout {
                action: String::from("delete security group"),
            },
        )]);

        assert!(matches!(annotated, Ec2Error::RollbackFailed { .. }));
        assert_eq!(annotated.root_cause(), &original);
    }
}
