//! The local decision-maker that turns proposals into votes
//!
//! How an instance judges a proposal is its own business; consensus only
//! needs a verdict. Failures, panics and timeouts of the evaluator never
//! propagate: they become an abstention carrying the error as rationale.

use async_trait::async_trait;
use federation_core::{Decision, Proposal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Evaluation errors
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("evaluator failed: {0}")]
    Failed(String),
    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),
    #[error("evaluator panicked")]
    Panicked,
    #[error("evaluation cancelled")]
    Cancelled,
}

/// A decision plus its explanation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    pub rationale: String,
}

impl Verdict {
    pub fn new(decision: Decision, rationale: impl Into<String>) -> Self {
        Self {
            decision,
            rationale: rationale.into(),
        }
    }

    pub fn approve(rationale: impl Into<String>) -> Self {
        Self::new(Decision::Approve, rationale)
    }

    pub fn reject(rationale: impl Into<String>) -> Self {
        Self::new(Decision::Reject, rationale)
    }

    pub fn abstain(rationale: impl Into<String>) -> Self {
        Self::new(Decision::Abstain, rationale)
    }
}

/// Judges proposals on behalf of the local instance
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, proposal: &Proposal) -> Result<Verdict, EvaluationError>;
}

/// Answers every proposal with the same decision
#[derive(Debug, Clone)]
pub struct StaticEvaluator {
    decision: Decision,
}

impl StaticEvaluator {
    pub fn new(decision: Decision) -> Self {
        Self { decision }
    }
}

#[async_trait]
impl Evaluator for StaticEvaluator {
    async fn evaluate(&self, proposal: &Proposal) -> Result<Verdict, EvaluationError> {
        Ok(Verdict::new(
            self.decision,
            format!("standing decision for {}", proposal.kind),
        ))
    }
}

/// Adapts a synchronous closure into an [`Evaluator`]
pub struct FnEvaluator<F> {
    f: F,
}

impl<F> FnEvaluator<F>
where
    F: Fn(&Proposal) -> Result<Verdict, EvaluationError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Evaluator for FnEvaluator<F>
where
    F: Fn(&Proposal) -> Result<Verdict, EvaluationError> + Send + Sync,
{
    async fn evaluate(&self, proposal: &Proposal) -> Result<Verdict, EvaluationError> {
        (self.f)(proposal)
    }
}

/// Run an evaluator in its own task under a deadline.
///
/// A panic or timeout is reported as an error rather than tearing down the caller.
pub async fn evaluate_guarded(
    evaluator: Arc<dyn Evaluator>,
    proposal: Proposal,
    timeout: Duration,
) -> Result<Verdict, EvaluationError> {
    let mut task = tokio::spawn(async move { evaluator.evaluate(&proposal).await });
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) if e.is_panic() => Err(EvaluationError::Panicked),
        Ok(Err(_)) => Err(EvaluationError::Cancelled),
        Err(_) => {
            task.abort();
            Err(EvaluationError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use federation_core::{InstanceId, ProposalId};

    fn proposal() -> Proposal {
        Proposal {
            proposal_id: ProposalId([1; 32]),
            author: InstanceId([2; 32]),
            kind: "PATTERN".into(),
            body: vec![],
            created_at: 0,
            deadline: 1,
            signature: vec![],
        }
    }

    struct Slow;

    #[async_trait]
    impl Evaluator for Slow {
        async fn evaluate(&self, _proposal: &Proposal) -> Result<Verdict, EvaluationError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Verdict::approve("eventually"))
        }
    }

    #[tokio::test]
    async fn test_static_evaluator() {
        let verdict = evaluate_guarded(
            Arc::new(StaticEvaluator::new(Decision::Reject)),
            proposal(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(verdict.decision, Decision::Reject);
    }

    #[tokio::test]
    async fn test_errors_are_returned() {
        let evaluator = FnEvaluator::new(|_: &Proposal| Err(EvaluationError::Failed("no model".into())));
        let result = evaluate_guarded(Arc::new(evaluator), proposal(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(EvaluationError::Failed(reason)) if reason == "no model"));
    }

    #[tokio::test]
    async fn test_panics_are_contained() {
        let evaluator = FnEvaluator::new(|_: &Proposal| -> Result<Verdict, EvaluationError> {
            panic!("evaluator bug")
        });
        let result = evaluate_guarded(Arc::new(evaluator), proposal(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(EvaluationError::Panicked)));
    }

    #[tokio::test]
    async fn test_slow_evaluator_times_out() {
        let result = evaluate_guarded(Arc::new(Slow), proposal(), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(EvaluationError::Timeout(_))));
    }
}
