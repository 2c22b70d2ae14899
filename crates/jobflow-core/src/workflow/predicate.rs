//! Branch predicate evaluation over run data.
//!
//! Evaluation is pure and deterministic. A predicate reading a missing path
//! fails with `MissingField` rather than evaluating to false; `is_present`
//! is the way to test for presence.

use jobflow_types::run_data::{RunData, RunDataError};
use jobflow_types::workflow::{Choice, Predicate};
use serde_json::Value;

use super::expression::{ExpressionError, WorkflowEvaluator, value_as_f64};

#[derive(Debug, thiserror::Error)]
pub enum PredicateError {
    #[error(transparent)]
    MissingField(#[from] RunDataError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Evaluate one predicate against run data.
pub fn evaluate(
    predicate: &Predicate,
    data: &RunData,
    evaluator: &WorkflowEvaluator,
) -> Result<bool, PredicateError> {
    let result = match predicate {
        Predicate::StringEquals { path, value } => {
            matches!(data.get(path)?, Value::String(s) if s == value)
        }
        Predicate::NumericEquals { path, value } => numeric(data, path, |n| n == *value)?,
        Predicate::NumericLessThan { path, value } => numeric(data, path, |n| n < *value)?,
        Predicate::NumericLessThanEquals { path, value } => numeric(data, path, |n| n <= *value)?,
        Predicate::NumericGreaterThan { path, value } => numeric(data, path, |n| n > *value)?,
        Predicate::NumericGreaterThanEquals { path, value } => {
            numeric(data, path, |n| n >= *value)?
        }
        Predicate::BooleanEquals { path, value } => match data.get(path)? {
            Value::Bool(b) => b == value,
            Value::String(s) => s.parse::<bool>().is_ok_and(|b| b == *value),
            _ => false,
        },
        Predicate::IsPresent { path, present } => data.contains(path) == *present,
        Predicate::And { all } => {
            for p in all {
                if !evaluate(p, data, evaluator)? {
                    return Ok(false);
                }
            }
            true
        }
        Predicate::Or { any } => {
            for p in any {
                if evaluate(p, data, evaluator)? {
                    return Ok(true);
                }
            }
            false
        }
        Predicate::Not { predicate } => !evaluate(predicate, data, evaluator)?,
        Predicate::Expression { expr } => evaluator.evaluate_bool(expr, data.as_value())?,
    };
    Ok(result)
}

/// A value that is neither a number nor a numeric string never matches.
fn numeric(data: &RunData, path: &str, cmp: impl Fn(f64) -> bool) -> Result<bool, PredicateError> {
    Ok(value_as_f64(data.get(path)?).is_some_and(cmp))
}

/// Pick the successor for a branch: the first matching choice in
/// declaration order, else `default`.
///
/// Returns `None` only when nothing matches and no default exists, which
/// validation rules out for loaded definitions.
pub fn resolve_branch<'a>(
    choices: &'a [Choice],
    default: Option<&'a str>,
    data: &RunData,
    evaluator: &WorkflowEvaluator,
) -> Result<Option<&'a str>, PredicateError> {
    for choice in choices {
        if evaluate(&choice.when, data, evaluator)? {
            return Ok(Some(choice.next.as_str()));
        }
    }
    Ok(default)
}
