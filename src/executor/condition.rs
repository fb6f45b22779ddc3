//! Turns `Condition`s into booleans for `if` and `while`.
//!
//! Evaluation never fails: a missing screen, an unknown template or an unsupported probe
//! is logged and treated as `false`.

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::config::models::{CompareOp, Condition, ConditionKind};
use crate::executor::actions::ActionExecutor;
use crate::executor::context::ExecutionContext;

/// Evaluate `condition`. An absent condition is `true`.
pub async fn evaluate<E: ActionExecutor>(
    condition: Option<&Condition>,
    ctx: &mut ExecutionContext<E>,
) -> bool {
    let Some(condition) = condition else {
        return true;
    };
    match try_evaluate(condition, ctx).await {
        Ok(result) => {
            debug!(
                target: "macrobot::condition",
                kind = condition.kind_name(), result,
                "Condition evaluated"
            );
            result
        }
        Err(err) => {
            warn!(
                target: "macrobot::condition",
                kind = condition.kind_name(), error = %format!("{err:#}"),
                "Condition evaluation failed; treating as false"
            );
            false
        }
    }
}

async fn try_evaluate<E: ActionExecutor>(
    condition: &Condition,
    ctx: &mut ExecutionContext<E>,
) -> Result<bool> {
    let (executor, mut scope) = ctx.split();
    match &condition.kind {
        ConditionKind::ImageMatch(params) => {
            let frame = scope
                .screen
                .capture()
                .with_context(|| format!("{} screen capture failed", scope.screen.name()))?;
            let reading = executor
                .execute_image_match(params, &frame, &mut scope)
                .await?;
            debug!(
                target: "macrobot::condition",
                template = %params.template, score = reading.score, threshold = reading.threshold,
                found = reading.success,
                "Image condition measured"
            );
            let op = condition.operator.unwrap_or(CompareOp::Gte);
            let rhs = condition.value.unwrap_or(reading.threshold);
            Ok(op.apply(reading.score, rhs))
        }
        ConditionKind::SoundCheck(_) | ConditionKind::SystemInfo(_) => {
            let reading = executor.probe(condition, &mut scope).await?;
            match (condition.operator, condition.value) {
                (None, None) => Ok(reading.success),
                (op, Some(rhs)) => {
                    let lhs = reading
                        .value
                        .context("probe returned no value to compare")?;
                    Ok(reading.success && op.unwrap_or(CompareOp::Gte).apply(lhs, rhs))
                }
                (Some(_), None) => bail!("comparison operator given without a value"),
            }
        }
    }
}
