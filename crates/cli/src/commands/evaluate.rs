use std::fs;
use std::path::Path;

use anyhow::Context;
use expensa_core::workflow::{EvaluationRequest, FlowEvaluation};

use crate::commands::CommandResult;

pub fn run(path: &Path) -> CommandResult {
    match evaluate_file(path) {
        Ok(evaluation) => {
            let message = match evaluation.current_step {
                Some(step) => format!("expense is {} at step {step}", evaluation.status.as_str()),
                None => format!("expense is {}", evaluation.status.as_str()),
            };
            match serde_json::to_value(&evaluation) {
                Ok(data) => CommandResult::success_with_data("evaluate", message, Some(data)),
                Err(error) => CommandResult::failure("evaluate", "serialization", error.to_string(), 1),
            }
        }
        Err(error) => CommandResult::failure("evaluate", "invalid_input", format!("{error:#}"), 2),
    }
}

fn evaluate_file(path: &Path) -> anyhow::Result<FlowEvaluation> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("could not read evaluation input `{}`", path.display()))?;
    let request: EvaluationRequest = serde_json::from_str(&raw)
        .with_context(|| format!("`{}` is not a valid evaluation request", path.display()))?;
    Ok(request.evaluate())
}
