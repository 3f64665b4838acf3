pub mod evaluator;
pub mod plan;
pub mod request;
pub mod states;

pub use evaluator::{awaiting, evaluate_flow, evaluate_step};
pub use plan::{excluding_submitter, plan_for_flow, plan_for_rule, with_manager_first, PlanError};
pub use request::{EvaluationRequest, VoteInput};
pub use states::{ApprovalPlan, FlowEvaluation, PlanStep, StepOutcome};
