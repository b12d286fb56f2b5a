mod models;
mod routes;
pub mod store;

pub use models::{
    evaluate_decisions, match_policy, ApprovalDecision, ApprovalPolicy, ApprovalRequest,
    ApprovalRequestDetail, ApprovalStatus, CancelBody, DecisionBody, DecisionResult,
    NewApprovalRequest, PolicyGate, PolicySelector, TransitionSelector, Verdict,
};
pub use routes::routes;
