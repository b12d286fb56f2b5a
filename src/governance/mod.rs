mod actions;
mod models;
mod routes;
pub mod store;

pub use actions::{execute_transition, ActionBody, ActionDispatcher, ActionResult};
pub use models::{
    apply_overlay, AssetRef, GovernanceOverlay, GovernanceRecord, GovernanceRecordList,
    GovernanceResponse, OverlayOutcome, DEFAULT_RISK_LEVEL,
};
pub use routes::routes;
