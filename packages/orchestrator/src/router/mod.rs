pub mod matcher;
pub mod rules;

pub use rules::{JobRouter, RoutingDecisionResult};
