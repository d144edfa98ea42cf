pub mod lifecycle;
pub mod security;
pub mod sweep;

pub use lifecycle::{ContainerCreateSpec, ContainerLifecycleManager, ExecOutcome, ResourceUsage};
