pub mod dedup;
pub mod github_types;
pub mod http;
pub mod ingestor;
pub mod signature;

pub use ingestor::{compute_priority, IngestResult, WebhookIngestor, SUPPORTED_EVENT_TYPES};
