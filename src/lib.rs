pub mod config;
pub mod enrich;
pub mod fanout;
pub mod pipeline;
pub mod sinks;
pub mod telemetry;

// Re-export specific items for convenient access
pub use config::WatcherConfig;
pub use pipeline::record::{Constraint, EnrichmentStatus, OomDecision, OomEvent, VictimTask};
pub use pipeline::watcher::OomWatcher;
