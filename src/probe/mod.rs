pub mod buffers;
pub mod ceiling;
pub mod engine;
pub mod status;

#[cfg(test)]
pub mod fake;

pub use ceiling::compute_safe_ceiling;
pub use engine::{EngineConfig, ProbeEngine};
pub use status::{ProbeStatus, ProbeStatusCode};
