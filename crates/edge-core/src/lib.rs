pub mod drain;
pub mod readiness;
pub mod signal;
pub mod telemetry;
pub mod version;
