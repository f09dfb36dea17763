pub mod config;
pub mod convergence;
pub mod error;
pub mod event;
pub mod gate;
pub mod lifecycle;
pub mod prompt;
pub mod requirement;
pub mod status;
pub mod telemetry;
