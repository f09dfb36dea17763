pub mod backend;
pub mod checker;
pub mod engine;
pub mod event_bus;
pub mod pipeline;
pub mod subprocess;
pub mod sync;
pub mod tracker;
