pub mod atomic;
pub mod status_store;
pub mod verify_cache;

pub use status_store::StatusStore;
pub use verify_cache::VerifyCache;
