//! Field Dispatch — offer dispatch and acceptance engine for field workers.

pub mod arbiter;
pub mod assignment;
pub mod availability;
pub mod backend;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod location;
pub mod model;
pub mod reconcile;

pub use engine::{DispatchHandle, Engine, EngineNotice, EngineSnapshot};
pub use error::{Error, Result};
