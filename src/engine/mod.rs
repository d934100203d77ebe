//! Event loop — the single-writer serialization point.

pub mod event;
pub mod event_loop;
pub mod snapshot;

pub use event::{EngineEvent, EngineNotice};
pub use event_loop::{DispatchHandle, Engine};
pub use snapshot::EngineSnapshot;
