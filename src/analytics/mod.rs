pub mod queue;
pub mod worker;

pub use queue::{ClickEvent, ClickQueue, visitor_hash};
pub use worker::{FlushConfig, spawn_workers};
