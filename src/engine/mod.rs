//! Core engine: the lock → unlock → repay → borrow cycle loop.

pub mod clock;
pub mod collateral;
pub mod events;
pub mod fallback;
pub mod governor;
pub mod operations;
pub mod orchestrator;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{CycleEvent, EventSink, RecordingSink, StopReason, TracingSink};
pub use orchestrator::{CycleOrchestrator, RunSummary};
