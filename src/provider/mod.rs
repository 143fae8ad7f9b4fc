//! Provider side: pull microtasks, run them, fold results back into jobs.

pub mod aggregator;
pub mod dispatcher;
pub mod session;
pub mod slots;
pub mod watchers;

pub use aggregator::{Acceptance, apply_result, canonical_key};
pub use dispatcher::{Assignment, Dispatcher, TickOutcome, TimeoutOutcome};
pub use session::{Session, SessionStats};
pub use slots::{SlotTable, TaskRef};
