//! Jobs, their microtasks, and the requester operations on them.

pub mod model;
pub mod requester;
pub mod splitter;

pub use model::{
    FinalResult, Job, JobInput, JobStatus, Microtask, MicrotaskStatus, Response, TaskPayload,
};
pub use requester::{JobBoard, NewJob, Progress, detect_input, progress};
