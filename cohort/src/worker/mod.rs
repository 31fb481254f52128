//! Worker side: the per-session handle table and the task service that
//! builds, uses and tears down handles.

mod registry;
mod service;

pub use registry::{Handle, WorkerRegistry};
pub use service::WorkerService;
