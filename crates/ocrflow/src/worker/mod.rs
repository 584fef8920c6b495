//! Bounded worker pool that performs OCR for leased queue entries.

pub mod executor;
pub mod job;
pub mod pool;
pub mod registry;

pub use executor::Worker;
pub use job::{JobOutcome, OcrJob};
pub use pool::{Dispatcher, WorkerPool};
pub use registry::CancelRegistry;
