//! TestOps Copilot Databases Module
//!
//! The storage side of the pipeline: the SQLite store holding all
//! persisted entities, the per-request progress bus, and the job queue
//! the workers drain.

pub mod events;
pub mod queue;
pub mod sqlite;

pub use events::{ProgressBus, ProgressEvent};
pub use queue::JobQueue;
pub use sqlite::{SqliteStore, TestCasePage};
