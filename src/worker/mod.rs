//! Background processing: the verify and dispatch worker pools and the
//! periodic cleanup sweep.

pub mod cleanup;
mod pool;

pub use cleanup::{sweep, SweepReport};
pub use pool::{process, WorkerError, WorkerPool};
