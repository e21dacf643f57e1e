//! Threading for the Conflux workspace.

pub mod pool;

pub use pool::{Job, JobSender, ThreadPool};
