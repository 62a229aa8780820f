//! Activities: the externally-observable units of work.
//!
//! Workflows stay deterministic by pushing every clock read, I/O call, and
//! repository access into an activity. Activities are plain async methods;
//! retry and timeout semantics are applied by the caller through
//! [`crate::retry::run_with_retry`].

mod chunk;
mod file;

pub use chunk::ChunkActivities;
pub use file::FileActivities;
