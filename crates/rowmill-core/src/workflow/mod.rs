//! Durable workflows.
//!
//! Two levels, both deterministic: all orchestration decisions happen on one
//! logical task per workflow, and everything non-deterministic (clocks, I/O,
//! randomness) lives in activities.
//!
//! ```text
//! JobWorkflow (one per job)
//!     │  analyze_file
//!     ▼
//! bounded scheduler ── spawns ──► ChunkWorkflow "{job}-chunk-0"
//!     │   active <= cap          ChunkWorkflow "{job}-chunk-1"
//!     │                          ...
//!     ◄── completion channel ────┘
//!     │  aggregate recomputation
//!     ▼
//! reprocess pass (optional) ─► finalize
//! ```
//!
//! Chunk workflows complete in arbitrary order; their results funnel through
//! the job workflow's completion channel, so aggregates are recomputed by a
//! single writer and queries never race an update.

mod chunk;
mod job;

pub use chunk::{chunk_workflow_id, ChunkHandle, ChunkWorkflow};
pub use job::{job_workflow_id, JobHandle, JobWorkflow};
