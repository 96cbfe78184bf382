// THEORY:
// This file is the entry point of the `arena_prep` library crate, the
// per-video preprocessing engine for behavioral-tracking footage.
//
// The public surface is the `PrepPipeline` facade (request/response calls for
// background estimation, segmentation and state edits) and the
// `DayGroupPropagator` for batch work across a day group. The leaf algorithms
// and the data model live in `core_modules` and are public for callers that
// need finer control, such as the runner binary or an embedding service.

pub mod core_modules;
pub mod day_group;
pub mod error;
pub mod job_pool;
pub mod pipeline;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{PrepError, Result};
