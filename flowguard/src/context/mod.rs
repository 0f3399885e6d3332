//! Pipeline run context.

mod pipeline;

pub use pipeline::PipelineContext;
