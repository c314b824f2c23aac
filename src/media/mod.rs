pub mod pipeline;

pub use pipeline::{MediaPipeline, PassthroughPipeline};
