//! Pipeline error types

use burn_sd_edit_samplers::ScheduleError;
use burn_sd_edit_unet::InterceptionError;
use thiserror::Error;

/// Invalid combination of arguments, raised before any computation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UsageError {
    #[error("`noise` and `seed` are mutually exclusive: the seed only generates noise when none is given")]
    NoiseAndSeed,

    #[error("prompt is too long: {tokens} tokens, at most {max} allowed")]
    PromptTooLong { tokens: usize, max: usize },

    #[error("unknown edit method '{0}', expected one of: replace, refine, reweight")]
    UnknownEditMethod(String),

    #[error("the reweight method requires non-empty edit weights")]
    MissingEditWeights,

    #[error("number of steps must be in [1, 1000), got {0}")]
    InvalidStepCount(usize),

    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    #[error("number of resamples must be at least 1")]
    InvalidResampleCount,

    #[error("edit weights must have one entry per token ({expected}), got {len}")]
    InvalidEditWeights { len: usize, expected: usize },

    #[error("'{0}' does not occur in the prompt")]
    WordNotInPrompt(String),

    #[error("{what} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// Error type for pipeline runs
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error("attention interception failed: {0}")]
    Interception(#[from] InterceptionError),

    #[error("noise schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("non-finite values in {name}: {stats}")]
    NonFinite { name: String, stats: String },

    #[error("component unavailable: {0}")]
    Component(String),

    #[error("could not read tensor data: {0}")]
    TensorData(String),

    #[error("cancelled after {completed} steps")]
    Cancelled { completed: usize },

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
