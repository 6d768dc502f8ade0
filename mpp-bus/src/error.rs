//! Status and error taxonomy shared by every stage.
//!
//! Flow control and end of stream travel as [`StageStatus`]; everything that
//! stops the pipeline is a [`PipelineError`].

/// Numeric result codes reported by hardware codec adapters.
pub mod code {
    pub const OK: i32 = 0;
    pub const NOK: i32 = -1;
    pub const UNSUPPORTED: i32 = -2;
    pub const NO_MEMORY: i32 = -3;
    pub const NULL_PTR: i32 = -4;
    pub const TIMEOUT: i32 = -5;
}

/// Outcome of `send_frame` that is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Accepted,
    NeedMoreInput,
    NeedMoreOutputSpace,
    EndOfStream,
}

impl StageStatus {
    pub fn is_eos(&self) -> bool {
        matches!(self, StageStatus::EndOfStream)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("device error (code {code})")]
    Device { code: i32 },
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("invalid surface: {0}")]
    InvalidSurface(String),
    #[error("unknown failure (code {code})")]
    Unknown { code: i32 },
    #[error("hardware not ready after {retries} retries")]
    Timeout { retries: u32 },
    #[error("aborted")]
    Aborted,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<PipelineError>,
    },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Maps an adapter result code to the taxonomy. Non-negative codes are
    /// success and map to `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            c if c >= code::OK => None,
            code::NOK => Some(PipelineError::Unknown { code }),
            code::UNSUPPORTED => Some(PipelineError::Unsupported(format!("device code {}", code))),
            code::NO_MEMORY => Some(PipelineError::ResourceExhausted(format!(
                "device code {}",
                code
            ))),
            code::NULL_PTR => Some(PipelineError::InvalidSurface(format!("device code {}", code))),
            code::TIMEOUT => Some(PipelineError::Timeout { retries: 0 }),
            _ => Some(PipelineError::Device { code }),
        }
    }

    /// The underlying numeric code, for diagnostics.
    pub fn code(&self) -> i32 {
        match self {
            PipelineError::Unsupported(_) => code::UNSUPPORTED,
            PipelineError::Device { code } | PipelineError::Unknown { code } => *code,
            PipelineError::ResourceExhausted(_) => code::NO_MEMORY,
            PipelineError::InvalidSurface(_) => code::NULL_PTR,
            PipelineError::Timeout { .. } => code::TIMEOUT,
            PipelineError::Stage { source, .. } => source.code(),
            PipelineError::Aborted
            | PipelineError::InvalidState(_)
            | PipelineError::Config(_)
            | PipelineError::Io(_) => code::NOK,
        }
    }

    /// Tags the error with the stage it came from. Already tagged errors are
    /// left alone so the innermost stage name wins.
    pub fn in_stage(self, stage: &str) -> Self {
        match self {
            err @ PipelineError::Stage { .. } => err,
            err => PipelineError::Stage {
                stage: stage.to_string(),
                source: Box::new(err),
            },
        }
    }

    pub fn is_aborted(&self) -> bool {
        match self {
            PipelineError::Aborted => true,
            PipelineError::Stage { source, .. } => source.is_aborted(),
            _ => false,
        }
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod error_test;
