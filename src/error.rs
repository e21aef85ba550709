use std::fmt;
use std::path::PathBuf;

/// Errors that can occur while loading models or running the analysis pipeline.
///
/// Stage policy: model loading, input decoding and classification are fatal;
/// saliency and concept probing degrade to partial results at the call site;
/// provider errors are consumed by the fallback chain.
#[derive(Debug)]
pub enum PipelineError {
    /// Model weights or tokenizer could not be fetched or loaded.
    ModelLoad(String),
    /// The input image could not be read or decoded.
    InvalidInput { path: PathBuf, detail: String },
    /// A forward or backward pass failed.
    Inference { stage: &'static str, detail: String },
    /// An explanation provider could not produce a narrative.
    Provider { provider: &'static str, detail: String },
    /// The configuration file or environment is unusable.
    Config(String),
    Io(std::io::Error),
}

impl PipelineError {
    /// Wraps a candle error with the pipeline stage it occurred in.
    pub fn inference(stage: &'static str, err: impl fmt::Display) -> Self {
        PipelineError::Inference {
            stage,
            detail: err.to_string(),
        }
    }

    /// Wraps a model acquisition or deserialization error.
    pub fn model_load(err: impl fmt::Display) -> Self {
        PipelineError::ModelLoad(err.to_string())
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::ModelLoad(detail) => write!(f, "model load failed: {detail}"),
            PipelineError::InvalidInput { path, detail } => {
                write!(f, "invalid input {}: {detail}", path.display())
            }
            PipelineError::Inference { stage, detail } => {
                write!(f, "inference failed during {stage}: {detail}")
            }
            PipelineError::Provider { provider, detail } => {
                write!(f, "provider {provider} failed: {detail}")
            }
            PipelineError::Config(detail) => write!(f, "configuration error: {detail}"),
            PipelineError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(value: std::io::Error) -> Self {
        PipelineError::Io(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_stage_context() {
        let err = PipelineError::inference("saliency backward", "shape mismatch");
        let text = err.to_string();
        assert!(text.contains("saliency backward"));
        assert!(text.contains("shape mismatch"));
    }

    #[test]
    fn display_includes_input_path() {
        let err = PipelineError::InvalidInput {
            path: PathBuf::from("/tmp/missing.png"),
            detail: "no such file".into(),
        };
        assert!(err.to_string().contains("/tmp/missing.png"));
    }
}
