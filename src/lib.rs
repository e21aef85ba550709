//! Image authenticity analysis built on CLIP zero-shot classification.
//!
//! The pipeline classifies an image as a real photograph or an AI-generated
//! one, localizes the evidence with input-gradient saliency, sweeps a
//! vocabulary of known generation defects and asks a vision-language model
//! to narrate the findings. Every stage after classification degrades
//! gracefully, so partial evidence still produces a report.

pub mod classifier;
pub mod clip;
pub mod concepts;
pub mod config;
pub mod error;
pub mod evidence;
pub mod explain;
pub mod logging;
pub mod overlay;
pub mod pipeline;
pub mod report;
pub mod saliency;

pub use classifier::{ClassLabel, Classification, DecisionSource};
pub use clip::{ClipEncoder, DualEncoder};
pub use config::PipelineConfig;
pub use error::PipelineError;
pub use evidence::{Analysis, EvidenceBundle, Narrative};
pub use pipeline::Analyzer;
