use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

use crate::clip::{DualEncoder, l2_normalize};
use crate::error::PipelineError;

pub const REAL_PROMPT: &str = "a real photograph";
pub const AI_PROMPT: &str = "an AI-generated image";

/// Class prompts in canonical order: index 0 real, index 1 AI-generated.
pub const CLASS_PROMPTS: [&str; 2] = [REAL_PROMPT, AI_PROMPT];

const HEAD_EMBED_DIM: usize = 512; // ViT-B/32 projection width

/// Verdict over the two canonical classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassLabel {
    RealPhotograph,
    AiGenerated,
}

impl ClassLabel {
    pub fn prompt(&self) -> &'static str {
        match self {
            ClassLabel::RealPhotograph => REAL_PROMPT,
            ClassLabel::AiGenerated => AI_PROMPT,
        }
    }

    pub fn canonical_index(&self) -> usize {
        match self {
            ClassLabel::RealPhotograph => 0,
            ClassLabel::AiGenerated => 1,
        }
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassLabel::RealPhotograph => write!(f, "real photograph"),
            ClassLabel::AiGenerated => write!(f, "AI-generated image"),
        }
    }
}

/// Which path produced the final probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    ZeroShot,
    FineTunedHead,
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionSource::ZeroShot => write!(f, "zero-shot"),
            DecisionSource::FineTunedHead => write!(f, "fine-tuned head"),
        }
    }
}

/// Immutable classification outcome. `probabilities` is in canonical class
/// order and sums to 1.
#[derive(Debug, Clone)]
pub struct Classification {
    pub label: ClassLabel,
    pub probability: f32,
    pub probabilities: [f32; 2],
    pub source: DecisionSource,
}

impl Classification {
    /// Argmax over canonical probabilities; ties resolve to the real class,
    /// matching argmax-first semantics.
    pub fn from_canonical(probabilities: [f32; 2], source: DecisionSource) -> Self {
        let label = if probabilities[1] > probabilities[0] {
            ClassLabel::AiGenerated
        } else {
            ClassLabel::RealPhotograph
        };
        Self {
            label,
            probability: probabilities[label.canonical_index()],
            probabilities,
            source,
        }
    }

    pub fn prompt_probabilities(&self) -> [(&'static str, f32); 2] {
        [
            (REAL_PROMPT, self.probabilities[0]),
            (AI_PROMPT, self.probabilities[1]),
        ]
    }
}

/// Optional 2-class linear head fine-tuned over the image embedding.
pub struct FineTunedHead {
    linear: Linear,
}

impl FineTunedHead {
    /// Loads `weight` (2, 512) and `bias` (2) from a safetensors file.
    pub fn load(path: &Path, device: &Device) -> Result<Self, PipelineError> {
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device) }
            .map_err(PipelineError::model_load)?;
        let weight = vb
            .get((2, HEAD_EMBED_DIM), "weight")
            .map_err(PipelineError::model_load)?;
        let bias = vb.get(2, "bias").map_err(PipelineError::model_load)?;
        log::info!("fine-tuned head loaded from {}", path.display());
        Ok(Self {
            linear: Linear::new(weight, Some(bias)),
        })
    }

    /// Canonical-order probabilities for one embedding row.
    fn probabilities(&self, image_features: &Tensor) -> candle_core::Result<[f32; 2]> {
        let normalized = l2_normalize(image_features)?;
        let logits = self.linear.forward(&normalized)?;
        let probs: Vec<f32> = candle_nn::ops::softmax(&logits, 1)?
            .flatten_all()?
            .to_vec1()?;
        if probs.len() != 2 {
            candle_core::bail!("head produced {} probabilities, expected 2", probs.len());
        }
        Ok(head_to_canonical([probs[0], probs[1]]))
    }
}

/// The head checkpoint was trained with class order [AI-generated, real],
/// the reverse of the canonical prompt order.
fn head_to_canonical(head: [f32; 2]) -> [f32; 2] {
    [head[1], head[0]]
}

/// Classifies preprocessed pixels against the canonical class prompts.
/// When a fine-tuned head is present its probabilities supersede zero-shot.
pub fn classify(
    encoder: &dyn DualEncoder,
    pixel_values: &Tensor,
    class_text_features: &Tensor,
    head: Option<&FineTunedHead>,
) -> Result<Classification, PipelineError> {
    let image_features = encoder.encode_image(pixel_values)?;

    let (probabilities, source) = match head {
        Some(head) => {
            let probs = head
                .probabilities(&image_features)
                .map_err(|err| PipelineError::inference("fine-tuned head", err))?;
            (probs, DecisionSource::FineTunedHead)
        }
        None => {
            let logits = encoder.similarity_logits(&image_features, class_text_features)?;
            let probs: Vec<f32> = candle_nn::ops::softmax(&logits, 1)
                .and_then(|p| p.flatten_all()?.to_vec1())
                .map_err(|err| PipelineError::inference("zero-shot softmax", err))?;
            if probs.len() != 2 {
                return Err(PipelineError::Inference {
                    stage: "zero-shot softmax",
                    detail: format!("expected 2 probabilities, got {}", probs.len()),
                });
            }
            ([probs[0], probs[1]], DecisionSource::ZeroShot)
        }
    };

    let classification = Classification::from_canonical(probabilities, source);
    log::info!(
        "classified as {} at {:.1}% ({:?})",
        classification.label,
        classification.probability * 100.0,
        classification.source
    );
    Ok(classification)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_order_is_remapped_to_canonical() {
        // 0.9 AI-generated, 0.1 real in head order
        let canonical = head_to_canonical([0.9, 0.1]);
        assert_eq!(canonical, [0.1, 0.9]);
        let classification =
            Classification::from_canonical(canonical, DecisionSource::FineTunedHead);
        assert_eq!(classification.label, ClassLabel::AiGenerated);
        assert!((classification.probability - 0.9).abs() < 1e-6);
    }

    #[test]
    fn argmax_picks_the_larger_class() {
        let real = Classification::from_canonical([0.8, 0.2], DecisionSource::ZeroShot);
        assert_eq!(real.label, ClassLabel::RealPhotograph);
        assert!((real.probability - 0.8).abs() < 1e-6);

        let ai = Classification::from_canonical([0.3, 0.7], DecisionSource::ZeroShot);
        assert_eq!(ai.label, ClassLabel::AiGenerated);
        let total: f32 = ai.probabilities.iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn exact_tie_resolves_to_real() {
        let tied = Classification::from_canonical([0.5, 0.5], DecisionSource::ZeroShot);
        assert_eq!(tied.label, ClassLabel::RealPhotograph);
    }

    #[test]
    fn head_probabilities_flow_through_linear() {
        let device = Device::Cpu;
        // Diagonal weight keeps the picture simple: unit embedding along
        // dim 0 drives the head's first (AI-generated) logit.
        let weight = Tensor::from_vec(vec![5.0f32, 0.0, 0.0, 5.0], (2, 2), &device).expect("w");
        let bias = Tensor::from_vec(vec![0.0f32, 0.0], (2,), &device).expect("b");
        let head = FineTunedHead {
            linear: Linear::new(weight, Some(bias)),
        };

        let embedding = Tensor::from_vec(vec![2.0f32, 0.0], (1, 2), &device).expect("e");
        let canonical = head.probabilities(&embedding).expect("probs");

        // Head order [AI, real] flips, so the AI slot is canonical index 1.
        assert!(canonical[1] > 0.9);
        assert!((canonical[0] + canonical[1] - 1.0).abs() < 1e-5);
    }
}
