use std::fs;
use std::path::Path;

use candle_core::Tensor;

use crate::classifier::{ClassLabel, Classification};
use crate::clip::DualEncoder;
use crate::config::ProbeConfig;
use crate::error::PipelineError;

/// Neutral prompt appended to every probe batch. It soaks up probability
/// mass for clean images and is never reported.
pub const CONTROL_PROMPT: &str = "a high quality natural photograph";

/// Fallback vocabulary used when the concepts file is missing or unusable.
const BUILTIN_CONCEPTS: &[(&str, &str)] = &[
    ("deformed hands and fingers", "malformed hands"),
    ("extra fingers", "extra fingers"),
    ("fused fingers", "fused fingers"),
    ("asymmetric eyes", "asymmetric eyes"),
    ("too many teeth", "irregular teeth"),
    ("unnatural waxy skin", "waxy skin"),
    ("extra limbs", "extra limbs"),
    ("inconsistent shadows", "inconsistent shadows"),
    ("missing reflection in mirror", "missing reflection"),
    ("light source conflict", "conflicting light"),
    ("glass refraction error", "wrong refraction"),
    ("object merging with hand", "merged objects"),
    ("levitating objects", "floating objects"),
    ("impossible architecture", "impossible architecture"),
    ("warped straight lines", "warped lines"),
    ("stairs leading nowhere", "broken stairs"),
    ("animal with extra legs", "malformed animal"),
    ("repetitive texture tiling", "repeated texture"),
    ("gibberish text", "garbled text"),
    ("smudged textures", "smudged texture"),
    ("high frequency noise artifacts", "noise artifacts"),
    ("oversmoothed facial features", "oversmoothed face"),
];

/// Fallback focus anchors for the explanation prompt.
const BUILTIN_ANCHORS: &[(&str, &str)] = &[
    ("finger", "the hands and fingers"),
    ("hand", "the hands and fingers"),
    ("eye", "the eyes and their symmetry"),
    ("teeth", "the mouth and teeth"),
    ("skin", "skin texture and pores"),
    ("hair", "hair strands and their boundaries"),
    ("shadow", "shadow directions and contact points"),
    ("reflection", "reflections in mirrors, glass and water"),
    ("text", "any lettering or signage"),
    ("architecture", "building edges and perspective lines"),
    ("texture", "repeating or smeared texture patches"),
];

#[derive(Debug, Clone)]
pub struct Concept {
    pub phrase: String,
    pub label: String,
}

/// Describable generation defects probed against the image.
#[derive(Debug, Clone)]
pub struct ConceptVocabulary {
    concepts: Vec<Concept>,
}

impl ConceptVocabulary {
    /// Loads `phrase | label` lines. Unreadable or empty files fall back to
    /// the built-in list with a warning; this is never fatal.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let pairs = parse_pairs(&contents, path);
                if pairs.is_empty() {
                    log::warn!(
                        "vocabulary {} has no usable entries, using the built-in list",
                        path.display()
                    );
                    Self::builtin()
                } else {
                    log::info!("loaded {} concepts from {}", pairs.len(), path.display());
                    Self::from_pairs(pairs)
                }
            }
            Err(err) => {
                log::warn!(
                    "cannot read vocabulary {}: {err}, using the built-in list",
                    path.display()
                );
                Self::builtin()
            }
        }
    }

    pub fn builtin() -> Self {
        Self::from_pairs(
            BUILTIN_CONCEPTS
                .iter()
                .map(|(p, l)| (p.to_string(), l.to_string()))
                .collect(),
        )
    }

    fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let concepts = pairs
            .into_iter()
            .map(|(phrase, label)| Concept { phrase, label })
            .collect();
        Self { concepts }
    }

    pub fn concepts(&self) -> &[Concept] {
        &self.concepts
    }

    pub fn len(&self) -> usize {
        self.concepts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty()
    }
}

/// Substring-keyed hints telling the explanation model where to look.
#[derive(Debug, Clone)]
pub struct FocusAnchors {
    anchors: Vec<(String, String)>,
}

impl FocusAnchors {
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let pairs = parse_pairs(&contents, path);
                if pairs.is_empty() {
                    Self::builtin()
                } else {
                    Self { anchors: pairs }
                }
            }
            Err(err) => {
                log::warn!(
                    "cannot read anchors {}: {err}, using the built-in list",
                    path.display()
                );
                Self::builtin()
            }
        }
    }

    pub fn builtin() -> Self {
        Self {
            anchors: BUILTIN_ANCHORS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// First anchor whose key occurs in the phrase, case-insensitive.
    pub fn focus_for(&self, phrase: &str) -> Option<&str> {
        let phrase = phrase.to_lowercase();
        self.anchors
            .iter()
            .find(|(key, _)| phrase.contains(key.as_str()))
            .map(|(_, focus)| focus.as_str())
    }
}

fn parse_pairs(contents: &str, path: &Path) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('|') {
            Some((left, right)) if !left.trim().is_empty() && !right.trim().is_empty() => {
                pairs.push((left.trim().to_string(), right.trim().to_string()));
            }
            _ => log::warn!(
                "{}:{}: skipping malformed line",
                path.display(),
                number + 1
            ),
        }
    }
    pairs
}

/// One concept that fired, with its softmax share.
#[derive(Debug, Clone)]
pub struct ConceptScore {
    pub phrase: String,
    pub label: String,
    pub score: f32,
}

/// Concepts above the gate, strongest first. Empty is a valid outcome.
#[derive(Debug, Clone, Default)]
pub struct ConceptScores {
    scores: Vec<ConceptScore>,
}

impl ConceptScores {
    pub fn new(scores: Vec<ConceptScore>) -> Self {
        Self { scores }
    }

    pub fn scores(&self) -> &[ConceptScore] {
        &self.scores
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn top(&self, n: usize) -> &[ConceptScore] {
        &self.scores[..self.scores.len().min(n)]
    }
}

/// Gate for concept scores: strict when the image looks real, permissive
/// when it was called AI-generated.
fn gate_threshold(label: ClassLabel, config: &ProbeConfig) -> f32 {
    match label {
        ClassLabel::RealPhotograph => config.real_threshold,
        ClassLabel::AiGenerated => config.ai_threshold,
    }
}

fn gate_and_rank(raw: Vec<ConceptScore>, threshold: f32) -> Vec<ConceptScore> {
    let mut kept: Vec<ConceptScore> = raw
        .into_iter()
        .filter(|concept| concept.score > threshold)
        .collect();
    kept.sort_by(|a, b| b.score.total_cmp(&a.score));
    kept
}

/// Probes the vocabulary against the image. Advisory stage: any failure is
/// logged and reported as an empty result.
pub fn probe(
    encoder: &dyn DualEncoder,
    pixel_values: &Tensor,
    classification: &Classification,
    vocabulary: &ConceptVocabulary,
    config: &ProbeConfig,
) -> ConceptScores {
    match probe_inner(encoder, pixel_values, classification, vocabulary, config) {
        Ok(scores) => scores,
        Err(err) => {
            log::warn!("concept probe failed, continuing without concepts: {err}");
            ConceptScores::default()
        }
    }
}

fn probe_inner(
    encoder: &dyn DualEncoder,
    pixel_values: &Tensor,
    classification: &Classification,
    vocabulary: &ConceptVocabulary,
    config: &ProbeConfig,
) -> Result<ConceptScores, PipelineError> {
    let mut prompts: Vec<&str> = vocabulary
        .concepts()
        .iter()
        .map(|c| c.phrase.as_str())
        .collect();
    prompts.push(CONTROL_PROMPT);

    let text_features = encoder.encode_text(&prompts)?;
    let image_features = encoder.encode_image(pixel_values)?;
    let logits = encoder.similarity_logits(&image_features, &text_features)?;
    let probs: Vec<f32> = candle_nn::ops::softmax(&logits, 1)
        .and_then(|p| p.flatten_all()?.to_vec1())
        .map_err(|err| PipelineError::inference("concept softmax", err))?;

    // zip stops at the vocabulary length, dropping the control entry
    let raw: Vec<ConceptScore> = vocabulary
        .concepts()
        .iter()
        .zip(&probs)
        .map(|(concept, prob)| ConceptScore {
            phrase: concept.phrase.clone(),
            label: concept.label.clone(),
            score: *prob,
        })
        .collect();

    let threshold = gate_threshold(classification.label, config);
    let kept = gate_and_rank(raw, threshold);
    log::info!(
        "{} of {} concepts above the {threshold:.2} gate",
        kept.len(),
        vocabulary.len()
    );
    Ok(ConceptScores::new(kept))
}
