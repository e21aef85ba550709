use std::fs;
use std::path::Path;

pub mod local;
pub mod remote;

pub use local::LocalProvider;
pub use remote::RemoteProvider;

use crate::concepts::FocusAnchors;
use crate::error::PipelineError;
use crate::evidence::{EvidenceBundle, Narrative};

/// A model that can narrate the visual evidence.
pub trait ExplanationProvider: Send + Sync {
    /// Short identifier used in logs and reports.
    fn name(&self) -> &'static str;

    /// Produces a narrative for the prepared request.
    fn explain(&self, request: &ExplanationRequest) -> Result<String, PipelineError>;
}

/// Prepared provider input: the forensic prompt plus raw image bytes.
#[derive(Debug, Clone)]
pub struct ExplanationRequest {
    pub prompt: String,
    pub original: Vec<u8>,
    pub original_mime: &'static str,
    pub overlay_png: Option<Vec<u8>>,
}

/// Reads the image files and renders the prompt for the evidence bundle.
pub fn build_request(
    evidence: &EvidenceBundle,
    anchors: &FocusAnchors,
    top_n: usize,
) -> Result<ExplanationRequest, PipelineError> {
    let original = fs::read(&evidence.source)?;
    let overlay_png = match &evidence.overlay_path {
        Some(path) => Some(fs::read(path)?),
        None => None,
    };
    Ok(ExplanationRequest {
        prompt: build_prompt(evidence, anchors, top_n),
        original,
        original_mime: mime_for_path(&evidence.source),
        overlay_png,
    })
}

/// Tries providers in order and returns the first non-empty narrative,
/// tagged with the provider that produced it. `None` when every provider
/// fails; callers report partial results in that case.
pub fn narrate(
    providers: &[Box<dyn ExplanationProvider>],
    request: &ExplanationRequest,
) -> Option<Narrative> {
    for provider in providers {
        log::info!("requesting narrative from {}", provider.name());
        match provider.explain(request) {
            Ok(text) if !text.trim().is_empty() => {
                return Some(Narrative {
                    provider: provider.name(),
                    text,
                });
            }
            Ok(_) => log::warn!("{} returned an empty narrative", provider.name()),
            Err(err) => log::warn!("{} failed: {err}", provider.name()),
        }
    }
    log::warn!("all explanation providers failed, continuing without a narrative");
    None
}

fn build_prompt(evidence: &EvidenceBundle, anchors: &FocusAnchors, top_n: usize) -> String {
    let classification = &evidence.classification;
    let color = evidence.overlay_color;
    let mut prompt = String::new();

    prompt.push_str("You are a digital forensics expert.\n\n");
    if evidence.overlay_path.is_some() {
        prompt.push_str("You are given two images:\n");
        prompt.push_str("1. The original image.\n");
        prompt.push_str(&format!(
            "2. The overlay: the original with suspect regions highlighted in {color}.\n\n"
        ));
    } else {
        prompt.push_str("You are given the original image.\n\n");
    }

    prompt.push_str(&format!(
        "Context: the detector classified this image as \"{}\" with {:.1}% confidence.\n",
        classification.label,
        classification.probability * 100.0
    ));
    let top = evidence.concepts.top(top_n);
    if top.is_empty() {
        prompt.push_str("No concept probe fired above its threshold.\n\n");
    } else {
        prompt.push_str("Concept probes that fired:\n");
        for concept in top {
            prompt.push_str(&format!(
                "- {} ({:.1}%)\n",
                concept.phrase,
                concept.score * 100.0
            ));
        }
        prompt.push('\n');
    }

    prompt.push_str("Answer in English:\n");
    prompt.push_str("1. Briefly describe what the original image shows.\n");
    let mut step = 2;
    if evidence.overlay_path.is_some() {
        prompt.push_str(&format!(
            "{step}. Say where the {color} highlights sit (for example eyes, skin, background).\n"
        ));
        step += 1;
    }

    let mut focus: Vec<&str> = Vec::new();
    for concept in top {
        if let Some(anchor) = anchors.focus_for(&concept.phrase) {
            if !focus.contains(&anchor) {
                focus.push(anchor);
            }
        }
    }
    if focus.is_empty() {
        prompt.push_str(&format!(
            "{step}. Look for odd texture, geometry or lighting in those regions.\n"
        ));
    } else {
        prompt.push_str(&format!(
            "{step}. Look closely at {} for odd texture, geometry or lighting.\n",
            focus.join(", ")
        ));
    }
    step += 1;
    prompt.push_str(&format!(
        "{step}. Conclude why the visual evidence supports or contradicts the \"{}\" verdict.\n",
        classification.label
    ));
    prompt
}

fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        _ => "image/png",
    }
}
