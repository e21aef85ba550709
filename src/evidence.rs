use std::path::PathBuf;

use crate::classifier::Classification;
use crate::concepts::ConceptScores;
use crate::overlay::OverlayColor;

/// Everything the vision stages produced for one image. The overlay path is
/// absent when saliency extraction failed; concepts may be empty.
#[derive(Debug, Clone)]
pub struct EvidenceBundle {
    pub source: PathBuf,
    pub classification: Classification,
    pub overlay_path: Option<PathBuf>,
    pub overlay_color: OverlayColor,
    pub concepts: ConceptScores,
}

impl EvidenceBundle {
    pub fn new(
        source: PathBuf,
        classification: Classification,
        overlay_path: Option<PathBuf>,
        overlay_color: OverlayColor,
        concepts: ConceptScores,
    ) -> Self {
        Self {
            source,
            classification,
            overlay_path,
            overlay_color,
            concepts,
        }
    }
}

/// Expert narrative produced by one provider in the fallback chain.
#[derive(Debug, Clone)]
pub struct Narrative {
    pub provider: &'static str,
    pub text: String,
}

/// Final pipeline outcome. The narrative is `None` when every provider
/// failed; the evidence is still complete and reportable.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub evidence: EvidenceBundle,
    pub narrative: Option<Narrative>,
}
