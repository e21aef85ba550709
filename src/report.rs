use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::PipelineError;
use crate::evidence::Analysis;

const RULE_WIDTH: usize = 60;

/// Renders the plain-text report body.
pub fn render(analysis: &Analysis) -> String {
    let evidence = &analysis.evidence;
    let classification = &evidence.classification;
    let rule = "=".repeat(RULE_WIDTH);
    let mut out = String::new();

    out.push_str(&format!("{rule}\n TRUTHLENS FORENSIC REPORT\n{rule}\n"));
    out.push_str(&format!("Image:     {}\n", evidence.source.display()));
    out.push_str(&format!(
        "Generated: {}\n\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));

    out.push_str("--- 1. DETECTOR RESULTS ---\n");
    out.push_str(&format!(
        "Verdict: {} ({:.1}% confidence, {})\n",
        classification.label,
        classification.probability * 100.0,
        classification.source
    ));
    for (prompt, prob) in classification.prompt_probabilities() {
        out.push_str(&format!("  {prompt:<24} {:>5.1}%\n", prob * 100.0));
    }
    match &evidence.overlay_path {
        Some(path) => out.push_str(&format!(
            "Overlay: {} ({} highlights)\n",
            path.display(),
            evidence.overlay_color
        )),
        None => out.push_str("Overlay: not available\n"),
    }
    out.push('\n');

    out.push_str("--- 2. CONCEPT SWEEP ---\n");
    if evidence.concepts.is_empty() {
        out.push_str("No concept scored above its threshold.\n");
    } else {
        for (rank, concept) in evidence.concepts.scores().iter().enumerate() {
            out.push_str(&format!(
                "{:>2}. {:>5.1}%  {} ({})\n",
                rank + 1,
                concept.score * 100.0,
                concept.label,
                concept.phrase
            ));
        }
    }
    out.push('\n');

    out.push_str("--- 3. EXPERT NARRATIVE ---\n");
    match &analysis.narrative {
        Some(narrative) => out.push_str(&format!(
            "[provider: {}]\n{}\n",
            narrative.provider,
            narrative.text.trim()
        )),
        None => out.push_str("No narrative available: every provider failed or was skipped.\n"),
    }
    out.push_str(&format!("{rule}\n"));
    out
}

/// Writes the report as `<stem>_report.txt` under `dir` and returns its
/// path.
pub fn write(analysis: &Analysis, dir: &Path) -> Result<PathBuf, PipelineError> {
    fs::create_dir_all(dir)?;
    let stem = analysis
        .evidence
        .source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    let path = dir.join(format!("{stem}_report.txt"));
    fs::write(&path, render(analysis))?;
    log::info!("report written to {}", path.display());
    Ok(path)
}
