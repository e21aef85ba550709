use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::PipelineError;

pub const CONFIG_FILE_NAME: &str = "truthlens.json"; // looked up in cwd, then the user config dir

/// Top-level pipeline configuration. Every field has a default so an empty
/// or missing file yields a working setup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub vocabulary: VocabularyConfig,
    #[serde(default)]
    pub explain: ExplainConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Hub repository holding the CLIP checkpoint.
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Hub revision. The main branch of the OpenAI checkpoint has no
    /// safetensors export, so this pin is load-bearing.
    #[serde(default = "default_revision")]
    pub revision: String,
    /// Local directory with model.safetensors + tokenizer.json. Takes
    /// precedence over the hub when it exists (fine-tuned artifacts).
    #[serde(default)]
    pub local_dir: Option<PathBuf>,
    /// Optional safetensors file with a fine-tuned 2-class linear head.
    #[serde(default)]
    pub head_file: Option<PathBuf>,
    /// Force CPU even when an accelerator feature is compiled in.
    #[serde(default)]
    pub cpu: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    /// Saliency values below this are dropped before rendering.
    #[serde(default = "default_overlay_threshold")]
    pub threshold: f32,
    /// Dilation window as a fraction of min(width, height).
    #[serde(default = "default_dilation_frac")]
    pub dilation_frac: f32,
    /// Blur kernel as a fraction of min(width, height).
    #[serde(default = "default_blur_frac")]
    pub blur_frac: f32,
    /// Weight of the highlight color in the composite.
    #[serde(default = "default_highlight_strength")]
    pub highlight_strength: f32,
    /// How much the original image fades under strong saliency.
    #[serde(default = "default_base_fade")]
    pub base_fade: f32,
    /// Highlight color name: red, green or blue.
    #[serde(default = "default_overlay_color")]
    pub color: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Concept gate when the image was classified as a real photograph.
    #[serde(default = "default_real_threshold")]
    pub real_threshold: f32,
    /// Concept gate when the image was classified as AI-generated.
    #[serde(default = "default_ai_threshold")]
    pub ai_threshold: f32,
    /// How many concepts are handed to the explanation prompt.
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VocabularyConfig {
    #[serde(default = "default_concepts_file")]
    pub concepts_file: PathBuf,
    #[serde(default = "default_anchors_file")]
    pub anchors_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExplainConfig {
    #[serde(default = "default_remote_base")]
    pub remote_base: String,
    #[serde(default = "default_remote_model")]
    pub remote_model: String,
    #[serde(default = "default_local_base")]
    pub local_base: String,
    #[serde(default = "default_local_model")]
    pub local_model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Root directory for generated artifacts.
    #[serde(default = "default_output_root")]
    pub root: PathBuf,
}

impl OutputConfig {
    pub fn overlay_dir(&self) -> PathBuf {
        self.root.join("overlays")
    }

    pub fn report_dir(&self) -> PathBuf {
        self.root.join("reports")
    }
}

fn default_model_id() -> String {
    "openai/clip-vit-base-patch32".to_string()
}

fn default_revision() -> String {
    "refs/pr/15".to_string()
}

fn default_overlay_threshold() -> f32 {
    0.25
}

fn default_dilation_frac() -> f32 {
    0.03
}

fn default_blur_frac() -> f32 {
    0.08
}

fn default_highlight_strength() -> f32 {
    0.7
}

fn default_base_fade() -> f32 {
    0.4
}

fn default_overlay_color() -> String {
    "red".to_string()
}

fn default_real_threshold() -> f32 {
    0.25
}

fn default_ai_threshold() -> f32 {
    0.10
}

fn default_top_n() -> usize {
    5
}

fn default_concepts_file() -> PathBuf {
    PathBuf::from("config/concepts.txt")
}

fn default_anchors_file() -> PathBuf {
    PathBuf::from("config/anchors.txt")
}

fn default_remote_base() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_remote_model() -> String {
    "nvidia/nemotron-nano-12b-v2-vl:free".to_string()
}

fn default_local_base() -> String {
    "http://localhost:11434".to_string()
}

fn default_local_model() -> String {
    "llava:7b".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_output_root() -> PathBuf {
    PathBuf::from("outputs")
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            revision: default_revision(),
            local_dir: None,
            head_file: None,
            cpu: false,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            threshold: default_overlay_threshold(),
            dilation_frac: default_dilation_frac(),
            blur_frac: default_blur_frac(),
            highlight_strength: default_highlight_strength(),
            base_fade: default_base_fade(),
            color: default_overlay_color(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            real_threshold: default_real_threshold(),
            ai_threshold: default_ai_threshold(),
            top_n: default_top_n(),
        }
    }
}

impl Default for VocabularyConfig {
    fn default() -> Self {
        Self {
            concepts_file: default_concepts_file(),
            anchors_file: default_anchors_file(),
        }
    }
}

impl Default for ExplainConfig {
    fn default() -> Self {
        Self {
            remote_base: default_remote_base(),
            remote_model: default_remote_model(),
            local_base: default_local_base(),
            local_model: default_local_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: default_output_root(),
        }
    }
}

impl PipelineConfig {
    /// Loads configuration. An explicit path must exist and parse; the
    /// default search falls back to defaults when no file is present.
    pub fn load(explicit: Option<&Path>) -> Result<Self, PipelineError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        for path in Self::search_paths() {
            match fs::read_to_string(&path) {
                Ok(contents) => return Self::parse(&contents, &path),
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(PipelineError::from(err)),
            }
        }

        log::info!("no config file found, using defaults");
        Ok(Self::default())
    }

    fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(PipelineError::Config(format!(
                    "missing config file {}",
                    path.display()
                )));
            }
            Err(err) => return Err(PipelineError::from(err)),
        };
        Self::parse(&contents, path)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, PipelineError> {
        serde_json::from_str(contents).map_err(|err| {
            PipelineError::Config(format!("failed to parse {}: {err}", path.display()))
        })
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(cwd) = env::current_dir() {
            paths.push(cwd.join(CONFIG_FILE_NAME));
        }
        if let Some(base) = dirs::config_dir() {
            paths.push(base.join("truthlens").join("config.json"));
        }
        paths
    }
}
