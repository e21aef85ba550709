use std::path::{Path, PathBuf};

use candle_core::Tensor;
use image::RgbImage;

use crate::classifier::{self, CLASS_PROMPTS, Classification, FineTunedHead};
use crate::clip::DualEncoder;
use crate::concepts::{self, ConceptVocabulary, FocusAnchors};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::evidence::{Analysis, EvidenceBundle, Narrative};
use crate::explain::{self, ExplanationProvider};
use crate::overlay::{self, OverlayColor};
use crate::report;
use crate::saliency;

/// Runs the full analysis sequence for single images.
///
/// Construction loads everything up front: class prompt embeddings, the
/// optional fine-tuned head, and the concept vocabulary. One analyzer is
/// reused across images; nothing is cached lazily behind the scenes.
pub struct Analyzer {
    encoder: Box<dyn DualEncoder>,
    config: PipelineConfig,
    class_text_features: Tensor,
    head: Option<FineTunedHead>,
    vocabulary: ConceptVocabulary,
    anchors: FocusAnchors,
    overlay_color: OverlayColor,
}

impl Analyzer {
    pub fn new(
        encoder: Box<dyn DualEncoder>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let class_text_features = encoder.encode_text(&CLASS_PROMPTS)?;
        let head = match &config.model.head_file {
            Some(path) => Some(FineTunedHead::load(path, encoder.device())?),
            None => None,
        };
        let vocabulary = ConceptVocabulary::load(&config.vocabulary.concepts_file);
        let anchors = FocusAnchors::load(&config.vocabulary.anchors_file);
        let overlay_color = config.overlay.color.parse()?;

        Ok(Self {
            encoder,
            config,
            class_text_features,
            head,
            vocabulary,
            anchors,
            overlay_color,
        })
    }

    /// Vision stages only: classify, localize, probe. Classification errors
    /// are fatal; a failed overlay degrades to `None`; a failed probe
    /// degrades to empty concepts.
    pub fn analyze(&self, path: &Path) -> Result<EvidenceBundle, PipelineError> {
        log::info!("analyzing {}", path.display());
        let image = load_image(path)?;
        let pixel_values = self.encoder.preprocess(&image)?;

        let classification = classifier::classify(
            self.encoder.as_ref(),
            &pixel_values,
            &self.class_text_features,
            self.head.as_ref(),
        )?;

        let overlay_path =
            match self.render_overlay(&image, &pixel_values, &classification, path) {
                Ok(path) => Some(path),
                Err(err) => {
                    log::warn!("skipping overlay: {err}");
                    None
                }
            };

        let concepts = concepts::probe(
            self.encoder.as_ref(),
            &pixel_values,
            &classification,
            &self.vocabulary,
            &self.config.probe,
        );

        Ok(EvidenceBundle::new(
            path.to_path_buf(),
            classification,
            overlay_path,
            self.overlay_color,
            concepts,
        ))
    }

    /// Full pipeline: vision stages, provider chain, report. Returns the
    /// analysis and the report path.
    pub fn run(
        &self,
        path: &Path,
        providers: &[Box<dyn ExplanationProvider>],
    ) -> Result<(Analysis, PathBuf), PipelineError> {
        let evidence = self.analyze(path)?;
        let narrative = self.narrate(&evidence, providers);
        let analysis = Analysis {
            evidence,
            narrative,
        };
        let report_path = report::write(&analysis, &self.config.output.report_dir())?;
        Ok((analysis, report_path))
    }

    fn narrate(
        &self,
        evidence: &EvidenceBundle,
        providers: &[Box<dyn ExplanationProvider>],
    ) -> Option<Narrative> {
        if providers.is_empty() {
            log::info!("no explanation providers configured");
            return None;
        }
        match explain::build_request(evidence, &self.anchors, self.config.probe.top_n) {
            Ok(request) => explain::narrate(providers, &request),
            Err(err) => {
                log::warn!("could not prepare explanation request: {err}");
                None
            }
        }
    }

    fn render_overlay(
        &self,
        image: &RgbImage,
        pixel_values: &Tensor,
        classification: &Classification,
        source: &Path,
    ) -> Result<PathBuf, PipelineError> {
        let (width, height) = image.dimensions();
        let map = saliency::extract(
            self.encoder.as_ref(),
            pixel_values,
            &self.class_text_features,
            classification.label,
            width,
            height,
        )?;
        let rendered = overlay::render(&map, image, self.overlay_color, &self.config.overlay)?;
        overlay::save(&rendered, source, &self.config.output.overlay_dir())
    }
}

fn load_image(path: &Path) -> Result<RgbImage, PipelineError> {
    let image = image::open(path).map_err(|err| PipelineError::InvalidInput {
        path: path.to_path_buf(),
        detail: err.to_string(),
    })?;
    Ok(image.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Mutex;

    use candle_core::Device;
    use image::Rgb;

    use crate::classifier::{AI_PROMPT, ClassLabel, REAL_PROMPT};
    use crate::concepts::CONTROL_PROMPT;
    use crate::explain::ExplanationRequest;

    const EMBED_DIM: usize = 128;

    /// Deterministic encoder for end-to-end tests. Every distinct prompt
    /// owns one basis dimension; the image embedding is the mean pixel
    /// value spread over the dimensions of the aligned phrases, computed
    /// with tensor ops so gradients reach the input.
    struct StubEncoder {
        aligned: Vec<String>,
        dims: Mutex<HashMap<String, usize>>,
        device: Device,
    }

    impl StubEncoder {
        fn new(aligned: &[&str]) -> Self {
            Self {
                aligned: aligned.iter().map(|s| s.to_string()).collect(),
                dims: Mutex::new(HashMap::new()),
                device: Device::Cpu,
            }
        }

        fn dim_of(&self, prompt: &str) -> usize {
            let mut dims = self.dims.lock().unwrap();
            let next = dims.len();
            let dim = *dims.entry(prompt.to_string()).or_insert(next);
            assert!(dim < EMBED_DIM, "too many distinct prompts for the stub");
            dim
        }
    }

    impl DualEncoder for StubEncoder {
        fn preprocess(&self, image: &RgbImage) -> Result<Tensor, PipelineError> {
            let (w, h) = image.dimensions();
            let (w_us, h_us) = (w as usize, h as usize);
            let mut data = vec![0f32; 3 * w_us * h_us];
            for (x, y, pixel) in image.enumerate_pixels() {
                for c in 0..3 {
                    data[c * w_us * h_us + y as usize * w_us + x as usize] =
                        pixel.0[c] as f32 / 255.0;
                }
            }
            Tensor::from_vec(data, (1, 3, h_us, w_us), &self.device)
                .map_err(|err| PipelineError::inference("stub preprocess", err))
        }

        fn encode_text(&self, prompts: &[&str]) -> Result<Tensor, PipelineError> {
            let mut data = vec![0f32; prompts.len() * EMBED_DIM];
            for (row, prompt) in prompts.iter().enumerate() {
                data[row * EMBED_DIM + self.dim_of(prompt)] = 1.0;
            }
            Tensor::from_vec(data, (prompts.len(), EMBED_DIM), &self.device)
                .map_err(|err| PipelineError::inference("stub text", err))
        }

        fn encode_image(&self, pixel_values: &Tensor) -> Result<Tensor, PipelineError> {
            let stat = pixel_values
                .mean_all()
                .map_err(|err| PipelineError::inference("stub image", err))?;
            let mut basis = vec![0f32; EMBED_DIM];
            for phrase in &self.aligned {
                basis[self.dim_of(phrase)] = 1.0;
            }
            let basis = Tensor::from_vec(basis, (1, EMBED_DIM), &self.device)
                .map_err(|err| PipelineError::inference("stub image", err))?;
            basis
                .broadcast_mul(&stat)
                .map_err(|err| PipelineError::inference("stub image", err))
        }

        fn logit_scale(&self) -> f32 {
            100.0
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    struct FixedProvider {
        id: &'static str,
        text: &'static str,
    }

    impl ExplanationProvider for FixedProvider {
        fn name(&self) -> &'static str {
            self.id
        }
        fn explain(&self, _request: &ExplanationRequest) -> Result<String, PipelineError> {
            Ok(self.text.to_string())
        }
    }

    struct FailingProvider(&'static str);

    impl ExplanationProvider for FailingProvider {
        fn name(&self) -> &'static str {
            self.0
        }
        fn explain(&self, _request: &ExplanationRequest) -> Result<String, PipelineError> {
            Err(PipelineError::Provider {
                provider: self.0,
                detail: "unreachable".into(),
            })
        }
    }

    fn setup(name: &str, aligned: &[&str]) -> (Analyzer, PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("truthlens-{name}-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("test dir");
        let mut config = PipelineConfig::default();
        config.output.root = dir.clone();

        let analyzer =
            Analyzer::new(Box::new(StubEncoder::new(aligned)), config).expect("analyzer");

        let image_path = dir.join("sample.png");
        let image = RgbImage::from_fn(12, 10, |x, y| {
            Rgb([(10 + x * 3) as u8, 80, (40 + y * 2) as u8])
        });
        image.save(&image_path).expect("save sample");
        (analyzer, image_path, dir)
    }

    #[test]
    fn real_aligned_image_classifies_real_with_overlay() {
        let (analyzer, image_path, dir) = setup("real", &[REAL_PROMPT]);
        let evidence = analyzer.analyze(&image_path).expect("analyze");

        assert_eq!(evidence.classification.label, ClassLabel::RealPhotograph);
        assert!(evidence.classification.probability > 0.95);
        let total: f32 = evidence.classification.probabilities.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);

        let overlay_path = evidence.overlay_path.expect("overlay written");
        assert!(overlay_path.exists());
        let overlay = image::open(&overlay_path).expect("open overlay").to_rgb8();
        assert_eq!(overlay.dimensions(), (12, 10));

        // Nothing in the vocabulary aligns, so the sweep stays empty.
        assert!(evidence.concepts.is_empty());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn defect_aligned_image_classifies_ai_and_fires_the_concept() {
        let (analyzer, image_path, dir) = setup("defect", &[AI_PROMPT, "extra fingers"]);
        let evidence = analyzer.analyze(&image_path).expect("analyze");

        assert_eq!(evidence.classification.label, ClassLabel::AiGenerated);
        assert!(!evidence.concepts.is_empty());
        let top = &evidence.concepts.scores()[0];
        assert_eq!(top.phrase, "extra fingers");
        assert!(top.score > 0.10);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn control_phrase_absorbs_mass_and_is_never_reported() {
        let (analyzer, image_path, dir) = setup("control", &[REAL_PROMPT, CONTROL_PROMPT]);
        let evidence = analyzer.analyze(&image_path).expect("analyze");

        assert!(
            evidence
                .concepts
                .scores()
                .iter()
                .all(|c| c.phrase != CONTROL_PROMPT)
        );
        assert!(evidence.concepts.is_empty());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn narrative_is_tagged_with_the_provider_that_answered() {
        let (analyzer, image_path, dir) = setup("chain", &[REAL_PROMPT]);
        let providers: Vec<Box<dyn ExplanationProvider>> = vec![
            Box::new(FailingProvider("remote-down")),
            Box::new(FixedProvider {
                id: "stub-llm",
                text: "The lighting is coherent throughout.",
            }),
        ];
        let (analysis, report_path) = analyzer.run(&image_path, &providers).expect("run");

        let narrative = analysis.narrative.expect("narrative");
        assert_eq!(narrative.provider, "stub-llm");
        let report = fs::read_to_string(&report_path).expect("report");
        assert!(report.contains("[provider: stub-llm]"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn report_is_still_written_when_every_provider_fails() {
        let (analyzer, image_path, dir) = setup("allfail", &[REAL_PROMPT]);
        let providers: Vec<Box<dyn ExplanationProvider>> = vec![
            Box::new(FailingProvider("a")),
            Box::new(FailingProvider("b")),
        ];
        let (analysis, report_path) = analyzer.run(&image_path, &providers).expect("run");

        assert!(analysis.narrative.is_none());
        assert!(report_path.exists());
        let report = fs::read_to_string(&report_path).expect("report");
        assert!(report.contains("No narrative available"));
        assert!(report.contains("real photograph"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn uniform_image_yields_finite_saliency() {
        let encoder = StubEncoder::new(&[REAL_PROMPT]);
        let image = RgbImage::from_pixel(8, 8, Rgb([128, 128, 128]));
        let pixels = encoder.preprocess(&image).expect("preprocess");
        let class_text = encoder.encode_text(&CLASS_PROMPTS).expect("class text");

        let map = saliency::extract(
            &encoder,
            &pixels,
            &class_text,
            ClassLabel::RealPhotograph,
            8,
            8,
        )
        .expect("saliency");
        assert!(
            map.values()
                .iter()
                .all(|v| v.is_finite() && (0.0..=1.0).contains(v))
        );
    }

    #[test]
    fn unreadable_input_is_an_invalid_input_error() {
        let (analyzer, _, dir) = setup("badinput", &[REAL_PROMPT]);
        let missing = dir.join("nope.png");
        let err = analyzer.analyze(&missing).expect_err("should fail");
        assert!(matches!(err, PipelineError::InvalidInput { .. }));
        let _ = fs::remove_dir_all(dir);
    }
}
