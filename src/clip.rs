use std::path::PathBuf;

use candle_core::{D, DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{self, ClipModel};
use hf_hub::{Repo, RepoType, api::sync::Api};
use image::{DynamicImage, RgbImage, imageops::FilterType};
use tokenizers::Tokenizer;

use crate::config::ModelConfig;
use crate::error::PipelineError;

const IMAGE_SIZE: usize = 224;
const PAD_TOKEN: &str = "<|endoftext|>"; // CLIP pads with the EOT token
const WEIGHTS_FILE: &str = "model.safetensors";
const TOKENIZER_FILE: &str = "tokenizer.json";

// Normalization constants of the CLIP image processor. These must match the
// checkpoint or the similarity scores drift.
const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const CLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// Contrastive dual encoder mapping images and text prompts into a shared
/// embedding space.
///
/// The pipeline only talks to this trait so the transformer can be swapped
/// for a deterministic encoder in tests.
pub trait DualEncoder: Send + Sync {
    /// Resizes and normalizes an image into the encoder's input tensor.
    fn preprocess(&self, image: &RgbImage) -> Result<Tensor, PipelineError>;

    /// Encodes a batch of prompts into unnormalized embeddings, one row each.
    fn encode_text(&self, prompts: &[&str]) -> Result<Tensor, PipelineError>;

    /// Encodes preprocessed pixels into a single unnormalized embedding row.
    ///
    /// Implementations must express this with tensor ops so gradients can
    /// flow back to `pixel_values` when it descends from a `Var`.
    fn encode_image(&self, pixel_values: &Tensor) -> Result<Tensor, PipelineError>;

    /// The exponentiated contrastive temperature learned by the model.
    fn logit_scale(&self) -> f32;

    fn device(&self) -> &Device;

    /// Cosine similarities between one image row and n text rows, scaled by
    /// the learned temperature. Shape (1, n).
    fn similarity_logits(
        &self,
        image_features: &Tensor,
        text_features: &Tensor,
    ) -> Result<Tensor, PipelineError> {
        scaled_similarity(image_features, text_features, self.logit_scale())
            .map_err(|err| PipelineError::inference("similarity logits", err))
    }
}

/// Divides each row by its L2 norm.
pub fn l2_normalize(features: &Tensor) -> candle_core::Result<Tensor> {
    features.broadcast_div(&features.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?)
}

fn scaled_similarity(
    image_features: &Tensor,
    text_features: &Tensor,
    scale: f32,
) -> candle_core::Result<Tensor> {
    let image_features = l2_normalize(image_features)?;
    let text_features = l2_normalize(text_features)?;
    image_features
        .matmul(&text_features.t()?)?
        .affine(scale as f64, 0.0)
}

/// CLIP ViT-B/32 encoder backed by candle.
pub struct ClipEncoder {
    model: ClipModel,
    tokenizer: Tokenizer,
    pad_id: u32,
    logit_scale: f32,
    device: Device,
}

impl ClipEncoder {
    /// Loads weights and tokenizer, preferring a local fine-tuned artifact
    /// directory over the hub checkpoint when one is configured and present.
    pub fn load(config: &ModelConfig) -> Result<Self, PipelineError> {
        let device = select_device(config.cpu);
        log::info!("loading CLIP encoder on {device:?}");

        let (weights_path, tokenizer_path) = locate_artifacts(config)?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|err| {
            PipelineError::ModelLoad(format!(
                "tokenizer {}: {err}",
                tokenizer_path.display()
            ))
        })?;
        let pad_id = tokenizer
            .get_vocab(true)
            .get(PAD_TOKEN)
            .copied()
            .ok_or_else(|| {
                PipelineError::ModelLoad(format!("tokenizer has no {PAD_TOKEN} token"))
            })?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&weights_path], DType::F32, &device)
        }
        .map_err(PipelineError::model_load)?;
        let logit_scale = read_logit_scale(&vb).map_err(PipelineError::model_load)?;
        let model = ClipModel::new(vb, &clip::ClipConfig::vit_base_patch32())
            .map_err(PipelineError::model_load)?;

        log::info!(
            "CLIP encoder ready ({}, logit scale {logit_scale:.2})",
            weights_path.display()
        );

        Ok(Self {
            model,
            tokenizer,
            pad_id,
            logit_scale,
            device,
        })
    }

    /// Pads every prompt to the batch maximum with the EOT token and stacks
    /// them into a (n, seq) id tensor.
    fn tokenize_batch(&self, prompts: &[&str]) -> Result<Tensor, PipelineError> {
        let mut sequences = Vec::with_capacity(prompts.len());
        let mut max_len = 0;
        for prompt in prompts {
            let encoding = self
                .tokenizer
                .encode(*prompt, true)
                .map_err(|err| PipelineError::inference("tokenize", err))?;
            let ids = encoding.get_ids().to_vec();
            max_len = max_len.max(ids.len());
            sequences.push(ids);
        }
        for ids in &mut sequences {
            ids.resize(max_len, self.pad_id);
        }
        Tensor::new(sequences, &self.device)
            .map_err(|err| PipelineError::inference("tokenize", err))
    }
}

impl DualEncoder for ClipEncoder {
    fn preprocess(&self, image: &RgbImage) -> Result<Tensor, PipelineError> {
        let resized = DynamicImage::ImageRgb8(image.clone())
            .resize_to_fill(IMAGE_SIZE as u32, IMAGE_SIZE as u32, FilterType::CatmullRom)
            .to_rgb8();

        let pixels = resized.as_raw();
        let mut data = vec![0f32; 3 * IMAGE_SIZE * IMAGE_SIZE];
        for i in 0..(IMAGE_SIZE * IMAGE_SIZE) {
            let r = pixels[i * 3] as f32 / 255.0;
            let g = pixels[i * 3 + 1] as f32 / 255.0;
            let b = pixels[i * 3 + 2] as f32 / 255.0;

            // CHW layout with per-channel normalization
            data[i] = (r - CLIP_MEAN[0]) / CLIP_STD[0];
            data[IMAGE_SIZE * IMAGE_SIZE + i] = (g - CLIP_MEAN[1]) / CLIP_STD[1];
            data[2 * IMAGE_SIZE * IMAGE_SIZE + i] = (b - CLIP_MEAN[2]) / CLIP_STD[2];
        }

        Tensor::from_vec(data, (1, 3, IMAGE_SIZE, IMAGE_SIZE), &self.device)
            .map_err(|err| PipelineError::inference("preprocess", err))
    }

    fn encode_text(&self, prompts: &[&str]) -> Result<Tensor, PipelineError> {
        let input_ids = self.tokenize_batch(prompts)?;
        self.model
            .get_text_features(&input_ids)
            .map_err(|err| PipelineError::inference("text encoder", err))
    }

    fn encode_image(&self, pixel_values: &Tensor) -> Result<Tensor, PipelineError> {
        self.model
            .get_image_features(pixel_values)
            .map_err(|err| PipelineError::inference("image encoder", err))
    }

    fn logit_scale(&self) -> f32 {
        self.logit_scale
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

fn read_logit_scale(vb: &VarBuilder) -> candle_core::Result<f32> {
    vb.get((), "logit_scale")?.exp()?.to_scalar::<f32>()
}

fn locate_artifacts(config: &ModelConfig) -> Result<(PathBuf, PathBuf), PipelineError> {
    if let Some(dir) = &config.local_dir {
        let weights = dir.join(WEIGHTS_FILE);
        let tokenizer = dir.join(TOKENIZER_FILE);
        if weights.is_file() && tokenizer.is_file() {
            log::info!("using local artifact {}", dir.display());
            return Ok((weights, tokenizer));
        }
        log::warn!(
            "artifact dir {} is incomplete, falling back to {}",
            dir.display(),
            config.model_id
        );
    }

    let api = Api::new().map_err(PipelineError::model_load)?;
    let repo = api.repo(Repo::with_revision(
        config.model_id.clone(),
        RepoType::Model,
        config.revision.clone(),
    ));
    let weights = repo.get(WEIGHTS_FILE).map_err(PipelineError::model_load)?;
    let tokenizer = repo.get(TOKENIZER_FILE).map_err(PipelineError::model_load)?;
    Ok((weights, tokenizer))
}

fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        return Device::Cpu;
    }
    #[cfg(feature = "metal")]
    let device = Device::new_metal(0).unwrap_or(Device::Cpu);
    #[cfg(all(feature = "cuda", not(feature = "metal")))]
    let device = Device::cuda_if_available(0).unwrap_or(Device::Cpu);
    #[cfg(not(any(feature = "metal", feature = "cuda")))]
    let device = Device::Cpu;
    device
}
