//! Text and sketch conditioned image generation on top of the Stable
//! Diffusion v1.5 pipeline from the diffusers crate.
//!
//! The models themselves (CLIP, UNet, VAE, ControlNet, the DDIM
//! scheduler) all come from diffusers; this module only builds them from
//! a directory of pretrained weight files, runs one guided inference
//! pass and writes the decoded image. A missing weight installation is
//! reported as a printed message and an absent result, not an error.

use std::path::{Path, PathBuf};

use anyhow::Result;
use diffusers::models::controlnet::ControlNet;
use diffusers::models::vae;
use diffusers::pipelines::stable_diffusion;
use diffusers::transformers::clip;
use image::imageops::FilterType;
use image::EncodableLayout;
use tch::{nn, nn::Module, Device, Kind, Tensor};

const GUIDANCE_SCALE: f64 = 7.5;

// Weight file names inside the weights directory, matching the layout
// produced by the conversion steps in the README.
const VOCAB_FILE: &str = "bpe_simple_vocab_16e6.txt";
const CLIP_WEIGHTS: &str = "pytorch_model.safetensors";
const UNET_WEIGHTS: &str = "unet.safetensors";
const VAE_WEIGHTS: &str = "vae.safetensors";
const CONTROLNET_WEIGHTS: &str = "controlnet.safetensors";

const BASE_WEIGHTS: [&str; 4] = [VOCAB_FILE, CLIP_WEIGHTS, UNET_WEIGHTS, VAE_WEIGHTS];

/// The directory holding the pretrained weight files. Probed before any
/// model is built so an incomplete installation is reported up front.
#[derive(Debug, Clone)]
pub struct GenerationBackend {
    weights_dir: PathBuf,
}

impl GenerationBackend {
    pub fn new<P: AsRef<Path>>(weights_dir: P) -> Self {
        Self { weights_dir: weights_dir.as_ref().to_path_buf() }
    }

    fn weight_path(&self, file: &str) -> PathBuf {
        self.weights_dir.join(file)
    }

    /// Weight files needed for text to image generation that are not on
    /// disk.
    pub fn missing_base_weights(&self) -> Vec<PathBuf> {
        BASE_WEIGHTS
            .iter()
            .map(|file| self.weight_path(file))
            .filter(|path| !path.is_file())
            .collect()
    }

    /// As `missing_base_weights`, plus the ControlNet weights the sketch
    /// conditioned pipeline also needs.
    pub fn missing_control_weights(&self) -> Vec<PathBuf> {
        let mut missing = self.missing_base_weights();
        let controlnet = self.weight_path(CONTROLNET_WEIGHTS);
        if !controlnet.is_file() {
            missing.push(controlnet);
        }
        missing
    }

    pub fn base_available(&self) -> bool {
        self.missing_base_weights().is_empty()
    }

    pub fn control_available(&self) -> bool {
        self.missing_control_weights().is_empty()
    }
}

/// A single generation run, built by the dispatcher and dropped once the
/// image is written.
#[derive(Debug)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub output: PathBuf,
    pub device: Device,
    pub n_steps: usize,
    pub seed: i64,
    pub height: Option<i64>,
    pub width: Option<i64>,
}

/// How the sketch is turned into the ControlNet conditioning image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SketchPreprocess {
    /// Use the sketch as is, for hand drawn line art or edge maps.
    None,
    /// Run the Canny edge detector first, for photographic inputs.
    Canny,
}

impl SketchPreprocess {
    /// Load the sketch, resize it to the generation size and build the
    /// conditioning tensor, duplicated on the batch dimension for
    /// classifier-free guidance.
    fn control_tensor(self, path: &Path, width: i64, height: i64) -> Result<Tensor> {
        let tensor = match self {
            Self::None => {
                let sketch = image::open(path)?
                    .resize_exact(width as u32, height as u32, FilterType::Triangle)
                    .to_rgb8();
                Tensor::f_from_data_size(sketch.as_bytes(), &[1, height, width, 3], Kind::Uint8)?
                    .permute([0, 3, 1, 2])
            }
            Self::Canny => {
                let sketch = image::open(path)?
                    .resize_exact(width as u32, height as u32, FilterType::Triangle)
                    .to_luma8();
                let edges = imageproc::edges::canny(&sketch, 50., 100.);
                let tensor =
                    Tensor::f_from_data_size(edges.as_bytes(), &[1, 1, height, width], Kind::Uint8)?;
                Tensor::f_concat(&[&tensor, &tensor, &tensor], 1)?
            }
        };
        let tensor = Tensor::f_concat(&[&tensor, &tensor], 0)?;
        Ok(tensor.to_kind(Kind::Float) / 255.)
    }
}

fn report_missing(missing: &[PathBuf]) {
    println!("The pretrained weights are not installed, these files are missing:");
    for path in missing {
        println!("  {}", path.display());
    }
    println!("See the README for where to download them and how to convert them.");
}

fn encode_prompt(tokenizer: &clip::Tokenizer, prompt: &str, device: Device) -> Result<Tensor> {
    let tokens = tokenizer.encode(prompt)?;
    let tokens: Vec<i64> = tokens.into_iter().map(|x| x as i64).collect();
    Ok(Tensor::from_slice(&tokens).view((1, -1)).to(device))
}

fn write_image(vae: &vae::AutoEncoderKL, latents: &Tensor, output: &Path) -> Result<()> {
    if let Some(dir) = output.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let image = vae.decode(&(latents / 0.18215));
    let image = (image / 2 + 0.5).clamp(0., 1.).to_device(Device::Cpu);
    let image = (image * 255.).to_kind(Kind::Uint8);
    tch::vision::image::save(&image, output)?;
    Ok(())
}

/// Generate an image from the prompt alone.
///
/// Returns the output path, or `None` after a printed diagnostic when the
/// pretrained weights are not installed. In that case nothing is written.
pub fn text_to_image(
    backend: &GenerationBackend,
    request: &GenerationRequest,
) -> Result<Option<PathBuf>> {
    let missing = backend.missing_base_weights();
    if !missing.is_empty() {
        report_missing(&missing);
        return Ok(None);
    }

    let sd_config =
        stable_diffusion::StableDiffusionConfig::v1_5(None, request.height, request.width);
    let device = request.device;
    let scheduler = sd_config.build_scheduler(request.n_steps);

    let tokenizer = clip::Tokenizer::create(backend.weight_path(VOCAB_FILE), &sd_config.clip)?;
    println!("Running with prompt \"{}\".", request.prompt);
    let tokens = encode_prompt(&tokenizer, &request.prompt, device)?;
    let uncond_tokens = encode_prompt(&tokenizer, &request.negative_prompt, device)?;

    let no_grad_guard = tch::no_grad_guard();

    println!("Building the Clip transformer.");
    let text_model = sd_config
        .build_clip_transformer(&backend.weight_path(CLIP_WEIGHTS).to_string_lossy(), device)?;
    let text_embeddings = text_model.forward(&tokens);
    let uncond_embeddings = text_model.forward(&uncond_tokens);
    let text_embeddings = Tensor::cat(&[uncond_embeddings, text_embeddings], 0);

    println!("Building the autoencoder.");
    let vae = sd_config.build_vae(&backend.weight_path(VAE_WEIGHTS).to_string_lossy(), device)?;
    println!("Building the unet.");
    let unet =
        sd_config.build_unet(&backend.weight_path(UNET_WEIGHTS).to_string_lossy(), device, 4)?;

    tch::manual_seed(request.seed);
    let mut latents =
        Tensor::randn([1, 4, sd_config.height / 8, sd_config.width / 8], (Kind::Float, device));
    latents *= scheduler.init_noise_sigma();

    for (timestep_index, &timestep) in scheduler.timesteps().iter().enumerate() {
        println!("Timestep {timestep_index}/{}", request.n_steps);
        let latent_model_input = Tensor::cat(&[&latents, &latents], 0);
        let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep);
        let noise_pred = unet.forward(&latent_model_input, timestep as f64, &text_embeddings);
        let noise_pred = noise_pred.chunk(2, 0);
        let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
        let noise_pred = noise_pred_uncond + (noise_pred_text - noise_pred_uncond) * GUIDANCE_SCALE;
        latents = scheduler.step(&noise_pred, timestep, &latents);
    }

    println!("Generating the final image.");
    write_image(&vae, &latents, &request.output)?;

    drop(no_grad_guard);
    Ok(Some(request.output.clone()))
}

/// Generate an image from the prompt with its structure constrained by a
/// sketch through ControlNet.
///
/// Returns the output path, or `None` after a printed diagnostic when
/// either the base or the ControlNet weights are not installed.
pub fn sketch_to_image(
    backend: &GenerationBackend,
    request: &GenerationRequest,
    sketch_path: &Path,
    preprocess: SketchPreprocess,
) -> Result<Option<PathBuf>> {
    let missing = backend.missing_control_weights();
    if !missing.is_empty() {
        report_missing(&missing);
        return Ok(None);
    }

    let sd_config =
        stable_diffusion::StableDiffusionConfig::v1_5(None, request.height, request.width);
    let device = request.device;
    let scheduler = sd_config.build_scheduler(request.n_steps);
    let sketch =
        preprocess.control_tensor(sketch_path, sd_config.width, sd_config.height)?.to(device);

    let tokenizer = clip::Tokenizer::create(backend.weight_path(VOCAB_FILE), &sd_config.clip)?;
    println!("Running with prompt \"{}\".", request.prompt);
    let tokens = encode_prompt(&tokenizer, &request.prompt, device)?;
    let uncond_tokens = encode_prompt(&tokenizer, &request.negative_prompt, device)?;

    let no_grad_guard = tch::no_grad_guard();

    println!("Building the Clip transformer.");
    let text_model = sd_config
        .build_clip_transformer(&backend.weight_path(CLIP_WEIGHTS).to_string_lossy(), device)?;
    let text_embeddings = text_model.forward(&tokens);
    let uncond_embeddings = text_model.forward(&uncond_tokens);
    let text_embeddings = Tensor::cat(&[uncond_embeddings, text_embeddings], 0);

    println!("Building the autoencoder.");
    let vae = sd_config.build_vae(&backend.weight_path(VAE_WEIGHTS).to_string_lossy(), device)?;
    println!("Building the unet.");
    let unet =
        sd_config.build_unet(&backend.weight_path(UNET_WEIGHTS).to_string_lossy(), device, 4)?;
    println!("Building the controlnet.");
    let mut vs_controlnet = nn::VarStore::new(device);
    let controlnet = ControlNet::new(vs_controlnet.root(), 4, Default::default());
    vs_controlnet.load(backend.weight_path(CONTROLNET_WEIGHTS))?;

    tch::manual_seed(request.seed);
    let mut latents =
        Tensor::randn([1, 4, sd_config.height / 8, sd_config.width / 8], (Kind::Float, device));
    latents *= scheduler.init_noise_sigma();

    for (timestep_index, &timestep) in scheduler.timesteps().iter().enumerate() {
        println!("Timestep {timestep_index}/{}", request.n_steps);
        let latent_model_input = Tensor::cat(&[&latents, &latents], 0);
        let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep);
        let (down_block_additional_residuals, mid_block_additional_residuals) =
            controlnet.forward(&latent_model_input, timestep as f64, &text_embeddings, &sketch, 1.);
        let noise_pred = unet.forward_with_additional_residuals(
            &latent_model_input,
            timestep as f64,
            &text_embeddings,
            Some(&down_block_additional_residuals),
            Some(&mid_block_additional_residuals),
        );
        let noise_pred = noise_pred.chunk(2, 0);
        let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
        let noise_pred = noise_pred_uncond + (noise_pred_text - noise_pred_uncond) * GUIDANCE_SCALE;
        latents = scheduler.step(&noise_pred, timestep, &latents);
    }

    println!("Generating the final image.");
    write_image(&vae, &latents, &request.output)?;

    drop(no_grad_guard);
    Ok(Some(request.output.clone()))
}
