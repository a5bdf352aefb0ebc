//! Command line surface and the rules mapping flags to an operation.
//!
//! The tool can be driven through the explicit `generate` and `edit`
//! subcommands, or with a flat flag set from which the operation is
//! inferred. The inference is a small decision table in `infer_intent`
//! rather than branching spread over the dispatcher.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::device::DeviceRequest;
use crate::error::{Error, Result};
use crate::generate::SketchPreprocess;

pub const DEFAULT_OUTPUT_DIR: &str = "outputs";
pub const DEFAULT_WEIGHTS_DIR: &str = "data";
const DEFAULT_STEPS: usize = 30;
const DEFAULT_SEED: i64 = 32;
const DEFAULT_ALPHA: f64 = 0.5;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub inferred: InferredArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate an image from a prompt, optionally guided by a sketch.
    Generate(GenerateArgs),
    /// Apply a post-processing operation to an existing image.
    Edit(EditArgs),
}

#[derive(Debug, clap::Args)]
pub struct GenerateArgs {
    /// The prompt describing the image to generate.
    #[arg(long)]
    pub prompt: String,

    /// A sketch constraining the structure of the generated image.
    #[arg(long, value_name = "FILE")]
    pub sketch_path: Option<PathBuf>,

    /// How the sketch is prepared before conditioning the generation.
    #[arg(long, value_enum, default_value = "none")]
    pub sketch_preprocess: SketchPreprocess,

    /// A prompt describing what to keep out of the image.
    #[arg(long, default_value = "")]
    pub negative_prompt: String,

    /// The directory the generated image is written to.
    #[arg(long, value_name = "DIR", default_value = DEFAULT_OUTPUT_DIR)]
    pub output_dir: PathBuf,

    /// The directory holding the pretrained weight files.
    #[arg(long, value_name = "DIR", default_value = DEFAULT_WEIGHTS_DIR)]
    pub weights_dir: PathBuf,

    /// The device to run the models on.
    #[arg(long, value_enum, default_value = "cpu")]
    pub device: DeviceRequest,

    /// The number of steps to run the diffusion for.
    #[arg(long, default_value_t = DEFAULT_STEPS)]
    pub n_steps: usize,

    /// The random seed to be used for the generation.
    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: i64,

    /// The height in pixels of the generated image.
    #[arg(long)]
    pub height: Option<i64>,

    /// The width in pixels of the generated image.
    #[arg(long)]
    pub width: Option<i64>,
}

#[derive(Debug, clap::Args)]
pub struct EditArgs {
    /// The image to edit.
    #[arg(long, value_name = "FILE")]
    pub input_image: PathBuf,

    /// The post-processing operation to apply.
    #[arg(long, value_enum)]
    pub edit: EditKind,

    /// Additive brightness offset in [-100, 100].
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub brightness: i32,

    /// Contrast percentage in [-100, 100].
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub contrast: i32,

    /// The second image for the blend operation.
    #[arg(long, value_name = "FILE")]
    pub blend_image: Option<PathBuf>,

    /// Blend weight of the input image, the second image gets 1 - alpha.
    #[arg(long, default_value_t = DEFAULT_ALPHA, allow_negative_numbers = true)]
    pub alpha: f64,

    /// The directory the edited image is written to.
    #[arg(long, value_name = "DIR", default_value = DEFAULT_OUTPUT_DIR)]
    pub output_dir: PathBuf,
}

impl EditArgs {
    /// Check the flag combination before any image is touched.
    pub fn validate(&self) -> Result<()> {
        if self.edit == EditKind::Blend && self.blend_image.is_none() {
            return Err(Error::MissingBlendImage);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EditKind {
    /// Rescale pixel values with a brightness offset and a contrast factor.
    BrightnessContrast,
    /// Blend the input with a second image.
    Blend,
}

/// Flags accepted without a subcommand, mirroring the subcommand flags
/// that decide between the operations.
#[derive(Debug, Default, clap::Args)]
pub struct InferredArgs {
    /// The prompt, when generating without an explicit subcommand.
    #[arg(long)]
    pub prompt: Option<String>,

    /// The sketch, when generating without an explicit subcommand.
    #[arg(long, value_name = "FILE")]
    pub sketch_path: Option<PathBuf>,

    /// The image to edit, when editing without an explicit subcommand.
    #[arg(long, value_name = "FILE")]
    pub input_image: Option<PathBuf>,

    /// The edit kind, when editing without an explicit subcommand.
    #[arg(long, value_enum)]
    pub edit: Option<EditKind>,

    #[arg(long, allow_negative_numbers = true)]
    pub brightness: Option<i32>,

    #[arg(long, allow_negative_numbers = true)]
    pub contrast: Option<i32>,

    #[arg(long, value_name = "FILE")]
    pub blend_image: Option<PathBuf>,

    #[arg(long, allow_negative_numbers = true)]
    pub alpha: Option<f64>,

    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    pub weights_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub device: Option<DeviceRequest>,
}

/// The operation selected for an invocation without a subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Generate,
    Edit,
    ShowHelp,
}

/// Decision table for invocations without a subcommand: an input image
/// together with an edit kind means edit, otherwise a prompt means
/// generate, anything else falls back to the usage help.
pub fn infer_intent(has_prompt: bool, has_input_image: bool, has_edit_kind: bool) -> Intent {
    if has_input_image && has_edit_kind {
        Intent::Edit
    } else if has_prompt {
        Intent::Generate
    } else {
        Intent::ShowHelp
    }
}

#[derive(Debug)]
pub enum InferredOp {
    Generate(GenerateArgs),
    Edit(EditArgs),
    ShowHelp,
}

impl InferredArgs {
    /// Turn the flat flag set into the operation picked by `infer_intent`.
    /// The table only selects generate or edit when the flags those need
    /// are present, so the fallback arms are never reached in practice.
    pub fn into_op(self) -> InferredOp {
        match infer_intent(self.prompt.is_some(), self.input_image.is_some(), self.edit.is_some())
        {
            Intent::Generate => match self.generate_args() {
                Some(args) => InferredOp::Generate(args),
                None => InferredOp::ShowHelp,
            },
            Intent::Edit => match self.edit_args() {
                Some(args) => InferredOp::Edit(args),
                None => InferredOp::ShowHelp,
            },
            Intent::ShowHelp => InferredOp::ShowHelp,
        }
    }

    fn generate_args(&self) -> Option<GenerateArgs> {
        Some(GenerateArgs {
            prompt: self.prompt.clone()?,
            sketch_path: self.sketch_path.clone(),
            sketch_preprocess: SketchPreprocess::None,
            negative_prompt: String::new(),
            output_dir: self.output_dir.clone().unwrap_or_else(|| DEFAULT_OUTPUT_DIR.into()),
            weights_dir: self.weights_dir.clone().unwrap_or_else(|| DEFAULT_WEIGHTS_DIR.into()),
            device: self.device.unwrap_or(DeviceRequest::Cpu),
            n_steps: DEFAULT_STEPS,
            seed: DEFAULT_SEED,
            height: None,
            width: None,
        })
    }

    fn edit_args(&self) -> Option<EditArgs> {
        Some(EditArgs {
            input_image: self.input_image.clone()?,
            edit: self.edit?,
            brightness: self.brightness.unwrap_or(0),
            contrast: self.contrast.unwrap_or(0),
            blend_image: self.blend_image.clone(),
            alpha: self.alpha.unwrap_or(DEFAULT_ALPHA),
            output_dir: self.output_dir.clone().unwrap_or_else(|| DEFAULT_OUTPUT_DIR.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_table() {
        assert_eq!(infer_intent(false, false, false), Intent::ShowHelp);
        assert_eq!(infer_intent(true, false, false), Intent::Generate);
        assert_eq!(infer_intent(false, true, true), Intent::Edit);
        // An edit only needs one of its two flags to be missing to fall
        // through to the other rows.
        assert_eq!(infer_intent(false, true, false), Intent::ShowHelp);
        assert_eq!(infer_intent(false, false, true), Intent::ShowHelp);
        assert_eq!(infer_intent(true, true, false), Intent::Generate);
        // A complete edit flag set wins over the prompt.
        assert_eq!(infer_intent(true, true, true), Intent::Edit);
    }

    #[test]
    fn parse_generate_subcommand() {
        let cli = Cli::try_parse_from([
            "sketch2image",
            "generate",
            "--prompt",
            "a minimalist japanese living room",
            "--sketch-path",
            "samples/room_sketch.png",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Generate(args)) => {
                assert_eq!(args.prompt, "a minimalist japanese living room");
                assert_eq!(args.sketch_path, Some(PathBuf::from("samples/room_sketch.png")));
                assert_eq!(args.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
                assert_eq!(args.n_steps, DEFAULT_STEPS);
            }
            other => panic!("expected a generate command, got {other:?}"),
        }
    }

    #[test]
    fn parse_edit_subcommand_with_negative_values() {
        let cli = Cli::try_parse_from([
            "sketch2image",
            "edit",
            "--input-image",
            "outputs/text_generated.png",
            "--edit",
            "brightness-contrast",
            "--brightness",
            "-20",
            "--contrast",
            "-10",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Edit(args)) => {
                assert_eq!(args.edit, EditKind::BrightnessContrast);
                assert_eq!(args.brightness, -20);
                assert_eq!(args.contrast, -10);
            }
            other => panic!("expected an edit command, got {other:?}"),
        }
    }

    #[test]
    fn inferred_flags_select_edit() {
        let cli = Cli::try_parse_from([
            "sketch2image",
            "--input-image",
            "a.png",
            "--edit",
            "blend",
            "--blend-image",
            "b.png",
            "--alpha",
            "0.25",
        ])
        .unwrap();
        assert!(cli.command.is_none());
        match cli.inferred.into_op() {
            InferredOp::Edit(args) => {
                assert_eq!(args.edit, EditKind::Blend);
                assert_eq!(args.blend_image, Some(PathBuf::from("b.png")));
                assert_eq!(args.alpha, 0.25);
            }
            other => panic!("expected an edit operation, got {other:?}"),
        }
    }

    #[test]
    fn inferred_flags_select_generate() {
        let cli = Cli::try_parse_from(["sketch2image", "--prompt", "a house"]).unwrap();
        match cli.inferred.into_op() {
            InferredOp::Generate(args) => {
                assert_eq!(args.prompt, "a house");
                assert_eq!(args.weights_dir, PathBuf::from(DEFAULT_WEIGHTS_DIR));
            }
            other => panic!("expected a generate operation, got {other:?}"),
        }
    }

    #[test]
    fn no_flags_fall_back_to_help() {
        let cli = Cli::try_parse_from(["sketch2image"]).unwrap();
        assert!(matches!(cli.inferred.into_op(), InferredOp::ShowHelp));
    }

    #[test]
    fn blend_without_second_image_is_rejected() {
        let cli = Cli::try_parse_from([
            "sketch2image",
            "edit",
            "--input-image",
            "a.png",
            "--edit",
            "blend",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Edit(args)) => {
                assert!(matches!(args.validate(), Err(Error::MissingBlendImage)));
            }
            other => panic!("expected an edit command, got {other:?}"),
        }
    }

    #[test]
    fn brightness_contrast_does_not_need_a_second_image() {
        let cli = Cli::try_parse_from([
            "sketch2image",
            "edit",
            "--input-image",
            "a.png",
            "--edit",
            "brightness-contrast",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Edit(args)) => assert!(args.validate().is_ok()),
            other => panic!("expected an edit command, got {other:?}"),
        }
    }
}
