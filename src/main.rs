use std::fs;

use anyhow::Result;
use clap::{CommandFactory, Parser};

use sketch2image::cli::{Cli, Command, EditArgs, EditKind, GenerateArgs, InferredOp};
use sketch2image::edit;
use sketch2image::error::Error;
use sketch2image::generate::{self, GenerationBackend, GenerationRequest};

// Fixed output names inside the output directory.
const TEXT_OUTPUT: &str = "text_generated.png";
const SKETCH_OUTPUT: &str = "sketch_generated.png";
const EDIT_OUTPUT: &str = "edited.png";
const BLEND_OUTPUT: &str = "blended.png";

fn run_generation(args: GenerateArgs) -> Result<()> {
    fs::create_dir_all(&args.output_dir)?;
    tch::maybe_init_cuda();
    println!("Cuda available: {}", tch::Cuda::is_available());
    println!("Cudnn available: {}", tch::Cuda::cudnn_is_available());
    println!("MPS available: {}", tch::utils::has_mps());

    let device = args.device.resolve();
    let backend = GenerationBackend::new(&args.weights_dir);
    let output =
        args.output_dir.join(if args.sketch_path.is_some() { SKETCH_OUTPUT } else { TEXT_OUTPUT });
    let request = GenerationRequest {
        prompt: args.prompt,
        negative_prompt: args.negative_prompt,
        output,
        device,
        n_steps: args.n_steps,
        seed: args.seed,
        height: args.height,
        width: args.width,
    };
    let result = match &args.sketch_path {
        Some(sketch) => {
            generate::sketch_to_image(&backend, &request, sketch, args.sketch_preprocess)?
        }
        None => generate::text_to_image(&backend, &request)?,
    };
    match result {
        Some(path) => println!("Generated image written to {}.", path.display()),
        None => println!("Generation did not run, see the messages above."),
    }
    Ok(())
}

fn run_edit(args: EditArgs) -> Result<()> {
    args.validate()?;
    fs::create_dir_all(&args.output_dir)?;
    match args.edit {
        EditKind::BrightnessContrast => {
            let output = args.output_dir.join(EDIT_OUTPUT);
            let path = edit::adjust_brightness_contrast(
                &args.input_image,
                &output,
                args.brightness,
                args.contrast,
            )?;
            println!("Adjusted image written to {}.", path.display());
        }
        EditKind::Blend => {
            let blend_image = args.blend_image.as_deref().ok_or(Error::MissingBlendImage)?;
            let output = args.output_dir.join(BLEND_OUTPUT);
            let path = edit::blend_images(&args.input_image, blend_image, &output, args.alpha)?;
            println!("Blended image written to {}.", path.display());
        }
    }
    Ok(())
}

fn show_help() -> Result<()> {
    Cli::command().print_help()?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Generate(args)) => run_generation(args),
        Some(Command::Edit(args)) => run_edit(args),
        None => match cli.inferred.into_op() {
            InferredOp::Generate(args) => run_generation(args),
            InferredOp::Edit(args) => run_edit(args),
            InferredOp::ShowHelp => show_help(),
        },
    }
}
