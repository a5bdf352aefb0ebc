//! # sketch2image
//!
//! A command line tool around Stable Diffusion v1.5: generate images from
//! a text prompt, constrain the structure with a sketch through
//! ControlNet, and post-process the results with simple
//! brightness/contrast and blending operations.
//!
//! The diffusion pipeline comes from the
//! [diffusers](https://github.com/LaurentMazare/diffusers-rs) crate; this
//! crate only wires pretrained weights, the command line and the image
//! files together.

pub mod cli;
pub mod device;
pub mod edit;
pub mod error;
pub mod generate;
