use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use paralon_contracts::constraints::{ConstraintResolver, DEFAULT_ALPHA};
use paralon_contracts::requests::{
    GenerationRequest, ImageRef, Operation, RequestImages, RequestParams, UploadedImage,
};
use paralon_engine::{DryrunRemote, ImageStore, Orchestrator};

#[derive(Debug, Parser)]
pub struct BlendArgs {
    #[arg(long)]
    pub base: PathBuf,
    #[arg(long)]
    pub style: PathBuf,
    #[arg(long, default_value_t = DEFAULT_ALPHA)]
    pub alpha: f32,
    /// Root for the `uploads/` and `generated/` directories.
    #[arg(long, default_value = ".")]
    pub out: PathBuf,
}

/// Runs a style transfer on two local files through the same resolver,
/// compositor and store the server uses.
pub async fn run_blend(args: BlendArgs) -> Result<PathBuf> {
    let read = |path: &PathBuf| {
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))
    };
    let base = read(&args.base)?;
    let style = read(&args.style)?;

    let store = ImageStore::new(args.out.join("uploads"), args.out.join("generated"));
    let orchestrator = Orchestrator::new(
        ConstraintResolver::default(),
        Arc::new(DryrunRemote::new()),
        store,
    );
    let params = RequestParams {
        alpha: Some(args.alpha.to_string()),
        ..RequestParams::default()
    };
    let images = RequestImages {
        base_image: Some(ImageRef::Upload(UploadedImage::new(base, None))),
        style_image: Some(ImageRef::Upload(UploadedImage::new(style, None))),
        ..RequestImages::default()
    };

    let outcome = orchestrator
        .handle(GenerationRequest::new(Operation::StyleTransfer, params, images))
        .await?;
    outcome
        .assets
        .into_iter()
        .next()
        .map(|asset| asset.path)
        .context("style transfer produced no image")
}
