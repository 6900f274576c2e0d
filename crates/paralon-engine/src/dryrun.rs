use std::io::Cursor;

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use paralon_contracts::constraints::RemoteParams;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::remote::{RemoteError, RemoteImage, RemoteImages, RemoteInputs};

/// Offline stand-in for the remote service. Returns `n` solid-colour PNGs
/// whose colour is derived from the prompt and inputs, so repeated calls
/// with the same request render the same pixels.
#[derive(Debug, Clone, Default)]
pub struct DryrunRemote;

impl DryrunRemote {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RemoteImages for DryrunRemote {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn invoke(
        &self,
        params: &RemoteParams,
        inputs: &RemoteInputs,
    ) -> Result<Vec<RemoteImage>, RemoteError> {
        let operation = params.operation.label();
        let (width, height) = parse_dims(&params.size);
        let prompt = params.prompt.clone().unwrap_or_default();
        let seed_material = input_fingerprint(inputs);
        let n = params.n.max(1);

        let render = move || -> Result<Vec<RemoteImage>, RemoteError> {
            (0..n)
                .map(|idx| {
                    let color = color_from_prompt(&prompt, &seed_material, idx);
                    let bytes = render_png(width, height, color).map_err(|err| {
                        RemoteError::InvalidResponse {
                            operation,
                            message: format!("dryrun render failed: {err}"),
                        }
                    })?;
                    Ok(RemoteImage {
                        bytes,
                        mime_type: Some("image/png".to_string()),
                    })
                })
                .collect()
        };
        let images = tokio::task::spawn_blocking(render)
            .await
            .map_err(|err| RemoteError::InvalidResponse {
                operation,
                message: format!("dryrun render task failed: {err}"),
            })??;

        info!(
            operation,
            images = images.len(),
            width,
            height,
            fingerprint = %short_id(&images),
            "dryrun produced placeholder images"
        );
        Ok(images)
    }
}

/// `WxH` to pixel dimensions, falling back to 1024 on anything unparsable.
pub fn parse_dims(size: &str) -> (u32, u32) {
    let raw = size.trim().to_ascii_lowercase();
    if let Some((w, h)) = raw.split_once('x') {
        let width = w.trim().parse::<u32>().unwrap_or(1024);
        let height = h.trim().parse::<u32>().unwrap_or(1024);
        return (width.max(1), height.max(1));
    }
    (1024, 1024)
}

fn input_fingerprint(inputs: &RemoteInputs) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for image in [inputs.image.as_ref(), inputs.mask.as_ref()]
        .into_iter()
        .flatten()
    {
        hasher.update(&image.bytes);
    }
    hasher.finalize().to_vec()
}

fn color_from_prompt(prompt: &str, inputs: &[u8], idx: u32) -> Rgb<u8> {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(inputs);
    hasher.update(idx.to_be_bytes());
    let digest = hasher.finalize();
    Rgb([digest[0], digest[1], digest[2]])
}

fn render_png(width: u32, height: u32, color: Rgb<u8>) -> image::ImageResult<Vec<u8>> {
    let image = RgbImage::from_pixel(width, height, color);
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

fn short_id(images: &[RemoteImage]) -> String {
    let mut hasher = Sha256::new();
    for image in images {
        hasher.update(&image.bytes);
    }
    hex::encode(&hasher.finalize()[..4])
}
