use std::fmt;
use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageFormat, RgbaImage};
use paralon_contracts::assets::{AssetOrigin, ImageAsset};
use thiserror::Error;
use tracing::debug;

use crate::store::{ImageStore, StorageError};

const JPEG_QUALITY: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeInput {
    Base,
    Style,
}

impl fmt::Display for CompositeInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompositeInput::Base => f.write_str("base"),
            CompositeInput::Style => f.write_str("style"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CompositorError {
    #[error("alpha {0} is outside 0.0..=1.0")]
    InvalidAlpha(f32),
    #[error("failed to decode {input} image: {source}")]
    Decode {
        input: CompositeInput,
        #[source]
        source: ImageError,
    },
    #[error("failed to encode composite as {format}: {source}")]
    Encode {
        format: &'static str,
        #[source]
        source: ImageError,
    },
    #[error("composite task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct CompositeSpec {
    base: ImageAsset,
    style: ImageAsset,
    alpha: f32,
}

impl CompositeSpec {
    pub fn new(base: ImageAsset, style: ImageAsset, alpha: f32) -> Result<Self, CompositorError> {
        if !alpha.is_finite() || !(0.0..=1.0).contains(&alpha) {
            return Err(CompositorError::InvalidAlpha(alpha));
        }
        Ok(Self { base, style, alpha })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Decodes, blends and re-encodes in one blocking call. The output keeps
/// the base image's dimensions and, where it can be re-encoded, its format.
pub fn blend_bytes(base: &[u8], style: &[u8], alpha: f32) -> Result<EncodedImage, CompositorError> {
    if !alpha.is_finite() || !(0.0..=1.0).contains(&alpha) {
        return Err(CompositorError::InvalidAlpha(alpha));
    }
    let base_format = image::guess_format(base).ok();
    let base_image = decode(base, CompositeInput::Base)?.to_rgba8();
    let style_image = decode(style, CompositeInput::Style)?.to_rgba8();

    let blended = blend_rgba(&base_image, &style_image, alpha);
    let (width, height) = blended.dimensions();
    let (bytes, mime_type) = encode(blended, base_format)?;
    Ok(EncodedImage {
        bytes,
        mime_type,
        width,
        height,
    })
}

/// `out = round((1 - alpha) * base + alpha * style)` on every channel,
/// alpha included. The style image is resampled to the base dimensions
/// first.
pub fn blend_rgba(base: &RgbaImage, style: &RgbaImage, alpha: f32) -> RgbaImage {
    let (width, height) = base.dimensions();
    let resized;
    let style = if style.dimensions() == (width, height) {
        style
    } else {
        resized = image::imageops::resize(style, width, height, FilterType::Lanczos3);
        &resized
    };

    let keep = 1.0 - alpha;
    let mut out = RgbaImage::new(width, height);
    for ((dst, b), s) in out.pixels_mut().zip(base.pixels()).zip(style.pixels()) {
        for channel in 0..4 {
            let value = keep * f32::from(b.0[channel]) + alpha * f32::from(s.0[channel]);
            dst.0[channel] = value.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

fn decode(bytes: &[u8], input: CompositeInput) -> Result<DynamicImage, CompositorError> {
    image::load_from_memory(bytes).map_err(|source| CompositorError::Decode { input, source })
}

fn encode(
    image: RgbaImage,
    base_format: Option<ImageFormat>,
) -> Result<(Vec<u8>, &'static str), CompositorError> {
    let format = match base_format {
        Some(
            format @ (ImageFormat::Png
            | ImageFormat::Jpeg
            | ImageFormat::WebP
            | ImageFormat::Bmp
            | ImageFormat::Tiff),
        ) => format,
        _ => ImageFormat::Png,
    };
    let label = format.extensions_str().first().copied().unwrap_or("png");
    let encode_err = |source: ImageError| CompositorError::Encode {
        format: label,
        source,
    };

    let mut out = Cursor::new(Vec::new());
    if format == ImageFormat::Jpeg {
        let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
        let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
        DynamicImage::ImageRgb8(rgb)
            .write_with_encoder(encoder)
            .map_err(encode_err)?;
    } else {
        DynamicImage::ImageRgba8(image)
            .write_to(&mut out, format)
            .map_err(encode_err)?;
    }
    Ok((out.into_inner(), format.to_mime_type()))
}

/// Blends two stored assets and persists the result as a generated asset.
#[derive(Debug, Clone)]
pub struct StyleCompositor {
    store: ImageStore,
}

impl StyleCompositor {
    pub fn new(store: ImageStore) -> Self {
        Self { store }
    }

    pub async fn composite(&self, spec: CompositeSpec) -> Result<ImageAsset, CompositorError> {
        let alpha = spec.alpha;
        let base = spec.base.bytes;
        let style = spec.style.bytes;
        let encoded = tokio::task::spawn_blocking(move || blend_bytes(&base, &style, alpha))
            .await
            .map_err(|err| CompositorError::Task(err.to_string()))??;

        debug!(
            alpha,
            width = encoded.width,
            height = encoded.height,
            mime = encoded.mime_type,
            "composited style transfer"
        );
        let asset = self
            .store
            .put(encoded.bytes, encoded.mime_type, AssetOrigin::Generated)
            .await?;
        Ok(asset)
    }
}
