use std::fmt;

use serde::{Deserialize, Serialize};

use crate::assets::AssetId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Generate,
    Edit,
    Variation,
    StyleTransfer,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Generate => "generate",
            Operation::Edit => "edit",
            Operation::Variation => "variation",
            Operation::StyleTransfer => "style_transfer",
        }
    }

    /// The remote endpoint family this operation dispatches to, if any.
    /// Style transfer is composited locally and never calls out.
    pub fn remote(&self) -> Option<RemoteOperation> {
        match self {
            Operation::Generate => Some(RemoteOperation::Generation),
            Operation::Edit => Some(RemoteOperation::Edit),
            Operation::Variation => Some(RemoteOperation::Variation),
            Operation::StyleTransfer => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteOperation {
    Generation,
    Edit,
    Variation,
}

impl RemoteOperation {
    pub fn path(&self) -> &'static str {
        match self {
            RemoteOperation::Generation => "/images/generations",
            RemoteOperation::Edit => "/images/edits",
            RemoteOperation::Variation => "/images/variations",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RemoteOperation::Generation => "generation",
            RemoteOperation::Edit => "edit",
            RemoteOperation::Variation => "variation",
        }
    }
}

/// Raw text fields exactly as the form submitted them. Numbers stay textual
/// so the resolver can report malformed values instead of a parse failure
/// happening somewhere upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams {
    pub model: Option<String>,
    pub size: Option<String>,
    pub quality: Option<String>,
    pub n: Option<String>,
    pub prompt: Option<String>,
    pub alpha: Option<String>,
}

impl RequestParams {
    /// Blank form fields are treated as absent.
    pub fn normalized(self) -> Self {
        Self {
            model: non_blank(self.model),
            size: non_blank(self.size),
            quality: non_blank(self.quality),
            n: non_blank(self.n),
            prompt: non_blank(self.prompt),
            alpha: non_blank(self.alpha),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

impl UploadedImage {
    pub fn new(bytes: Vec<u8>, mime_type: Option<String>) -> Self {
        Self { bytes, mime_type }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Upload(UploadedImage),
    Stored(AssetId),
    /// A submitted id that cannot name any stored asset. It still fills
    /// its slot so validation runs; staging reports it as not found.
    Unknown(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestImages {
    pub image: Option<ImageRef>,
    pub mask: Option<ImageRef>,
    pub base_image: Option<ImageRef>,
    pub style_image: Option<ImageRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    operation: Operation,
    params: RequestParams,
    images: RequestImages,
}

impl GenerationRequest {
    pub fn new(operation: Operation, params: RequestParams, images: RequestImages) -> Self {
        Self {
            operation,
            params: params.normalized(),
            images,
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn params(&self) -> &RequestParams {
        &self.params
    }

    pub fn images(&self) -> &RequestImages {
        &self.images
    }

    pub fn into_images(self) -> RequestImages {
        self.images
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|trimmed| !trimmed.is_empty())
}
