use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const HASH_PREFIX_CHARS: usize = 16;
pub const TOKEN_CHARS: usize = 12;

/// `<16 hex digest chars>-<12 hex random chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetId(String);

impl AssetId {
    /// Builds an id from a content digest and a random token. Only the
    /// leading digest bytes and the low 48 bits of the token are kept.
    pub fn compose(digest: &[u8], token: u128) -> Self {
        let prefix: String = digest
            .iter()
            .take(HASH_PREFIX_CHARS / 2)
            .map(|byte| format!("{byte:02x}"))
            .collect();
        let token = token & 0xffff_ffff_ffff;
        Self(format!("{prefix:0<16}-{token:012x}"))
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (digest, token) = raw.split_once('-')?;
        if digest.len() != HASH_PREFIX_CHARS || token.len() != TOKEN_CHARS {
            return None;
        }
        let is_lower_hex = |value: &str| {
            value
                .chars()
                .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch))
        };
        if !is_lower_hex(digest) || !is_lower_hex(token) {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn digest_prefix(&self) -> &str {
        &self.0[..HASH_PREFIX_CHARS]
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AssetId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid asset id '{value}'"))
    }
}

impl From<AssetId> for String {
    fn from(value: AssetId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetOrigin {
    Uploaded,
    Generated,
}

impl AssetOrigin {
    /// URL prefix the HTTP layer serves this origin under.
    pub fn route_prefix(&self) -> &'static str {
        match self {
            AssetOrigin::Uploaded => "/uploads",
            AssetOrigin::Generated => "/generated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub id: AssetId,
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub origin: AssetOrigin,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl ImageAsset {
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.id, extension_for_mime(&self.mime_type))
    }

    pub fn public_path(&self) -> String {
        format!("{}/{}", self.origin.route_prefix(), self.file_name())
    }
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    let lowered = mime.trim().to_ascii_lowercase();
    match lowered.split(';').next().unwrap_or_default().trim() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        "image/tiff" => "tiff",
        _ => "bin",
    }
}

pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "tiff" | "tif" => Some("image/tiff"),
        "bin" => Some("application/octet-stream"),
        _ => None,
    }
}

/// Extensions the store may have written, in lookup order.
pub const KNOWN_EXTENSIONS: [&str; 7] = ["png", "jpg", "webp", "gif", "bmp", "tiff", "bin"];
