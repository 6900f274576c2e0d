use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use paralon_contracts::assets::{
    extension_for_mime, mime_for_extension, AssetId, AssetOrigin, ImageAsset, KNOWN_EXTENSIONS,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("asset '{0}' not found")]
    NotFound(String),
    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io<'a>(
        action: &'static str,
        path: &'a Path,
    ) -> impl FnOnce(std::io::Error) -> Self + 'a {
        move |source| StorageError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Two flat directories of content-addressed files: staged uploads and
/// generated outputs. Nothing else is persisted.
#[derive(Debug, Clone)]
pub struct ImageStore {
    upload_dir: PathBuf,
    generated_dir: PathBuf,
}

impl ImageStore {
    pub fn new(upload_dir: impl Into<PathBuf>, generated_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            generated_dir: generated_dir.into(),
        }
    }

    pub fn dir_for(&self, origin: AssetOrigin) -> &Path {
        match origin {
            AssetOrigin::Uploaded => &self.upload_dir,
            AssetOrigin::Generated => &self.generated_dir,
        }
    }

    /// Writes to a hidden part file and renames it into place, so the final
    /// path only ever holds complete payloads.
    pub async fn put(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
        origin: AssetOrigin,
    ) -> Result<ImageAsset, StorageError> {
        let dir = self.dir_for(origin);
        fs::create_dir_all(dir)
            .await
            .map_err(StorageError::io("create", dir))?;

        let id = new_asset_id(&bytes);
        let ext = extension_for_mime(mime_type);
        let final_path = dir.join(format!("{id}.{ext}"));
        let part_path = dir.join(format!(".{id}.part"));
        publish(&bytes, &part_path, &final_path).await?;

        debug!(
            asset_id = %id,
            origin = ?origin,
            bytes = bytes.len(),
            path = %final_path.display(),
            "stored image asset"
        );

        Ok(ImageAsset {
            id,
            bytes,
            mime_type: normalized_mime(mime_type, ext),
            origin,
            path: final_path,
            created_at: Utc::now(),
        })
    }

    /// Looks the id up in both directories. Malformed ids are reported as
    /// unknown rather than touching the filesystem.
    pub async fn get(&self, id: &str) -> Result<ImageAsset, StorageError> {
        let Some(asset_id) = AssetId::parse(id) else {
            return Err(StorageError::NotFound(id.to_string()));
        };
        for origin in [AssetOrigin::Generated, AssetOrigin::Uploaded] {
            for ext in KNOWN_EXTENSIONS {
                if let Some(asset) = self.read_asset(&asset_id, ext, origin).await? {
                    return Ok(asset);
                }
            }
        }
        Err(StorageError::NotFound(id.to_string()))
    }

    /// Resolves a public file name (`<id>.<ext>`) within one origin directory.
    pub async fn get_file(
        &self,
        origin: AssetOrigin,
        file_name: &str,
    ) -> Result<ImageAsset, StorageError> {
        let not_found = || StorageError::NotFound(file_name.to_string());
        let (stem, ext) = file_name.rsplit_once('.').ok_or_else(not_found)?;
        let asset_id = AssetId::parse(stem).ok_or_else(not_found)?;
        if !KNOWN_EXTENSIONS.contains(&ext) {
            return Err(not_found());
        }
        self.read_asset(&asset_id, ext, origin)
            .await?
            .ok_or_else(not_found)
    }

    /// Removes an asset written earlier in the same request. Only used to
    /// roll back sibling outputs when a request fails part-way.
    pub async fn discard(&self, asset: &ImageAsset) -> Result<(), StorageError> {
        match fs::remove_file(&asset.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io {
                action: "remove",
                path: asset.path.clone(),
                source: err,
            }),
        }
    }

    async fn read_asset(
        &self,
        id: &AssetId,
        ext: &str,
        origin: AssetOrigin,
    ) -> Result<Option<ImageAsset>, StorageError> {
        let path = self.dir_for(origin).join(format!("{id}.{ext}"));
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StorageError::Io {
                    action: "read",
                    path,
                    source: err,
                })
            }
        };
        let created_at = fs::metadata(&path)
            .await
            .ok()
            .and_then(|meta| meta.modified().ok())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);
        Ok(Some(ImageAsset {
            id: id.clone(),
            bytes,
            mime_type: mime_for_extension(ext)
                .unwrap_or("application/octet-stream")
                .to_string(),
            origin,
            path,
            created_at,
        }))
    }
}

/// Best mime type for a payload: sniffed from the bytes when they are a
/// recognizable image, otherwise the declared type, otherwise PNG.
pub fn sniff_mime(bytes: &[u8], declared: Option<&str>) -> String {
    if let Ok(format) = image::guess_format(bytes) {
        return format.to_mime_type().to_string();
    }
    declared
        .map(str::trim)
        .filter(|value| value.starts_with("image/"))
        .map(str::to_string)
        .unwrap_or_else(|| "image/png".to_string())
}

/// Writes `bytes` to `part_path` and renames it to `final_path`. On any
/// failure, or if the future is dropped, the part file is removed.
async fn publish(bytes: &[u8], part_path: &Path, final_path: &Path) -> Result<(), StorageError> {
    let mut guard = PartFile::new(part_path.to_path_buf());
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(part_path)
        .await
        .map_err(StorageError::io("create", part_path))?;
    file.write_all(bytes)
        .await
        .map_err(StorageError::io("write", part_path))?;
    file.sync_all()
        .await
        .map_err(StorageError::io("sync", part_path))?;
    drop(file);
    fs::rename(part_path, final_path)
        .await
        .map_err(StorageError::io("publish", final_path))?;
    guard.commit();
    Ok(())
}

fn new_asset_id(bytes: &[u8]) -> AssetId {
    let digest = Sha256::digest(bytes);
    AssetId::compose(&digest, uuid::Uuid::new_v4().as_u128())
}

fn normalized_mime(declared: &str, ext: &str) -> String {
    mime_for_extension(ext)
        .filter(|_| ext != "bin")
        .map(str::to_string)
        .unwrap_or_else(|| declared.trim().to_string())
}

/// Deletes the part file on drop unless the rename already published it.
struct PartFile {
    path: PathBuf,
    committed: bool,
}

impl PartFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use paralon_contracts::assets::AssetOrigin;

    use super::{publish, sniff_mime, ImageStore, PartFile, StorageError};

    fn store_in(root: &std::path::Path) -> ImageStore {
        ImageStore::new(root.join("uploads"), root.join("generated"))
    }

    #[tokio::test]
    async fn directories_are_created_lazily() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = store_in(temp.path());
        assert!(!temp.path().join("uploads").exists());
        assert!(!temp.path().join("generated").exists());

        store
            .put(b"generated".to_vec(), "image/png", AssetOrigin::Generated)
            .await?;
        assert!(temp.path().join("generated").is_dir());
        assert!(!temp.path().join("uploads").exists());
        Ok(())
    }

    #[tokio::test]
    async fn put_then_get_returns_same_bytes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = store_in(temp.path());
        let asset = store
            .put(b"payload".to_vec(), "image/jpeg", AssetOrigin::Uploaded)
            .await?;
        assert!(asset.path.starts_with(temp.path().join("uploads")));
        assert_eq!(asset.file_name(), format!("{}.jpg", asset.id));
        assert_eq!(asset.public_path(), format!("/uploads/{}.jpg", asset.id));

        let fetched = store.get(asset.id.as_str()).await?;
        assert_eq!(fetched.bytes, b"payload".to_vec());
        assert_eq!(fetched.mime_type, "image/jpeg");
        assert_eq!(fetched.origin, AssetOrigin::Uploaded);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_not_found() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = store_in(temp.path());
        for id in ["0123456789abcdef-0123456789ab", "../secret", ""] {
            match store.get(id).await {
                Err(StorageError::NotFound(missing)) => assert_eq!(missing, id),
                other => panic!("expected NotFound for {id:?}, got {other:?}"),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_puts_never_share_a_path() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = store_in(temp.path());
        let mut tasks = Vec::new();
        for idx in 0..24u8 {
            let store = store.clone();
            // Half the payloads repeat so identical content is covered too.
            let payload = vec![idx % 12; 64];
            tasks.push(tokio::spawn(async move {
                store
                    .put(payload, "image/png", AssetOrigin::Generated)
                    .await
            }));
        }

        let mut ids = HashSet::new();
        let mut paths = HashSet::new();
        for task in tasks {
            let asset = task.await??;
            assert!(ids.insert(asset.id.clone()));
            assert!(paths.insert(asset.path.clone()));
        }

        let leftovers: Vec<_> = std::fs::read_dir(temp.path().join("generated"))?
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(paths.len(), 24);
        Ok(())
    }

    #[tokio::test]
    async fn distinct_payloads_get_distinct_digest_prefixes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = store_in(temp.path());
        let a = store
            .put(b"first".to_vec(), "image/png", AssetOrigin::Generated)
            .await?;
        let b = store
            .put(b"second".to_vec(), "image/png", AssetOrigin::Generated)
            .await?;
        assert_ne!(a.id.digest_prefix(), b.id.digest_prefix());
        Ok(())
    }

    #[tokio::test]
    async fn get_file_is_scoped_to_origin_directory() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = store_in(temp.path());
        let asset = store
            .put(b"img".to_vec(), "image/png", AssetOrigin::Generated)
            .await?;

        let found = store
            .get_file(AssetOrigin::Generated, &asset.file_name())
            .await?;
        assert_eq!(found.id, asset.id);

        assert!(matches!(
            store
                .get_file(AssetOrigin::Uploaded, &asset.file_name())
                .await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store
                .get_file(AssetOrigin::Generated, "../generated/evil.png")
                .await,
            Err(StorageError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn discard_removes_the_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = store_in(temp.path());
        let asset = store
            .put(b"gone".to_vec(), "image/png", AssetOrigin::Generated)
            .await?;
        store.discard(&asset).await?;
        assert!(!asset.path.exists());
        store.discard(&asset).await?;
        assert!(matches!(
            store.get(asset.id.as_str()).await,
            Err(StorageError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn failed_publish_leaves_no_part_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let part = temp.path().join(".asset.part");
        let target = temp.path().join("asset.png");
        std::fs::create_dir(&target)?;
        std::fs::write(target.join("occupied"), b"x")?;

        let err = publish(b"payload", &part, &target).await.unwrap_err();
        assert!(matches!(err, StorageError::Io { action: "publish", .. }));
        assert!(!part.exists());
        assert!(target.is_dir());

        let names: Vec<_> = std::fs::read_dir(temp.path())?
            .map(|entry| entry.map(|entry| entry.file_name()))
            .collect::<Result<_, _>>()?;
        assert_eq!(names, vec![std::ffi::OsString::from("asset.png")]);
        Ok(())
    }

    #[test]
    fn part_file_is_removed_unless_committed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let abandoned = temp.path().join(".abandoned.part");
        std::fs::write(&abandoned, b"half")?;
        drop(PartFile::new(abandoned.clone()));
        assert!(!abandoned.exists());

        let kept = temp.path().join(".kept.part");
        std::fs::write(&kept, b"whole")?;
        let mut guard = PartFile::new(kept.clone());
        guard.commit();
        drop(guard);
        assert!(kept.exists());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_put_never_exposes_a_partial_asset() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = store_in(temp.path());
        let payload = vec![7u8; 256 * 1024];
        let put = store.put(payload.clone(), "image/png", AssetOrigin::Generated);
        let _ = tokio::time::timeout(std::time::Duration::ZERO, put).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let dir = temp.path().join("generated");
        if dir.exists() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                let name = path.file_name().unwrap().to_string_lossy().into_owned();
                if name.ends_with(".png") {
                    assert_eq!(std::fs::read(&path)?, payload);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn sniff_mime_prefers_magic_bytes() {
        let png_magic = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(sniff_mime(&png_magic, Some("image/jpeg")), "image/png");
        assert_eq!(sniff_mime(b"????", Some("image/webp")), "image/webp");
        assert_eq!(sniff_mime(b"????", Some("text/html")), "image/png");
        assert_eq!(sniff_mime(b"????", None), "image/png");
    }
}
