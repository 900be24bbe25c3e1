// Media storage service: uploaded images on the local filesystem, served
// back under a public URL prefix.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::error::{AppError, Result};

pub const MAX_PROJECT_MEDIA_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_PROFILE_PHOTO_BYTES: usize = 5 * 1024 * 1024;

const ALLOWED_IMAGE_TYPES: [(&str, &str); 4] = [
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/webp", "webp"),
    ("image/gif", "gif"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    ProjectMedia,
    ProfilePhoto,
}

impl MediaKind {
    pub fn max_bytes(&self) -> usize {
        match self {
            MediaKind::ProjectMedia => MAX_PROJECT_MEDIA_BYTES,
            MediaKind::ProfilePhoto => MAX_PROFILE_PHOTO_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoredFile {
    pub url: String,
    pub path: String,
}

#[derive(Clone)]
pub struct StorageService {
    base_path: PathBuf,
    public_url: String,
}

impl StorageService {
    pub fn new(base_path: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create storage directory: {e}")))?;
        Ok(())
    }

    // Size and type are checked before anything touches the disk.
    pub fn validate(kind: MediaKind, content_type: &str, size: usize) -> Result<&'static str> {
        let extension = ALLOWED_IMAGE_TYPES
            .iter()
            .find(|(mime, _)| *mime == content_type)
            .map(|(_, ext)| *ext)
            .ok_or_else(|| AppError::UnsupportedMediaType(content_type.to_string()))?;

        if size == 0 {
            return Err(AppError::Validation("File is empty".to_string()));
        }
        if size > kind.max_bytes() {
            return Err(AppError::PayloadTooLarge {
                size,
                max: kind.max_bytes(),
            });
        }
        Ok(extension)
    }

    pub async fn upload(
        &self,
        kind: MediaKind,
        folder: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<StoredFile> {
        let extension = Self::validate(kind, content_type, data.len())?;
        let relative = format!("{}/{}.{extension}", folder.trim_matches('/'), Uuid::new_v4());
        let path = self.resolve(&relative)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to create directories: {e}")))?;
        }

        fs::write(&path, data)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to write file: {e}")))?;

        tracing::debug!(path = %relative, bytes = data.len(), "Media stored");
        Ok(StoredFile {
            url: format!("{}/{relative}", self.public_url),
            path: relative,
        })
    }

    pub async fn delete(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative)?;

        if !path.is_file() {
            return Err(AppError::NotFound(format!("File not found: {relative}")));
        }

        fs::remove_file(&path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to delete file: {e}")))?;

        Ok(())
    }

    /// Joins a relative storage path onto the base, rejecting anything that
    /// could escape it.
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let candidate = Path::new(relative);
        let safe = !relative.is_empty()
            && candidate
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(AppError::Validation(format!("Invalid path: {relative}")));
        }
        Ok(self.base_path.join(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_limits() {
        assert_eq!(
            StorageService::validate(MediaKind::ProjectMedia, "image/png", 1024).unwrap(),
            "png"
        );
        assert!(matches!(
            StorageService::validate(MediaKind::ProfilePhoto, "image/jpeg", 6 * 1024 * 1024),
            Err(AppError::PayloadTooLarge { .. })
        ));
        assert!(StorageService::validate(MediaKind::ProjectMedia, "image/jpeg", 6 * 1024 * 1024)
            .is_ok());
        assert!(matches!(
            StorageService::validate(MediaKind::ProjectMedia, "application/pdf", 10),
            Err(AppError::UnsupportedMediaType(_))
        ));
        assert!(StorageService::validate(MediaKind::ProjectMedia, "image/gif", 0).is_err());
    }

    #[tokio::test]
    async fn test_upload_then_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageService::new(dir.path(), "/media/");

        let stored = storage
            .upload(MediaKind::ProjectMedia, "projects/p1", "image/webp", b"RIFF")
            .await
            .unwrap();
        assert!(stored.path.starts_with("projects/p1/"));
        assert!(stored.path.ends_with(".webp"));
        assert_eq!(stored.url, format!("/media/{}", stored.path));
        assert!(dir.path().join(&stored.path).is_file());

        storage.delete(&stored.path).await.unwrap();
        assert!(!dir.path().join(&stored.path).exists());
        assert!(matches!(
            storage.delete(&stored.path).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageService::new(dir.path(), "/media");
        assert!(storage.delete("../etc/passwd").await.is_err());
        assert!(storage.delete("/etc/passwd").await.is_err());
        assert!(storage.delete("").await.is_err());
    }
}
