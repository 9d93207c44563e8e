//! Image uploads stored on local disk and served under `/uploads`.

use std::path::{Component, Path, PathBuf};

use actix_multipart::Multipart;
use futures_util::TryStreamExt;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

pub const PUBLIC_PREFIX: &str = "/uploads";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Avatar,
    EventImage,
}

impl UploadKind {
    pub fn field_name(&self) -> &'static str {
        match self {
            UploadKind::Avatar => "avatar",
            UploadKind::EventImage => "image",
        }
    }

    fn dir(&self) -> &'static str {
        match self {
            UploadKind::Avatar => "avatars",
            UploadKind::EventImage => "events",
        }
    }

    pub fn max_bytes(&self) -> usize {
        match self {
            UploadKind::Avatar => 5 * 1024 * 1024,
            UploadKind::EventImage => 10 * 1024 * 1024,
        }
    }
}

pub fn extension_for(mime: &str) -> Option<&'static str> {
    match mime {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

/// Maps a stored `/uploads/...` reference back to a file under `root`.
/// Anything that could escape the upload directory is refused.
pub fn resolve(root: &Path, reference: &str) -> Option<PathBuf> {
    let relative = reference.strip_prefix(PUBLIC_PREFIX)?.trim_start_matches('/');
    let relative = Path::new(relative);
    if relative.as_os_str().is_empty() || !relative.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(root.join(relative))
}

/// Reads the image field for `kind` out of the multipart body, writes it to
/// `<root>/<dir>/<uuid>.<ext>` and returns the public reference.
pub async fn save_image(mut payload: Multipart, kind: UploadKind, root: &Path) -> ApiResult<String> {
    while let Some(mut field) = payload.try_next().await? {
        if field.name() != Some(kind.field_name()) {
            while field.try_next().await?.is_some() {}
            continue;
        }

        let mime = field.content_type().map(|m| m.essence_str().to_string()).unwrap_or_default();
        let ext = extension_for(&mime).ok_or_else(|| {
            ApiError::UnsupportedMediaType("Only JPEG, PNG, GIF and WebP images are accepted".to_string())
        })?;

        let mut bytes = Vec::new();
        while let Some(chunk) = field.try_next().await? {
            if bytes.len() + chunk.len() > kind.max_bytes() {
                return Err(ApiError::PayloadTooLarge(format!(
                    "Image must be at most {} MiB",
                    kind.max_bytes() / (1024 * 1024)
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        if bytes.is_empty() {
            return Err(ApiError::bad_request("Uploaded file is empty"));
        }

        let dir = root.join(kind.dir());
        tokio::fs::create_dir_all(&dir).await?;
        let file_name = format!("{}.{}", Uuid::new_v4(), ext);
        tokio::fs::write(dir.join(&file_name), &bytes).await?;

        log::info!("Stored {} upload {} ({} bytes)", kind.dir(), file_name, bytes.len());
        return Ok(format!("{}/{}/{}", PUBLIC_PREFIX, kind.dir(), file_name));
    }

    Err(ApiError::bad_request(format!("Missing file field '{}'", kind.field_name())))
}

/// Best-effort removal of a previously stored file.
pub async fn remove_stored(root: &Path, reference: Option<String>) {
    let Some(reference) = reference else {
        return;
    };
    let Some(path) = resolve(root, &reference) else {
        log::warn!("Not removing unexpected upload reference {}", reference);
        return;
    };
    if let Err(e) = tokio::fs::remove_file(&path).await {
        log::warn!("Could not remove old upload {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_web_images_are_accepted() {
        assert_eq!(extension_for("image/jpeg"), Some("jpg"));
        assert_eq!(extension_for("image/webp"), Some("webp"));
        assert_eq!(extension_for("image/svg+xml"), None);
        assert_eq!(extension_for("application/pdf"), None);
    }

    #[test]
    fn size_ceilings() {
        assert_eq!(UploadKind::Avatar.max_bytes(), 5 * 1024 * 1024);
        assert_eq!(UploadKind::EventImage.max_bytes(), 10 * 1024 * 1024);
    }

    #[test]
    fn references_resolve_inside_the_root() {
        let root = Path::new("/srv/uploads");
        assert_eq!(
            resolve(root, "/uploads/avatars/a.png"),
            Some(PathBuf::from("/srv/uploads/avatars/a.png"))
        );
        assert_eq!(resolve(root, "/uploads/../etc/passwd"), None);
        assert_eq!(resolve(root, "/static/a.png"), None);
        assert_eq!(resolve(root, "/uploads/"), None);
    }
}
