use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::{
    config::AppConfig,
    error::{AppError, AppResult},
};

pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Jpeg,
    Png,
    Pdf,
}

impl UploadKind {
    pub fn extension(self) -> &'static str {
        match self {
            UploadKind::Jpeg => "jpg",
            UploadKind::Png => "png",
            UploadKind::Pdf => "pdf",
        }
    }

    fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "image/jpeg" | "image/jpg" => Some(UploadKind::Jpeg),
            "image/png" => Some(UploadKind::Png),
            "application/pdf" => Some(UploadKind::Pdf),
            _ => None,
        }
    }

    fn from_magic(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(UploadKind::Jpeg)
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(UploadKind::Png)
        } else if bytes.starts_with(b"%PDF-") {
            Some(UploadKind::Pdf)
        } else {
            None
        }
    }
}

/// Where an upload belongs. Also the subdirectory it is stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadCategory {
    Receipts,
    Refunds,
    Expenses,
}

impl UploadCategory {
    pub fn dir_name(self) -> &'static str {
        match self {
            UploadCategory::Receipts => "receipts",
            UploadCategory::Refunds => "refunds",
            UploadCategory::Expenses => "expenses",
        }
    }
}

/// Accept JPEG, PNG or PDF up to 5 MB. The declared content type and the
/// file's leading bytes must agree.
pub fn validate_upload(content_type: Option<&str>, bytes: &[u8]) -> AppResult<UploadKind> {
    if bytes.is_empty() {
        return Err(AppError::BadRequest("Fail tidak boleh kosong.".to_string()));
    }
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(AppError::PayloadTooLarge(
            "Saiz fail melebihi had 5MB.".to_string(),
        ));
    }

    let unsupported =
        || AppError::UnsupportedMediaType("Hanya fail JPG, PNG atau PDF dibenarkan.".to_string());
    let declared = content_type
        .and_then(UploadKind::from_content_type)
        .ok_or_else(unsupported)?;
    let detected = UploadKind::from_magic(bytes).ok_or_else(unsupported)?;
    if declared != detected {
        return Err(AppError::UnsupportedMediaType(
            "Kandungan fail tidak sepadan dengan jenisnya.".to_string(),
        ));
    }
    Ok(detected)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    pub path: PathBuf,
    pub public_url: String,
}

pub fn storage_location(
    config: &AppConfig,
    category: UploadCategory,
    kind: UploadKind,
    id: Uuid,
) -> StoredUpload {
    let file_name = format!("{id}.{}", kind.extension());
    StoredUpload {
        path: Path::new(&config.upload_dir)
            .join(category.dir_name())
            .join(&file_name),
        public_url: format!(
            "{}/{}/{file_name}",
            config.upload_public_path,
            category.dir_name()
        ),
    }
}

/// Validate and persist an uploaded file, returning its public URL.
pub async fn store_upload(
    config: &AppConfig,
    category: UploadCategory,
    content_type: Option<&str>,
    bytes: &[u8],
) -> AppResult<String> {
    let kind = validate_upload(content_type, bytes)?;
    let stored = storage_location(config, category, kind, Uuid::new_v4());

    if let Some(parent) = stored.path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|error| {
            tracing::error!(
                error = %error,
                dir = %parent.display(),
                "Could not create upload directory"
            );
            AppError::Internal("Gagal menyimpan fail.".to_string())
        })?;
    }
    tokio::fs::write(&stored.path, bytes).await.map_err(|error| {
        tracing::error!(error = %error, path = %stored.path.display(), "Could not write upload");
        AppError::Internal("Gagal menyimpan fail.".to_string())
    })?;

    tracing::info!(path = %stored.path.display(), size = bytes.len(), "Upload stored");
    Ok(stored.public_url)
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{
        storage_location, store_upload, validate_upload, UploadCategory, UploadKind,
        MAX_UPLOAD_BYTES,
    };
    use crate::{config::AppConfig, error::AppError};

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];

    #[test]
    fn accepts_matching_type_and_magic() {
        assert_eq!(
            validate_upload(Some("image/png"), PNG).ok(),
            Some(UploadKind::Png)
        );
        assert_eq!(
            validate_upload(Some("image/jpeg"), &[0xFF, 0xD8, 0xFF, 0xE0]).ok(),
            Some(UploadKind::Jpeg)
        );
        assert_eq!(
            validate_upload(Some("application/pdf; charset=binary"), b"%PDF-1.7\n").ok(),
            Some(UploadKind::Pdf)
        );
    }

    #[test]
    fn rejects_spoofed_content() {
        assert!(matches!(
            validate_upload(Some("image/png"), b"%PDF-1.4"),
            Err(AppError::UnsupportedMediaType(_))
        ));
        assert!(matches!(
            validate_upload(Some("image/gif"), b"GIF89a"),
            Err(AppError::UnsupportedMediaType(_))
        ));
        assert!(matches!(
            validate_upload(None, PNG),
            Err(AppError::UnsupportedMediaType(_))
        ));
    }

    #[test]
    fn enforces_size_limit() {
        let mut big = b"%PDF-".to_vec();
        big.resize(MAX_UPLOAD_BYTES + 1, 0);
        assert!(matches!(
            validate_upload(Some("application/pdf"), &big),
            Err(AppError::PayloadTooLarge(_))
        ));

        big.truncate(MAX_UPLOAD_BYTES);
        assert!(validate_upload(Some("application/pdf"), &big).is_ok());
        assert!(validate_upload(Some("application/pdf"), &[]).is_err());
    }

    #[test]
    fn builds_paths_under_category() {
        let mut config = AppConfig::from_env();
        config.upload_dir = "/tmp/strata-uploads".to_string();
        config.upload_public_path = "/uploads".to_string();
        let id = Uuid::nil();

        let stored = storage_location(&config, UploadCategory::Receipts, UploadKind::Png, id);
        assert_eq!(
            stored.public_url,
            format!("/uploads/receipts/{id}.png")
        );
        assert!(stored.path.ends_with(format!("receipts/{id}.png")));
    }

    #[tokio::test]
    async fn writes_file_to_disk() {
        let dir = std::env::temp_dir().join(format!("strata-upload-test-{}", Uuid::new_v4()));
        let mut config = AppConfig::from_env();
        config.upload_dir = dir.to_string_lossy().into_owned();
        config.upload_public_path = "/uploads".to_string();

        let url = store_upload(&config, UploadCategory::Refunds, Some("image/png"), PNG)
            .await
            .expect("stored");
        assert!(url.starts_with("/uploads/refunds/"));
        let file_name = url.rsplit('/').next().expect("file name");
        let written = std::fs::read(dir.join("refunds").join(file_name)).expect("file exists");
        assert_eq!(written, PNG);

        let _ = std::fs::remove_dir_all(dir);
    }
}
