use std::path::Path;

use axum::extract::Multipart;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::cleanup::TempFile;

const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "webp", "bmp", "tif", "tiff", "gif"];

/// An uploaded image persisted to the working directory. The temp file is
/// owned by the guard; dropping the struct deletes it.
#[derive(Debug)]
pub struct UploadedImage {
    pub file: TempFile,
    pub original_name: String,
    pub size_bytes: usize,
}

/// Text fields that may accompany the image on the processing endpoints.
/// All optional; each endpoint validates the subset it cares about.
#[derive(Debug, Default, Clone)]
pub struct ImageFormFields {
    pub fingerprint: Option<String>,
    pub scale: Option<String>,
    pub model_type: Option<String>,
    pub resize_type: Option<String>,
    pub percentage: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub maintain_aspect: Option<String>,
    pub quality: Option<String>,
    pub format: Option<String>,
}

#[derive(Debug)]
pub struct ImageUploadRequest {
    pub image: UploadedImage,
    pub fields: ImageFormFields,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("No file uploaded.")]
    MissingFile,
    #[error("Only image files are supported")]
    UnsupportedFileType,
    #[error("File exceeds upload limit")]
    FileTooLarge,
    #[error("Failed to parse upload")]
    MultipartError,
    #[error("Failed to persist upload")]
    IoError,
}

/// Drains the multipart stream, writing the `image` field to a uuid-named
/// file under `work_dir` and collecting every known text field. Fields
/// after the file are still read, so a trailing `fingerprint` works.
pub async fn save_image_from_multipart(
    mut multipart: Multipart,
    work_dir: &Path,
    max_size_bytes: usize,
) -> Result<ImageUploadRequest, UploadError> {
    let mut image: Option<UploadedImage> = None;
    let mut fields = ImageFormFields::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| UploadError::MultipartError)?
    {
        let field_name = field.name().map(ToString::to_string);
        match field_name.as_deref() {
            Some("image") => {
                if image.is_some() {
                    continue;
                }

                let original_name = field
                    .file_name()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "image".to_string());
                let mime_type = field.content_type().map(ToString::to_string);

                if !is_image(mime_type.as_deref(), &original_name) {
                    return Err(UploadError::UnsupportedFileType);
                }

                let extension = Path::new(&original_name)
                    .extension()
                    .and_then(|value| value.to_str())
                    .map(|value| value.to_ascii_lowercase())
                    .unwrap_or_else(|| "img".to_string());
                let temp_path =
                    work_dir.join(format!("upload-{}.{}", Uuid::new_v4(), extension));

                let mut file = tokio::fs::File::create(&temp_path)
                    .await
                    .map_err(|_| UploadError::IoError)?;
                let guard = TempFile::new(temp_path);

                let mut total_size = 0usize;
                let mut field = field;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|_| UploadError::MultipartError)?
                {
                    total_size += chunk.len();
                    if total_size > max_size_bytes {
                        // guard drop removes the partial file
                        return Err(UploadError::FileTooLarge);
                    }
                    file.write_all(&chunk)
                        .await
                        .map_err(|_| UploadError::IoError)?;
                }

                file.flush().await.map_err(|_| UploadError::IoError)?;

                image = Some(UploadedImage {
                    file: guard,
                    original_name,
                    size_bytes: total_size,
                });
            }
            Some(name) => {
                let slot = match name {
                    "fingerprint" => &mut fields.fingerprint,
                    "scale" | "model" => &mut fields.scale,
                    "modelType" => &mut fields.model_type,
                    "resizeType" => &mut fields.resize_type,
                    "percentage" => &mut fields.percentage,
                    "width" => &mut fields.width,
                    "height" => &mut fields.height,
                    "maintainAspect" => &mut fields.maintain_aspect,
                    "quality" => &mut fields.quality,
                    "format" => &mut fields.format,
                    _ => continue,
                };

                let value = field
                    .text()
                    .await
                    .map_err(|_| UploadError::MultipartError)?;
                let trimmed = value.trim();
                if !trimmed.is_empty() && slot.is_none() {
                    *slot = Some(trimmed.to_string());
                }
            }
            None => {}
        }
    }

    let image = image.ok_or(UploadError::MissingFile)?;

    Ok(ImageUploadRequest { image, fields })
}

fn is_image(mime_type: Option<&str>, file_name: &str) -> bool {
    if let Some(mime_type) = mime_type {
        if mime_type.to_ascii_lowercase().starts_with("image/") {
            return true;
        }
    }

    Path::new(&file_name.to_ascii_lowercase())
        .extension()
        .and_then(|value| value.to_str())
        .map(|extension| IMAGE_EXTENSIONS.contains(&extension))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_detection_by_mime_or_extension() {
        assert!(is_image(Some("image/png"), "whatever.bin"));
        assert!(is_image(Some("IMAGE/JPEG"), "photo"));
        assert!(is_image(None, "photo.JPG"));
        assert!(is_image(None, "photo.webp"));
        assert!(!is_image(Some("application/pdf"), "doc.pdf"));
        assert!(!is_image(None, "archive.zip"));
        assert!(!is_image(None, "noextension"));
    }
}
