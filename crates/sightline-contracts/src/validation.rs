use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

const HEADER_BYTES: usize = 64;

const SUPPORTED_FORMATS: [ImageFormat; 6] = [
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::Gif,
    ImageFormat::WebP,
    ImageFormat::Bmp,
    ImageFormat::Tiff,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedImage {
    pub path: PathBuf,
    pub mime_type: String,
    pub file_size: u64,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("image file not found: {0}")]
    Missing(PathBuf),
    #[error("image file is empty")]
    Empty,
    #[error("image is {size} bytes, above the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("unsupported image type{}", detected_suffix(.detected))]
    UnsupportedType { detected: Option<String> },
    #[error("image file could not be read: {0}")]
    Unreadable(String),
}

fn detected_suffix(detected: &Option<String>) -> String {
    detected
        .as_deref()
        .map(|mime| format!(" ({mime})"))
        .unwrap_or_default()
}

/// Checks image type and size from file header bytes. Never decodes pixels.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    max_bytes: u64,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IMAGE_BYTES)
    }
}

impl Validator {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes: max_bytes.max(1),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Pure check over the leading bytes of a file and its total size.
    pub fn validate_bytes(
        &self,
        header: &[u8],
        file_size: u64,
    ) -> Result<(ImageFormat, &'static str), ValidationError> {
        if file_size == 0 || header.is_empty() {
            return Err(ValidationError::Empty);
        }
        if file_size > self.max_bytes {
            return Err(ValidationError::TooLarge {
                size: file_size,
                limit: self.max_bytes,
            });
        }
        let format = image::guess_format(header)
            .map_err(|_| ValidationError::UnsupportedType { detected: None })?;
        if !SUPPORTED_FORMATS.contains(&format) {
            return Err(ValidationError::UnsupportedType {
                detected: Some(format.to_mime_type().to_string()),
            });
        }
        Ok((format, format.to_mime_type()))
    }

    pub fn validate_path(&self, path: &Path) -> Result<ValidatedImage, ValidationError> {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(ValidationError::Missing(path.to_path_buf())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ValidationError::Missing(path.to_path_buf()))
            }
            Err(err) => return Err(ValidationError::Unreadable(err.to_string())),
        };
        let file_size = metadata.len();
        if file_size > self.max_bytes {
            return Err(ValidationError::TooLarge {
                size: file_size,
                limit: self.max_bytes,
            });
        }

        let mut header = Vec::with_capacity(HEADER_BYTES);
        File::open(path)
            .and_then(|file| file.take(HEADER_BYTES as u64).read_to_end(&mut header))
            .map_err(|err| ValidationError::Unreadable(err.to_string()))?;

        let (format, mime_type) = self.validate_bytes(&header, file_size)?;
        Ok(ValidatedImage {
            path: path.to_path_buf(),
            mime_type: mime_type.to_string(),
            file_size,
            format: format!("{format:?}").to_ascii_lowercase(),
        })
    }
}
