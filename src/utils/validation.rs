use crate::config::AnalysisConfig;
use crate::models::UploadRequest;
use std::path::Path;
use thiserror::Error;

/// Top-level MIME types that can never carry a tabular dataset
const NON_TABULAR_MIME_TYPES: &[&str] = &["image", "audio", "video"];

/// Why an upload was refused before staging
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("No file uploaded")]
    NoFileProvided,

    #[error("Unsupported dataset format: {0}")]
    UnsupportedFormat(String),

    #[error("File size {size} bytes exceeds maximum allowed {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Upload incomplete: {0}")]
    IncompleteUpload(String),
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::NoFileProvided => "NO_FILE_PROVIDED",
            Rejection::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            Rejection::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Rejection::IncompleteUpload(_) => "INCOMPLETE_UPLOAD",
        }
    }
}

/// Acceptance rules applied to incoming datasets
#[derive(Debug, Clone)]
pub struct DatasetPolicy {
    pub strict_extensions: bool,
    pub allowed_extensions: Vec<String>,
    pub max_file_size: u64,
}

impl From<&AnalysisConfig> for DatasetPolicy {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            strict_extensions: config.strict_extensions,
            allowed_extensions: config.allowed_extensions.clone(),
            max_file_size: config.max_file_size as u64,
        }
    }
}

/// Metadata of an upload that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedDataset {
    pub filename: String,
    pub extension: Option<String>,
}

/// Inspects request metadata only; the body is not touched
pub fn validate_dataset(
    request: &UploadRequest<'_>,
    policy: &DatasetPolicy,
) -> Result<AcceptedDataset, Rejection> {
    let file = request.file.as_ref().ok_or(Rejection::NoFileProvided)?;

    // Browsers submit an empty file part when nothing was selected
    let original = file.original_filename.as_deref().unwrap_or("");
    if original.trim().is_empty() && file.original_filename.is_some() {
        return Err(Rejection::NoFileProvided);
    }

    if let Some(size) = file.declared_size {
        if size > policy.max_file_size {
            return Err(Rejection::FileTooLarge {
                size,
                max: policy.max_file_size,
            });
        }
    }

    let filename = sanitize_filename(original);
    let extension = dataset_extension(&filename);

    if policy.strict_extensions {
        let Some(ext) = extension.as_deref() else {
            return Err(Rejection::UnsupportedFormat(
                "filename has no extension".to_string(),
            ));
        };
        if !policy.allowed_extensions.iter().any(|allowed| allowed == ext) {
            return Err(Rejection::UnsupportedFormat(format!(
                "'.{}' is not one of: {}",
                ext,
                policy.allowed_extensions.join(", ")
            )));
        }
        if let Some(content_type) = file.content_type.as_deref() {
            check_content_type(content_type)?;
        }
    }

    Ok(AcceptedDataset {
        filename,
        extension,
    })
}

fn check_content_type(content_type: &str) -> Result<(), Rejection> {
    // Unparseable content types are left to the engine
    let Ok(parsed) = content_type.parse::<mime::Mime>() else {
        tracing::debug!("Ignoring unparseable content type '{}'", content_type);
        return Ok(());
    };

    if NON_TABULAR_MIME_TYPES.contains(&parsed.type_().as_str()) {
        return Err(Rejection::UnsupportedFormat(format!(
            "content type '{}' is not tabular data",
            parsed.essence_str()
        )));
    }
    Ok(())
}

/// Sanitizes a client filename: drops any path and replaces reserved characters.
/// Returns an empty string when nothing usable is left.
pub fn sanitize_filename(filename: &str) -> String {
    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        tracing::warn!("Path components stripped from upload name: {}", filename);
    }

    // Backslashes are not separators on unix, split on both
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim();

    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control()
                || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|' | ';')
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    // Limit length safely for UTF-8
    if sanitized.len() > 255 {
        let mut end = 255;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized[..end].to_string()
    } else {
        sanitized
    }
}

/// Lowercase extension of a sanitized filename, restricted to ASCII alphanumerics
/// so it is always safe to reuse in a staged path.
pub fn dataset_extension(filename: &str) -> Option<String> {
    let ext = Path::new(filename).extension()?.to_str()?;
    if ext.is_empty() || ext.len() > 16 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
