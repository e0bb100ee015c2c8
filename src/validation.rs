use crate::converter::ConversionSettings;
use crate::errors::{AppError, Result};
use std::path::Path;
use url::Url;

/// Checks applied to everything the shell hands to the converter.
pub struct InputValidator;

impl InputValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_download_url(&self, url: &str) -> Result<Url> {
        if url.is_empty() {
            return Err(AppError::Validation("URL cannot be empty".to_string()));
        }

        let parsed_url = Url::parse(url)
            .map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

        if !matches!(parsed_url.scheme(), "http" | "https") {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                parsed_url.scheme()
            )));
        }

        if parsed_url.host_str().is_none() {
            return Err(AppError::Validation("URL must have a host".to_string()));
        }

        if !parsed_url.path().to_ascii_lowercase().ends_with(".zip") {
            return Err(AppError::Validation("FFmpeg download must be a .zip archive".to_string()));
        }

        Ok(parsed_url)
    }

    pub fn validate_input_file(&self, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(AppError::Validation("File path cannot be empty".to_string()));
        }

        if path.to_string_lossy().contains('\0') {
            return Err(AppError::Validation("Null bytes not allowed in file path".to_string()));
        }

        if !path.is_file() {
            return Err(AppError::Validation(format!("{} is not a file", path.display())));
        }

        Ok(())
    }

    pub fn validate_sample_rate(&self, sample_rate: u32) -> Result<()> {
        ConversionSettings { sample_rate, mono: true }.validate()
    }

    /// The output directory may not exist yet, but it must not be a file or a
    /// read-only directory.
    pub fn validate_output_dir(&self, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(AppError::Validation("Output directory cannot be empty".to_string()));
        }

        if !path.exists() {
            return Ok(());
        }

        if !path.is_dir() {
            return Err(AppError::Validation(format!(
                "Output path {} is not a directory",
                path.display()
            )));
        }

        let readonly = path
            .metadata()
            .map_err(|e| {
                AppError::Validation(format!("Failed to read output directory metadata: {}", e))
            })?
            .permissions()
            .readonly();
        if readonly {
            return Err(AppError::Validation("Output directory is read-only".to_string()));
        }

        Ok(())
    }
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Clap value parser for `--sample-rate`.
pub fn parse_sample_rate(value: &str) -> std::result::Result<u32, String> {
    let rate: u32 = value
        .parse()
        .map_err(|_| format!("`{}` is not a whole number", value))?;
    InputValidator::new()
        .validate_sample_rate(rate)
        .map_err(|e| e.to_string())?;
    Ok(rate)
}
