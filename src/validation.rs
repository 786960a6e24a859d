use crate::constants::{
    MAX_INSTRUCTIONS_BYTES, MAX_MESSAGE_BYTES, MAX_VISION_IMAGES, MAX_VISION_IMAGE_BYTES,
};
use crate::models::{ChatCompleteRequest, ImagePayload};
use crate::{Result, WopaError};
use url::Url;

/// Validates public inputs at the Service boundary and request shapes at
/// the Provider boundary. Failures surface as 400s and never create a
/// task.
#[derive(Debug, Clone, Default)]
pub struct InputValidator;

impl InputValidator {
    pub fn new() -> Self {
        Self
    }

    /// Message analysis input: non-empty, at most 16 KiB.
    pub fn validate_message(&self, message: &str) -> Result<()> {
        if message.trim().is_empty() {
            return Err(WopaError::Validation("Message must not be empty".to_string()));
        }
        if message.len() > MAX_MESSAGE_BYTES {
            return Err(WopaError::Validation(format!(
                "Message exceeds maximum size of {MAX_MESSAGE_BYTES} bytes"
            )));
        }
        Ok(())
    }

    /// Link analysis input: parseable URL with an http/https scheme.
    pub fn validate_url(&self, raw: &str) -> Result<Url> {
        let parsed =
            Url::parse(raw).map_err(|_| WopaError::Validation("Invalid URL".to_string()))?;
        match parsed.scheme() {
            "http" | "https" => Ok(parsed),
            _ => Err(WopaError::Validation("Invalid URL".to_string())),
        }
    }

    /// File analysis input: non-empty opaque reference.
    pub fn validate_file_ref(&self, file_ref: &str) -> Result<()> {
        if file_ref.trim().is_empty() {
            return Err(WopaError::Validation(
                "File reference must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// App analysis input: non-empty reference, instructions at most 4 KiB.
    pub fn validate_app(&self, app_ref: &str, instructions: &str) -> Result<()> {
        if app_ref.trim().is_empty() {
            return Err(WopaError::Validation(
                "App reference must not be empty".to_string(),
            ));
        }
        if instructions.len() > MAX_INSTRUCTIONS_BYTES {
            return Err(WopaError::Validation(format!(
                "Instructions exceed maximum size of {MAX_INSTRUCTIONS_BYTES} bytes"
            )));
        }
        Ok(())
    }

    /// Chat completion parameter ranges: temperature in [0,2],
    /// max_tokens in [1,8192].
    pub fn validate_chat_params(&self, request: &ChatCompleteRequest) -> Result<()> {
        if request.prompt.is_empty() {
            return Err(WopaError::Validation("Prompt must not be empty".to_string()));
        }
        if let Some(t) = request.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(WopaError::Validation(
                    "temperature must be within [0, 2]".to_string(),
                ));
            }
        }
        if let Some(m) = request.max_tokens {
            if !(1..=8192).contains(&m) {
                return Err(WopaError::Validation(
                    "max_tokens must be within [1, 8192]".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Vision attachments: at most 8 images, each at most 4 MiB decoded.
    pub fn validate_vision_images(&self, images: &[ImagePayload]) -> Result<()> {
        if images.is_empty() {
            return Err(WopaError::Validation(
                "Vision request requires at least one image".to_string(),
            ));
        }
        if images.len() > MAX_VISION_IMAGES {
            return Err(WopaError::Validation(format!(
                "At most {MAX_VISION_IMAGES} images per request"
            )));
        }
        for image in images {
            // Decoded size from base64 length without decoding.
            let decoded = image.base64.len() / 4 * 3;
            if decoded > MAX_VISION_IMAGE_BYTES {
                return Err(WopaError::Validation(format!(
                    "Image exceeds maximum size of {MAX_VISION_IMAGE_BYTES} bytes"
                )));
            }
            if image.mime.is_empty() {
                return Err(WopaError::Validation(
                    "Image mime type must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}
