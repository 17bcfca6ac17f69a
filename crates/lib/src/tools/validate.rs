//! Input checks run before anything reaches the provider.

use regex::Regex;
use std::sync::LazyLock;

use super::ToolError;

pub const MAX_VOICE_MESSAGE_CHARS: usize = 1500;
pub const MAX_SMS_TEXT_CHARS: usize = 1600;

static E164: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[1-9]\d{6,14}$").expect("valid regex"));

/// Trimmed number when it looks like E.164 (optional `+`, 7 to 15 digits, no leading 0).
pub fn phone_number(field: &str, value: &str) -> Result<String, ToolError> {
    let trimmed = value.trim();
    if E164.is_match(trimmed) {
        Ok(trimmed.to_string())
    } else {
        Err(ToolError::InvalidInput(format!(
            "{} must be a phone number in E.164 format (e.g. +447700900123), got {:?}",
            field, value
        )))
    }
}

/// Non-empty text of at most `max` characters.
pub fn text(field: &str, value: &str, max: usize) -> Result<String, ToolError> {
    if value.trim().is_empty() {
        return Err(ToolError::InvalidInput(format!("{} must not be empty", field)));
    }
    let len = value.chars().count();
    if len > max {
        return Err(ToolError::InvalidInput(format!(
            "{} is {} characters, the limit is {}",
            field, len, max
        )));
    }
    Ok(value.to_string())
}
