//! Tool layer: the five telephony tools, independent of the transport that exposes them.

mod facade;
mod validate;

pub use facade::ToolFacade;
pub use validate::{MAX_SMS_TEXT_CHARS, MAX_VOICE_MESSAGE_CHARS};

use crate::vonage::ProviderError;

/// Why a tool invocation failed. Timeouts and unknown ids are results, not errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Rejected before any network call.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}
