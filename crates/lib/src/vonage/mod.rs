//! Outbound Vonage API client: voice call creation and SMS send.
//!
//! The tool facade talks to the provider through [`TelephonyProvider`] so it can run
//! against a fake in tests; [`VonageClient`] is the real implementation.

mod auth;
mod client;

use async_trait::async_trait;

pub use auth::generate_jwt;
pub use client::{build_ncco, VonageClient};

/// A voice call to place: speak `message`, optionally capture the callee's answer.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    pub to: String,
    pub from: String,
    pub message: String,
    /// Append a speech/DTMF `input` action after the spoken message.
    pub capture_input: bool,
}

/// An SMS to send.
#[derive(Debug, Clone)]
pub struct OutboundSms {
    pub to: String,
    pub from: String,
    pub text: String,
}

/// Provider failures, classified for the caller.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("vonage authentication failed: {0}")]
    AuthFailure(String),
    #[error("invalid number: {0}")]
    InvalidNumber(String),
    #[error("vonage unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("vonage rejected the request ({code}): {reason}")]
    Rejected { code: String, reason: String },
}

/// Outbound side of the provider. Each method issues one authenticated request
/// (plus at most one transient retry) and returns the provider's correlation id.
#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    async fn place_call(&self, call: &OutboundCall) -> Result<String, ProviderError>;
    async fn send_sms(&self, sms: &OutboundSms) -> Result<String, ProviderError>;
}

/// Phone number as Vonage expects it on the wire: digits only, no leading `+`.
pub fn digits_only(number: &str) -> String {
    number.chars().filter(char::is_ascii_digit).collect()
}
