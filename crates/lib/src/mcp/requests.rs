//! MCP tool request types.

use rmcp::schemars;
use serde::Deserialize;

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct VoiceCallRequest {
    #[schemars(description = "Destination phone number in E.164 format, e.g. +447700900123")]
    pub to: String,
    #[schemars(description = "Message spoken to the callee (at most 1500 characters)")]
    pub message: String,
    #[schemars(description = "Caller id; defaults to the configured virtual number")]
    #[serde(default, alias = "from_")]
    pub from: Option<String>,
    #[schemars(description = "Block until the call reaches a result (or times out) instead of returning the call id at once")]
    #[serde(default)]
    pub wait_for_result: Option<bool>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SmsRequest {
    #[schemars(description = "Destination phone number in E.164 format, e.g. +447700900123")]
    pub to: String,
    #[schemars(description = "Message text (at most 1600 characters)")]
    pub text: String,
    #[schemars(description = "Sender number; defaults to the configured virtual number")]
    #[serde(default, alias = "from_")]
    pub from: Option<String>,
    #[schemars(description = "Block until a delivery receipt or reply arrives (or times out) instead of returning the message id at once")]
    #[serde(default)]
    pub wait_for_result: Option<bool>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CheckStatusRequest {
    #[schemars(description = "Call uuid or SMS message id returned by an earlier tool; omit to list every request still tracked")]
    #[serde(default)]
    pub call_uuid: Option<String>,
}
