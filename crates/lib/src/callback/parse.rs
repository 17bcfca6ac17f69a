//! Webhook payload parsing: provider fields -> correlation id, status and caller-facing payload.
//!
//! Payloads arrive as JSON (voice events) or as form/query fields (SMS receipts and inbound
//! SMS); both are flattened into one JSON object before they reach these functions.

use serde_json::{json, Value};

use crate::correlation::CallbackStatus;

/// Status recorded for an input action that ended without speech or digits.
pub const NO_INPUT_STATUS: &str = "no_input";

/// A webhook reduced to what the correlation store needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCallback {
    pub correlation_id: String,
    pub status: CallbackStatus,
    pub payload: Value,
}

/// An inbound SMS (reply) from `from`.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSms {
    pub from: String,
    pub to: Option<String>,
    pub text: String,
    pub message_id: Option<String>,
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key)
        .and_then(|x| x.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Voice webhook: call status change, or the result of an `input` action.
/// The call leg `uuid` is the correlation id; `conversation_uuid` is the fallback.
pub fn parse_voice_event(body: &Value) -> Option<ParsedCallback> {
    let correlation_id = str_field(body, "uuid")
        .or_else(|| str_field(body, "conversation_uuid"))?
        .to_string();

    if body.get("speech").is_some() || body.get("dtmf").is_some() {
        return Some(parse_input_event(body, correlation_id));
    }

    let raw = str_field(body, "status")?.to_ascii_lowercase();
    let status = match raw.as_str() {
        "ringing" => CallbackStatus::Ringing,
        "answered" => CallbackStatus::Answered,
        "completed" => CallbackStatus::Completed,
        "busy" | "failed" | "timeout" | "cancelled" | "unanswered" => CallbackStatus::Failed,
        "rejected" => CallbackStatus::Rejected,
        _ => CallbackStatus::Other(raw.clone()),
    };
    let mut payload = json!({ "provider_status": raw });
    for key in ["duration", "price", "start_time", "end_time", "detail", "direction"] {
        if let Some(v) = body.get(key) {
            payload[key] = v.clone();
        }
    }
    Some(ParsedCallback {
        correlation_id,
        status,
        payload,
    })
}

fn parse_input_event(body: &Value, correlation_id: String) -> ParsedCallback {
    let first_result = body
        .get("speech")
        .and_then(|s| s.get("results"))
        .and_then(|r| r.as_array())
        .and_then(|r| r.first());
    let text = first_result
        .and_then(|r| str_field(r, "text"))
        .map(str::to_string);
    let confidence = first_result
        .and_then(|r| r.get("confidence"))
        .cloned()
        .unwrap_or(Value::Null);
    let digits = body
        .get("dtmf")
        .and_then(|d| str_field(d, "digits"))
        .map(str::to_string);
    let timeout_reason = body
        .get("speech")
        .and_then(|s| str_field(s, "timeout_reason"))
        .map(str::to_string);

    let status = if text.is_some() || digits.is_some() {
        CallbackStatus::InputReceived
    } else {
        CallbackStatus::Other(NO_INPUT_STATUS.to_string())
    };
    ParsedCallback {
        correlation_id,
        status,
        payload: json!({
            "text": text,
            "confidence": confidence,
            "dtmf": digits,
            "timeout_reason": timeout_reason,
        }),
    }
}

/// SMS delivery receipt. `messageId` is the id returned when the SMS was sent.
pub fn parse_sms_receipt(fields: &Value) -> Option<ParsedCallback> {
    let correlation_id = str_field(fields, "messageId")?.to_string();
    let raw = str_field(fields, "status")?.to_ascii_lowercase();
    let status = match raw.as_str() {
        "delivered" => CallbackStatus::Delivered,
        "failed" | "expired" => CallbackStatus::Failed,
        "rejected" => CallbackStatus::Rejected,
        _ => CallbackStatus::Other(raw.clone()),
    };
    let mut payload = json!({ "provider_status": raw });
    for key in ["err-code", "price", "network-code", "msisdn", "message-timestamp"] {
        if let Some(v) = fields.get(key) {
            payload[key] = v.clone();
        }
    }
    Some(ParsedCallback {
        correlation_id,
        status,
        payload,
    })
}

/// Inbound SMS. Requires a sender (`msisdn`); empty text is allowed (e.g. emoji-only MMS).
pub fn parse_inbound_sms(fields: &Value) -> Option<InboundSms> {
    Some(InboundSms {
        from: str_field(fields, "msisdn")?.to_string(),
        to: str_field(fields, "to").map(str::to_string),
        text: fields
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string(),
        message_id: str_field(fields, "messageId").map(str::to_string),
    })
}

/// Speech recognition summary for the `GET <voice event path>` listing.
pub fn speech_summary(body: &Value) -> Option<Value> {
    let result = body
        .get("speech")?
        .get("results")?
        .as_array()?
        .first()?;
    Some(json!({
        "conversation_uuid": body.get("conversation_uuid"),
        "uuid": body.get("uuid"),
        "text": result.get("text").and_then(|t| t.as_str()).unwrap_or_default(),
        "confidence": result.get("confidence").cloned().unwrap_or(json!(0)),
    }))
}
