//! Vonage HTTP client: Voice API (`POST /v1/calls`, JWT auth) and SMS API
//! (`POST /sms/json`, key/secret form auth).

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

use super::{auth, digits_only, OutboundCall, OutboundSms, ProviderError, TelephonyProvider};
use crate::config::{CallbackConfig, VonageConfig};

/// Client for the Vonage Voice and SMS APIs.
#[derive(Clone)]
pub struct VonageClient {
    config: VonageConfig,
    /// Where voice status and speech input events are delivered.
    event_url: String,
    /// Where SMS delivery receipts are delivered.
    sms_status_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CallCreated {
    uuid: String,
    #[serde(default)]
    conversation_uuid: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SmsResponse {
    #[serde(default)]
    messages: Vec<SmsMessageStatus>,
}

#[derive(Debug, Deserialize)]
struct SmsMessageStatus {
    status: String,
    #[serde(rename = "message-id", default)]
    message_id: Option<String>,
    #[serde(rename = "error-text", default)]
    error_text: Option<String>,
}

impl VonageClient {
    pub fn new(config: VonageConfig, callback: &CallbackConfig) -> Self {
        Self {
            event_url: callback.url_for(&callback.voice_event_path),
            sms_status_url: callback.url_for(&callback.sms_status_path),
            config,
            client: reqwest::Client::new(),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs.max(1))
    }

    fn voice_credentials(&self) -> Result<(&str, &PathBuf), ProviderError> {
        match (
            self.config.application_id.as_deref(),
            self.config.private_key_path.as_ref(),
        ) {
            (Some(app), Some(key)) => Ok((app, key)),
            _ => Err(ProviderError::AuthFailure(
                "voice credentials are not fully configured (application id and private key path)"
                    .to_string(),
            )),
        }
    }

    fn sms_credentials(&self) -> Result<(&str, &str), ProviderError> {
        match (
            self.config.api_key.as_deref(),
            self.config.api_secret.as_deref(),
        ) {
            (Some(key), Some(secret)) => Ok((key, secret)),
            _ => Err(ProviderError::AuthFailure(
                "SMS credentials are not fully configured (api key and secret)".to_string(),
            )),
        }
    }

    /// Send once, and once more if the first attempt failed at the network level or the
    /// provider answered 502/503/504. Everything else goes straight back to the caller.
    async fn send_with_retry<F>(&self, what: &str, build: F) -> Result<reqwest::Response, ProviderError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut retried = false;
        loop {
            match build().timeout(self.timeout()).send().await {
                Ok(res) if is_transient_status(res.status()) && !retried => {
                    log::warn!("{}: provider answered {}, retrying once", what, res.status());
                }
                Ok(res) => return Ok(res),
                Err(e) if !retried && (e.is_connect() || e.is_timeout() || e.is_request()) => {
                    log::warn!("{}: request failed ({}), retrying once", what, e);
                }
                Err(e) => return Err(ProviderError::ProviderUnavailable(e.to_string())),
            }
            retried = true;
        }
    }
}

#[async_trait]
impl TelephonyProvider for VonageClient {
    async fn place_call(&self, call: &OutboundCall) -> Result<String, ProviderError> {
        let (application_id, key_path) = self.voice_credentials()?;
        let token = auth::generate_jwt(application_id, key_path).await?;
        let body = json!({
            "to": [{ "type": "phone", "number": digits_only(&call.to) }],
            "from": { "type": "phone", "number": digits_only(&call.from) },
            "event_method": "POST",
            "event_url": [self.event_url],
            "ncco": build_ncco(
                &call.message,
                call.capture_input,
                &self.config.voice_language,
                &self.config.speech_language,
                &self.event_url,
            ),
        });
        log::info!(
            "placing voice call to {} (capture input: {})",
            call.to,
            call.capture_input
        );
        let url = &self.config.voice_api_url;
        let res = self
            .send_with_retry("voice call", || {
                self.client.post(url).bearer_auth(&token).json(&body)
            })
            .await?;

        let status = res.status();
        if status.is_success() {
            let created: CallCreated = res.json().await.map_err(|e| {
                ProviderError::ProviderUnavailable(format!("unreadable call response: {}", e))
            })?;
            log::info!(
                "voice call created: uuid={} conversation={} status={}",
                created.uuid,
                created.conversation_uuid.as_deref().unwrap_or("-"),
                created.status.as_deref().unwrap_or("-")
            );
            return Ok(created.uuid);
        }
        let text = res.text().await.unwrap_or_default();
        log::error!("voice call failed: HTTP {} {}", status, text);
        Err(classify_voice_failure(status, text))
    }

    async fn send_sms(&self, sms: &OutboundSms) -> Result<String, ProviderError> {
        let (api_key, api_secret) = self.sms_credentials()?;
        let to = digits_only(&sms.to);
        let from = digits_only(&sms.from);
        let form = [
            ("api_key", api_key),
            ("api_secret", api_secret),
            ("to", to.as_str()),
            ("from", from.as_str()),
            ("text", sms.text.as_str()),
            ("status-report-req", "1"),
            ("callback", self.sms_status_url.as_str()),
        ];
        log::info!("sending SMS to {}", sms.to);
        let url = &self.config.sms_api_url;
        let res = self
            .send_with_retry("sms", || self.client.post(url).form(&form))
            .await?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            log::error!("sms failed: HTTP {} {}", status, text);
            return Err(classify_http_failure(status, text));
        }
        let data: SmsResponse = res.json().await.map_err(|e| {
            ProviderError::ProviderUnavailable(format!("unreadable SMS response: {}", e))
        })?;
        let first = data.messages.into_iter().next().ok_or_else(|| {
            ProviderError::ProviderUnavailable("SMS response contained no messages".to_string())
        })?;
        if first.status != "0" {
            let reason = first
                .error_text
                .unwrap_or_else(|| "Unknown error".to_string());
            log::error!("sms rejected: status {} {}", first.status, reason);
            return Err(classify_sms_status(&first.status, reason));
        }
        let id = first.message_id.ok_or_else(|| {
            ProviderError::ProviderUnavailable("SMS accepted without a message-id".to_string())
        })?;
        log::info!("sms accepted: message-id={}", id);
        Ok(id)
    }
}

/// Call control object: speak `message`; with `capture_input`, then listen for speech or
/// keypad digits and report them to `event_url`.
pub fn build_ncco(
    message: &str,
    capture_input: bool,
    voice_language: &str,
    speech_language: &str,
    event_url: &str,
) -> serde_json::Value {
    let mut actions = vec![json!({
        "action": "talk",
        "text": message,
        "language": voice_language,
        "style": 0,
        "premium": false,
    })];
    if capture_input {
        actions.push(json!({
            "action": "input",
            "type": ["speech", "dtmf"],
            "speech": {
                "language": speech_language,
                "endOnSilence": 1.5,
                "maxDuration": 30,
            },
            "dtmf": {
                "maxDigits": 10,
                "timeOut": 5,
                "submitOnHash": true,
            },
            "eventUrl": [event_url],
            "eventMethod": "POST",
        }));
    }
    serde_json::Value::Array(actions)
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

fn classify_http_failure(status: StatusCode, body: String) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::AuthFailure(format!("HTTP {} {}", status.as_u16(), body))
        }
        s if s.is_server_error() => {
            ProviderError::ProviderUnavailable(format!("HTTP {} {}", s.as_u16(), body))
        }
        s => ProviderError::Rejected {
            code: s.as_u16().to_string(),
            reason: body,
        },
    }
}

fn classify_voice_failure(status: StatusCode, body: String) -> ProviderError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ProviderError::InvalidNumber(format!("HTTP {} {}", status.as_u16(), body))
        }
        _ => classify_http_failure(status, body),
    }
}

/// Map an SMS API `messages[0].status` code to an error.
fn classify_sms_status(code: &str, reason: String) -> ProviderError {
    match code {
        "4" | "8" | "14" => ProviderError::AuthFailure(reason),
        "3" | "6" | "7" | "15" | "29" => ProviderError::InvalidNumber(reason),
        "1" | "5" => ProviderError::ProviderUnavailable(reason),
        _ => ProviderError::Rejected {
            code: code.to_string(),
            reason,
        },
    }
}
