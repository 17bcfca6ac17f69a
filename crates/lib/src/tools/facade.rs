//! Tool implementations shared by every transport: validate, call the provider, register
//! the correlation id, and optionally wait for the matching callback.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::validate::{self, MAX_SMS_TEXT_CHARS, MAX_VOICE_MESSAGE_CHARS};
use super::ToolError;
use crate::callback::NO_INPUT_STATUS;
use crate::config::Config;
use crate::correlation::{
    CallbackEvent, CallbackStatus, CorrelationStore, EntrySnapshot, PendingRequest, RequestKind,
    WaitError,
};
use crate::vonage::{OutboundCall, OutboundSms, TelephonyProvider};

/// Which callback ends a blocking tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitFor {
    /// Completed, Failed, Delivered or Rejected.
    Terminal,
    /// Speech/DTMF result, an input action that heard nothing, or the call ending first.
    InputOrTerminal,
    /// An SMS reply, or the message failing.
    Reply,
}

impl WaitFor {
    fn accepts(self, status: &CallbackStatus) -> bool {
        match self {
            WaitFor::Terminal => status.is_terminal(),
            WaitFor::InputOrTerminal => {
                *status == CallbackStatus::InputReceived
                    || status.is_terminal()
                    || matches!(status, CallbackStatus::Other(s) if s == NO_INPUT_STATUS)
            }
            WaitFor::Reply => matches!(
                status,
                CallbackStatus::InputReceived | CallbackStatus::Failed | CallbackStatus::Rejected
            ),
        }
    }
}

/// Telephony tools over a provider and a correlation store.
#[derive(Clone)]
pub struct ToolFacade {
    provider: Arc<dyn TelephonyProvider>,
    store: Arc<CorrelationStore>,
    /// Sender used when the caller gives no `from`.
    default_from: Option<String>,
    wait_timeout: Duration,
}

impl ToolFacade {
    pub fn new(
        provider: Arc<dyn TelephonyProvider>,
        store: Arc<CorrelationStore>,
        default_from: Option<String>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            default_from: default_from.filter(|s| !s.trim().is_empty()),
            wait_timeout,
        }
    }

    pub fn from_config(
        provider: Arc<dyn TelephonyProvider>,
        store: Arc<CorrelationStore>,
        config: &Config,
    ) -> Self {
        Self::new(
            provider,
            store,
            config.vonage.virtual_number.clone(),
            config.correlation.wait_timeout(),
        )
    }

    pub fn store(&self) -> &Arc<CorrelationStore> {
        &self.store
    }

    fn sender(&self, from: Option<&str>) -> Result<String, ToolError> {
        match from.map(str::trim).filter(|s| !s.is_empty()) {
            Some(f) => validate::phone_number("from", f),
            None => match self.default_from.as_deref() {
                Some(f) => validate::phone_number("from", f),
                None => Err(ToolError::InvalidInput(
                    "from is not provided and no virtual number is configured".to_string(),
                )),
            },
        }
    }

    /// Speak `message` to `to`. Waits for the call to end only when asked.
    pub async fn voice_call(
        &self,
        to: &str,
        message: &str,
        from: Option<&str>,
        wait_for_result: Option<bool>,
    ) -> Result<Value, ToolError> {
        self.call(to, message, from, false, wait_for_result.unwrap_or(false))
            .await
    }

    /// Speak `message` to `to`, then listen for a spoken or keyed answer. Waits by default.
    pub async fn voice_call_with_input(
        &self,
        to: &str,
        message: &str,
        from: Option<&str>,
        wait_for_result: Option<bool>,
    ) -> Result<Value, ToolError> {
        self.call(to, message, from, true, wait_for_result.unwrap_or(true))
            .await
    }

    /// Send `text` to `to`. Waits for the delivery receipt only when asked.
    pub async fn send_sms(
        &self,
        to: &str,
        text: &str,
        from: Option<&str>,
        wait_for_result: Option<bool>,
    ) -> Result<Value, ToolError> {
        self.sms(to, text, from, false, wait_for_result.unwrap_or(false))
            .await
    }

    /// Send `text` to `to` and wait for the recipient's reply. Waits by default.
    pub async fn sms_with_input(
        &self,
        to: &str,
        text: &str,
        from: Option<&str>,
        wait_for_result: Option<bool>,
    ) -> Result<Value, ToolError> {
        self.sms(to, text, from, true, wait_for_result.unwrap_or(true))
            .await
    }

    async fn call(
        &self,
        to: &str,
        message: &str,
        from: Option<&str>,
        capture_input: bool,
        wait: bool,
    ) -> Result<Value, ToolError> {
        let to = validate::phone_number("to", to)?;
        let message = validate::text("message", message, MAX_VOICE_MESSAGE_CHARS)?;
        let from = self.sender(from)?;

        let call = OutboundCall {
            to: to.clone(),
            from,
            message,
            capture_input,
        };
        let id = self.provider.place_call(&call).await?;
        self.store
            .register(PendingRequest::new(&id, RequestKind::Call, wait).with_to(&to));

        if !wait {
            return Ok(accepted(
                &id,
                RequestKind::Call,
                format!("Voice call initiated to {}.", to),
            ));
        }
        let until = if capture_input {
            WaitFor::InputOrTerminal
        } else {
            WaitFor::Terminal
        };
        Ok(self.wait_for(&id, RequestKind::Call, until).await)
    }

    async fn sms(
        &self,
        to: &str,
        text: &str,
        from: Option<&str>,
        expect_reply: bool,
        wait: bool,
    ) -> Result<Value, ToolError> {
        let to = validate::phone_number("to", to)?;
        let text = validate::text("text", text, MAX_SMS_TEXT_CHARS)?;
        let from = self.sender(from)?;

        let sms = OutboundSms {
            to: to.clone(),
            from,
            text,
        };
        let id = self.provider.send_sms(&sms).await?;
        self.store
            .register(PendingRequest::new(&id, RequestKind::Sms, wait).with_to(&to));
        if expect_reply {
            self.store.route_reply(&to, &id);
        }

        if !wait {
            return Ok(accepted(&id, RequestKind::Sms, format!("SMS sent to {}.", to)));
        }
        let until = if expect_reply {
            WaitFor::Reply
        } else {
            WaitFor::Terminal
        };
        Ok(self.wait_for(&id, RequestKind::Sms, until).await)
    }

    /// Block until an event `until` accepts, or the deadline. Events it does not accept
    /// (ringing, answered, a delivery receipt while a reply is expected) are skipped.
    async fn wait_for(&self, id: &str, kind: RequestKind, until: WaitFor) -> Value {
        let deadline = Instant::now() + self.wait_timeout;
        let mut seen = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return timed_out(id, self.wait_timeout);
            }
            match self.store.await_after(id, seen, remaining).await {
                Ok(event) if until.accepts(&event.status) => return resolved(&event, kind),
                Ok(event) => {
                    log::debug!("tools: {} is {}, still waiting", id, event.status);
                    seen = event.sequence;
                }
                Err(WaitError::TimedOut { .. }) => {
                    log::info!(
                        "tools: no result for {} within {:?}",
                        id,
                        self.wait_timeout
                    );
                    return timed_out(id, self.wait_timeout);
                }
            }
        }
    }

    /// Latest state of one request, or every request still held when `call_uuid` is None.
    /// Never waits.
    pub fn check_call_status(&self, call_uuid: Option<&str>) -> Value {
        match call_uuid.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => match self.store.status(id) {
                Some(snapshot) => describe(&snapshot),
                None => json!({
                    "status": "unknown",
                    "correlation_id": id,
                    "message": "No request or callback is known for this id; it was never sent from here or has expired.",
                }),
            },
            None => {
                let requests: Vec<Value> = self.store.pending().iter().map(describe).collect();
                json!({ "count": requests.len(), "requests": requests })
            }
        }
    }
}

fn accepted(id: &str, kind: RequestKind, message: String) -> Value {
    json!({
        "status": "accepted",
        "correlation_id": id,
        "kind": kind,
        "message": message,
    })
}

fn resolved(event: &CallbackEvent, kind: RequestKind) -> Value {
    let mut out = json!({
        "status": event.status.as_str(),
        "correlation_id": event.correlation_id,
        "kind": kind,
        "payload": event.payload,
    });
    if let Some(text) = event.text() {
        out["text"] = Value::String(text.to_string());
    }
    out
}

fn timed_out(id: &str, waited: Duration) -> Value {
    json!({
        "status": "timed_out",
        "correlation_id": id,
        "waited_secs": waited.as_secs(),
        "hint": format!(
            "No result yet. The request may still complete; call check_call_status with call_uuid \"{}\" later.",
            id
        ),
    })
}

fn describe(snapshot: &EntrySnapshot) -> Value {
    let status = snapshot
        .latest
        .as_ref()
        .map(|e| e.status.as_str().to_string())
        .unwrap_or_else(|| "pending".to_string());
    let history: Vec<Value> = snapshot
        .history
        .iter()
        .map(|e| {
            json!({
                "status": e.status.as_str(),
                "received_at": e.received_at.to_rfc3339(),
                "payload": e.payload,
            })
        })
        .collect();
    let mut out = json!({
        "status": status,
        "correlation_id": snapshot.correlation_id,
        "history": history,
    });
    if let Some(ref request) = snapshot.request {
        out["kind"] = json!(request.kind);
        out["created_at"] = Value::String(request.created_at.to_rfc3339());
        if let Some(ref to) = request.to {
            out["to"] = Value::String(to.clone());
        }
    }
    if let Some(input) = snapshot
        .history
        .iter()
        .rev()
        .find(|e| e.status == CallbackStatus::InputReceived)
    {
        out["input"] = input.payload.clone();
        if let Some(text) = input.text() {
            out["text"] = Value::String(text.to_string());
        }
    }
    out
}
