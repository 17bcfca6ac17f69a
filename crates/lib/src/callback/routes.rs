//! Webhook HTTP routes. Every provider callback is answered with 200 as soon as it is
//! logged and handed to the correlation store; nothing here waits on a tool invocation.

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    routing::get,
    Json, Router,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::event_log::EventLog;
use super::parse::{parse_inbound_sms, parse_sms_receipt, parse_voice_event, ParsedCallback};
use crate::config::CallbackConfig;
use crate::correlation::{CallbackStatus, CorrelationStore};

/// Shared state for the callback routes.
#[derive(Clone)]
pub struct CallbackState {
    pub store: Arc<CorrelationStore>,
    pub log: Arc<EventLog>,
    /// When Some, voice webhooks must carry a Bearer JWT signed with this secret.
    pub signature_secret: Option<String>,
}

impl CallbackState {
    pub fn new(store: Arc<CorrelationStore>, config: &CallbackConfig) -> Self {
        Self {
            store,
            log: Arc::new(EventLog::new(config.event_log_limit)),
            signature_secret: config
                .signature_secret
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        }
    }
}

/// Build the callback router for the configured webhook paths. Fails when a path is not
/// absolute or collides with another route.
pub fn router(state: CallbackState, config: &CallbackConfig) -> Result<Router> {
    let paths = [
        ("callback.voiceEventPath", config.voice_event_path.as_str()),
        ("callback.smsStatusPath", config.sms_status_path.as_str()),
        ("callback.smsInboundPath", config.sms_inbound_path.as_str()),
    ];
    for (i, (name, path)) in paths.iter().enumerate() {
        if !path.starts_with('/') || *path == "/" {
            anyhow::bail!("{} must start with '/' and not be the root (got {:?})", name, path);
        }
        if *path == "/events" || path.starts_with("/events/") {
            anyhow::bail!("{} collides with the event log routes (got {:?})", name, path);
        }
        if let Some((other, _)) = paths[..i].iter().find(|(_, p)| p == path) {
            anyhow::bail!("{} and {} are both {:?}", other, name, path);
        }
    }
    Ok(Router::new()
        .route("/", get(health_http))
        .route(
            &config.voice_event_path,
            get(list_speech_events).post(voice_event),
        )
        .route(&config.sms_status_path, get(sms_status).post(sms_status))
        .route(&config.sms_inbound_path, get(sms_inbound).post(sms_inbound))
        .route("/events", get(list_events).delete(clear_events))
        .route("/events/:id", get(get_event))
        .with_state(state))
}

fn accepted() -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({ "status": "success", "message": "Event received" })),
    )
}

/// GET / returns a simple health JSON (for probes).
async fn health_http() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "telephony callback receiver" }))
}

fn query_map(uri: &Uri) -> BTreeMap<String, String> {
    uri.query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

/// Flatten query string and body (JSON or form-encoded) into one JSON object; body fields win.
/// A body that fails to parse is kept as `raw` with a `parse_error`.
fn decode_fields(headers: &HeaderMap, query: &BTreeMap<String, String>, body: &[u8]) -> Value {
    let mut fields: Map<String, Value> = query
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Object(fields);
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let looks_like_json = body
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .map(|b| *b == b'{' || *b == b'[')
        .unwrap_or(false);
    if content_type.contains("json") || looks_like_json {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(m)) => fields.extend(m),
            Ok(other) => {
                fields.insert("body".to_string(), other);
            }
            Err(e) => {
                log::error!("callback: failed to parse JSON body: {}", e);
                fields.insert(
                    "raw".to_string(),
                    Value::String(String::from_utf8_lossy(body).into_owned()),
                );
                fields.insert("parse_error".to_string(), Value::String(e.to_string()));
            }
        }
    } else {
        for (k, v) in url::form_urlencoded::parse(body) {
            fields.insert(k.into_owned(), Value::String(v.into_owned()));
        }
    }
    Value::Object(fields)
}

/// Log the request and return its flattened fields.
async fn record(
    state: &CallbackState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Value {
    let query = query_map(uri);
    let fields = decode_fields(headers, &query, body);
    let id = state
        .log
        .record(
            uri.path().to_string(),
            method.to_string(),
            headers,
            query,
            fields.clone(),
        )
        .await;
    log::debug!("callback: recorded {} {} as {}", method, uri.path(), id);
    fields
}

fn publish(state: &CallbackState, parsed: ParsedCallback) {
    let outcome = state
        .store
        .publish(&parsed.correlation_id, parsed.status.clone(), parsed.payload);
    log::info!(
        "callback: {} -> {} ({:?})",
        parsed.correlation_id,
        parsed.status,
        outcome
    );
}

/// Verify `Authorization: Bearer <jwt>` signed HS256 with the shared signature secret.
fn verify_signature(headers: &HeaderMap, secret: &str) -> Result<(), String> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| "missing bearer token".to_string())?;
    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims.clear();
    jsonwebtoken::decode::<Value>(
        token.trim(),
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|_| ())
    .map_err(|e| e.to_string())
}

/// POST <voice event path>: call status changes and speech/DTMF input results.
async fn voice_event(
    State(state): State<CallbackState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Some(ref secret) = state.signature_secret {
        if let Err(e) = verify_signature(&headers, secret) {
            log::warn!("callback: rejected unsigned voice event: {}", e);
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "status": "error", "message": "invalid signature" })),
            );
        }
    }
    let fields = record(&state, &method, &uri, &headers, &body).await;
    match parse_voice_event(&fields) {
        Some(parsed) => {
            if parsed.status == CallbackStatus::InputReceived {
                log::info!(
                    "callback: input on {}: text={} confidence={} dtmf={}",
                    parsed.correlation_id,
                    parsed.payload["text"],
                    parsed.payload["confidence"],
                    parsed.payload["dtmf"]
                );
            }
            publish(&state, parsed);
        }
        None => log::debug!("callback: voice event without call id or status, logged only"),
    }
    accepted()
}

/// GET|POST <sms status path>: delivery receipts.
async fn sms_status(
    State(state): State<CallbackState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let fields = record(&state, &method, &uri, &headers, &body).await;
    match parse_sms_receipt(&fields) {
        Some(parsed) => publish(&state, parsed),
        None => log::debug!("callback: delivery receipt without messageId or status, logged only"),
    }
    accepted()
}

/// GET|POST <sms inbound path>: replies. Routed to the SMS that asked for a reply from
/// the same number.
async fn sms_inbound(
    State(state): State<CallbackState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let fields = record(&state, &method, &uri, &headers, &body).await;
    let Some(sms) = parse_inbound_sms(&fields) else {
        log::debug!("callback: inbound SMS without sender, logged only");
        return accepted();
    };
    match state.store.resolve_reply(&sms.from) {
        Some(correlation_id) => publish(
            &state,
            ParsedCallback {
                correlation_id,
                status: CallbackStatus::InputReceived,
                payload: json!({
                    "text": sms.text,
                    "from": sms.from,
                    "to": sms.to,
                    "message_id": sms.message_id,
                }),
            },
        ),
        None => log::info!(
            "callback: inbound SMS from {} matches no pending request",
            sms.from
        ),
    }
    accepted()
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default = "default_list_limit")]
    limit: usize,
    #[serde(default)]
    skip: usize,
}

fn default_list_limit() -> usize {
    100
}

/// GET /events?limit&skip
async fn list_events(
    State(state): State<CallbackState>,
    Query(params): Query<ListParams>,
) -> Json<Value> {
    let (count, events) = state.log.list(params.skip, params.limit).await;
    Json(json!({ "count": count, "events": events }))
}

/// GET /events/:id
async fn get_event(
    State(state): State<CallbackState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.log.get(&id).await {
        Some(event) => Ok(Json(json!(event))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": format!("Event with ID {} not found", id) })),
        )),
    }
}

/// GET <voice event path>: speech recognition events only.
async fn list_speech_events(State(state): State<CallbackState>) -> Json<Value> {
    let events = state.log.speech_events().await;
    Json(json!({ "count": events.len(), "speech_events": events }))
}

/// DELETE /events
async fn clear_events(State(state): State<CallbackState>) -> Json<Value> {
    let cleared = state.log.clear().await;
    Json(json!({ "status": "success", "cleared": cleared }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn state() -> CallbackState {
        let store = Arc::new(CorrelationStore::new(std::time::Duration::from_secs(60), 8));
        CallbackState::new(store, &CallbackConfig::default())
    }

    #[test]
    fn default_paths_build_a_router() {
        assert!(router(state(), &CallbackConfig::default()).is_ok());
    }

    #[test]
    fn bad_webhook_paths_are_rejected() {
        for (voice, status, inbound) in [
            ("event", "/sms/status", "/sms/inbound"),
            ("/", "/sms/status", "/sms/inbound"),
            ("/event", "/events", "/sms/inbound"),
            ("/event", "/sms/status", "/events/latest"),
            ("/event", "/sms", "/sms"),
        ] {
            let config = CallbackConfig {
                voice_event_path: voice.to_string(),
                sms_status_path: status.to_string(),
                sms_inbound_path: inbound.to_string(),
                ..CallbackConfig::default()
            };
            assert!(
                router(state(), &config).is_err(),
                "accepted {} {} {}",
                voice,
                status,
                inbound
            );
        }
    }

    #[test]
    fn form_body_and_query_are_merged() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        let uri: Uri = "/sms/status?messageId=abc&status=accepted".parse().unwrap();
        let query = query_map(&uri);
        let fields = decode_fields(&headers, &query, b"status=delivered&err-code=0");
        assert_eq!(fields["messageId"], "abc");
        assert_eq!(fields["status"], "delivered");
        assert_eq!(fields["err-code"], "0");
    }

    #[test]
    fn broken_json_is_kept_raw() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let fields = decode_fields(&headers, &BTreeMap::new(), b"{\"uuid\": ");
        assert_eq!(fields["raw"], "{\"uuid\": ");
        assert!(fields["parse_error"].is_string());
    }

    #[test]
    fn signature_check_accepts_only_matching_secret() {
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &json!({ "iat": 1_700_000_000, "api_key": "k" }),
            &jsonwebtoken::EncodingKey::from_secret(b"shh"),
        )
        .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        assert!(verify_signature(&headers, "shh").is_ok());
        assert!(verify_signature(&headers, "other").is_err());
        assert!(verify_signature(&HeaderMap::new(), "shh").is_err());
    }
}
