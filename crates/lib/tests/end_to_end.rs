//! Integration test: tool facade and callback receiver sharing one store, with the provider
//! replaced by a double and callbacks delivered over real HTTP.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use telephony::callback::{self, CallbackState};
use telephony::config::CallbackConfig;
use telephony::correlation::CorrelationStore;
use telephony::server;
use telephony::tools::ToolFacade;
use telephony::vonage::{OutboundCall, OutboundSms, ProviderError, TelephonyProvider};
use tokio_util::sync::CancellationToken;

struct FixedIds;

#[async_trait]
impl TelephonyProvider for FixedIds {
    async fn place_call(&self, _call: &OutboundCall) -> Result<String, ProviderError> {
        Ok("leg-e2e".to_string())
    }

    async fn send_sms(&self, _sms: &OutboundSms) -> Result<String, ProviderError> {
        Ok("msg-e2e".to_string())
    }
}

async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind free port");
    let port = listener.local_addr().expect("local_addr").port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://127.0.0.1:{}", port)
}

async fn setup() -> (ToolFacade, String) {
    let config = CallbackConfig::default();
    let store = Arc::new(CorrelationStore::new(Duration::from_secs(300), 32));
    let base = serve(callback::router(
        CallbackState::new(store.clone(), &config),
        &config,
    )
    .expect("callback router"))
    .await;
    let tools = ToolFacade::new(
        Arc::new(FixedIds),
        store,
        Some("+447700900000".to_string()),
        Duration::from_secs(10),
    );
    (tools, base)
}

#[tokio::test]
async fn sms_then_poll_until_delivery_receipt() {
    let (tools, base) = setup().await;
    let sent = tools
        .send_sms("+12025550183", "Hi", None, Some(false))
        .await
        .expect("sms accepted");
    assert_eq!(sent["correlation_id"], "msg-e2e");
    assert_eq!(tools.check_call_status(Some("msg-e2e"))["status"], "pending");

    let resp = reqwest::Client::new()
        .post(format!("{}/sms/status", base))
        .form(&[
            ("messageId", "msg-e2e"),
            ("status", "delivered"),
            ("err-code", "0"),
        ])
        .send()
        .await
        .expect("POST receipt");
    assert_eq!(resp.status(), 200);

    let status = tools.check_call_status(Some("msg-e2e"));
    assert_eq!(status["status"], "delivered");
    assert_eq!(status["kind"], "sms");
}

#[tokio::test]
async fn waiting_call_returns_speech_posted_to_receiver() {
    let (tools, base) = setup().await;
    let poster = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let client = reqwest::Client::new();
        for body in [
            json!({ "uuid": "leg-e2e", "status": "answered" }),
            json!({
                "uuid": "leg-e2e",
                "speech": { "results": [ { "text": "yes", "confidence": "0.88" } ] }
            }),
        ] {
            client
                .post(format!("{}/event", base))
                .json(&body)
                .send()
                .await
                .expect("POST /event");
        }
    });

    let started = std::time::Instant::now();
    let result = tools
        .voice_call_with_input("+12025550183", "Can you attend?", None, None)
        .await
        .expect("call accepted");
    poster.await.unwrap();
    assert_eq!(result["status"], "input_received");
    assert_eq!(result["text"], "yes");
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn mcp_listener_answers_health_probe() {
    let (tools, _) = setup().await;
    let app = server::mcp_router(tools, "/mcp", CancellationToken::new()).expect("router");
    let base = serve(app).await;
    let json: Value = reqwest::get(format!("{}/", base))
        .await
        .expect("GET /")
        .json()
        .await
        .expect("parse JSON");
    assert_eq!(json["status"], "ok");
}
