//! Bounded log of raw webhook requests, for inspection through `/events`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::parse::speech_summary;

/// Headers never copied into the log.
const REDACTED_HEADERS: &[&str] = &["authorization", "cookie"];

/// One webhook request as received.
#[derive(Debug, Clone, Serialize)]
pub struct RawEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub body: Value,
}

/// In-memory ring of the most recent webhook requests (oldest dropped first).
pub struct EventLog {
    inner: RwLock<VecDeque<RawEvent>>,
    limit: usize,
    counter: AtomicU64,
}

impl EventLog {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: RwLock::new(VecDeque::new()),
            limit: limit.max(1),
            counter: AtomicU64::new(0),
        }
    }

    /// Append a request and return its generated id.
    pub async fn record(
        &self,
        endpoint: String,
        method: String,
        headers: &axum::http::HeaderMap,
        query_params: BTreeMap<String, String>,
        body: Value,
    ) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let timestamp = Utc::now();
        let id = format!("evt_{}_{}", n, timestamp.timestamp_millis());
        let headers = headers
            .iter()
            .filter(|(name, _)| !REDACTED_HEADERS.contains(&name.as_str()))
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let event = RawEvent {
            id: id.clone(),
            timestamp,
            endpoint,
            method,
            headers,
            query_params,
            body,
        };
        let mut g = self.inner.write().await;
        g.push_back(event);
        while g.len() > self.limit {
            g.pop_front();
        }
        id
    }

    /// Total count and one page of events, oldest first.
    pub async fn list(&self, skip: usize, limit: usize) -> (usize, Vec<RawEvent>) {
        let g = self.inner.read().await;
        (g.len(), g.iter().skip(skip).take(limit).cloned().collect())
    }

    pub async fn get(&self, id: &str) -> Option<RawEvent> {
        self.inner.read().await.iter().find(|e| e.id == id).cloned()
    }

    /// Speech recognition results, with the event they came from.
    pub async fn speech_events(&self) -> Vec<Value> {
        let g = self.inner.read().await;
        g.iter()
            .filter_map(|e| {
                let mut summary = speech_summary(&e.body)?;
                summary["id"] = Value::String(e.id.clone());
                summary["timestamp"] = Value::String(e.timestamp.to_rfc3339());
                summary["complete_event"] = serde_json::to_value(e).unwrap_or(Value::Null);
                Some(summary)
            })
            .collect()
    }

    /// Drop every event; returns how many were cleared.
    pub async fn clear(&self) -> usize {
        let mut g = self.inner.write().await;
        let n = g.len();
        g.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};
    use serde_json::json;

    async fn record(log: &EventLog, body: Value) -> String {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        log.record(
            "/event".to_string(),
            "POST".to_string(),
            &headers,
            BTreeMap::new(),
            body,
        )
        .await
    }

    #[tokio::test]
    async fn keeps_most_recent_events_and_redacts_auth() {
        let log = EventLog::new(2);
        record(&log, json!({ "n": 1 })).await;
        let second = record(&log, json!({ "n": 2 })).await;
        record(&log, json!({ "n": 3 })).await;

        let (count, events) = log.list(0, 100).await;
        assert_eq!(count, 2);
        assert_eq!(events[0].id, second);
        assert_eq!(events[1].body["n"], 3);
        assert!(events[0].headers.contains_key("content-type"));
        assert!(!events[0].headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn list_pages_and_get_by_id() {
        let log = EventLog::new(10);
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(record(&log, json!({ "n": n })).await);
        }
        let (count, page) = log.list(1, 2).await;
        assert_eq!(count, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].body["n"], 1);
        assert_eq!(log.get(&ids[4]).await.unwrap().body["n"], 4);
        assert!(log.get("evt_missing").await.is_none());
    }

    #[tokio::test]
    async fn speech_events_and_clear() {
        let log = EventLog::new(10);
        record(&log, json!({ "uuid": "a", "status": "ringing" })).await;
        record(
            &log,
            json!({ "uuid": "a", "speech": { "results": [ { "text": "yes", "confidence": "0.9" } ] } }),
        )
        .await;
        let speech = log.speech_events().await;
        assert_eq!(speech.len(), 1);
        assert_eq!(speech[0]["text"], "yes");
        assert_eq!(log.clear().await, 2);
        assert_eq!(log.list(0, 10).await.0, 0);
    }
}
