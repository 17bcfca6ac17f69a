//! In-memory correlation store: bridges an outbound request's id to the callback that
//! eventually reports on it, with parked waiters for tool invocations that block.
//!
//! All state sits behind one `std::sync::Mutex`. The early-arrival check and parking a
//! waiter happen in the same critical section, and `publish` hands the event to the
//! waiter under that lock, so a publish can never fall between "nothing yet" and "parked".
//! The lock is never held across an `.await`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::event::{CallbackEvent, CallbackStatus, PendingRequest};

/// Why `await_result` returned without an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// No matching callback arrived before the deadline. The underlying call or message
    /// may still complete later; its callback will be stored for polling.
    #[error("timed out after {}s waiting for callback", .waited.as_secs())]
    TimedOut { waited: Duration },
}

/// What `publish` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Stored as latest and handed to a parked waiter.
    Woke,
    /// Stored as latest; nobody was waiting.
    Stored,
    /// A terminal event is already authoritative; kept in history only.
    Ignored,
}

/// Read-only view of one correlation entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EntrySnapshot {
    pub correlation_id: String,
    /// None when only callbacks (no registered request) are known for this id.
    pub request: Option<PendingRequest>,
    pub latest: Option<CallbackEvent>,
    pub history: Vec<CallbackEvent>,
    pub waiters: usize,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<CallbackEvent>,
}

struct Entry {
    request: Option<PendingRequest>,
    latest: Option<CallbackEvent>,
    history: VecDeque<CallbackEvent>,
    last_sequence: u64,
    waiters: VecDeque<Waiter>,
    touched_at: Instant,
}

impl Entry {
    fn new(now: Instant) -> Self {
        Self {
            request: None,
            latest: None,
            history: VecDeque::new(),
            last_sequence: 0,
            waiters: VecDeque::new(),
            touched_at: now,
        }
    }

    fn has_live_waiters(&self) -> bool {
        self.waiters.iter().any(|w| !w.tx.is_closed())
    }

    fn expired(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.touched_at) > ttl && !self.has_live_waiters()
    }

    fn snapshot(&self, id: &str) -> EntrySnapshot {
        EntrySnapshot {
            correlation_id: id.to_string(),
            request: self.request.clone(),
            latest: self.latest.clone(),
            history: self.history.iter().cloned().collect(),
            waiters: self.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Digits-only phone number -> correlation id of the SMS awaiting a reply from it.
    reply_routes: HashMap<String, String>,
    next_waiter_id: u64,
}

/// Shared correlation map. Pass one instance (behind `Arc`) to both the callback
/// receiver and the tool facade.
pub struct CorrelationStore {
    inner: Mutex<Inner>,
    ttl: Duration,
    history_limit: usize,
}

impl CorrelationStore {
    pub fn new(ttl: Duration, history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl,
            history_limit: history_limit.max(1),
        }
    }

    pub fn from_config(config: &crate::config::CorrelationConfig) -> Self {
        Self::new(config.ttl(), config.history_limit)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the map half-written.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark a correlation id as awaited. Idempotent: the first registration's
    /// `created_at` is kept, and an entry created by an early callback gets its request.
    pub fn register(&self, request: PendingRequest) {
        let now = Instant::now();
        let mut inner = self.lock();
        let entry = inner
            .entries
            .entry(request.correlation_id.clone())
            .or_insert_with(|| Entry::new(now));
        entry.touched_at = now;
        if entry.request.is_none() {
            log::debug!(
                "correlation: registered {} ({:?})",
                request.correlation_id,
                request.kind
            );
            entry.request = Some(request);
        }
    }

    /// Store an event for `correlation_id` and wake the oldest parked waiter for that id.
    /// Unknown ids are stored too, in case the waiter registers later.
    pub fn publish(
        &self,
        correlation_id: &str,
        status: CallbackStatus,
        payload: serde_json::Value,
    ) -> PublishOutcome {
        let now = Instant::now();
        let mut inner = self.lock();
        let entry = inner
            .entries
            .entry(correlation_id.to_string())
            .or_insert_with(|| Entry::new(now));
        entry.touched_at = now;
        entry.last_sequence += 1;
        let event = CallbackEvent {
            correlation_id: correlation_id.to_string(),
            status,
            payload,
            received_at: Utc::now(),
            sequence: entry.last_sequence,
        };

        entry.history.push_back(event.clone());
        while entry.history.len() > self.history_limit {
            entry.history.pop_front();
        }

        let terminal_latest = entry
            .latest
            .as_ref()
            .map(|e| e.status.clone())
            .filter(CallbackStatus::is_terminal);
        if let Some(previous) = terminal_latest {
            if event.status == CallbackStatus::InputReceived {
                // Input (a reply or speech result) is kept even after a terminal status.
                log::debug!(
                    "correlation: {} input received after {}",
                    correlation_id,
                    previous
                );
            } else if !event.status.is_terminal() {
                log::debug!(
                    "correlation: {} already {}, ignoring late {}",
                    correlation_id,
                    previous,
                    event.status
                );
                return PublishOutcome::Ignored;
            } else {
                log::warn!(
                    "correlation: {} terminal status {} replaced by {}",
                    correlation_id,
                    previous,
                    event.status
                );
            }
        }
        entry.latest = Some(event.clone());

        while let Some(waiter) = entry.waiters.pop_front() {
            if waiter.tx.send(event.clone()).is_ok() {
                return PublishOutcome::Woke;
            }
        }
        PublishOutcome::Stored
    }

    /// Wait for any event on `correlation_id`. Returns at once if one already arrived.
    pub async fn await_result(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<CallbackEvent, WaitError> {
        self.await_after(correlation_id, 0, timeout).await
    }

    /// Wait for an event newer than `after_sequence` (0 = any). Returns the oldest such
    /// event at once when one is already held, so a caller stepping through sequences sees
    /// every event still in history. Otherwise parks until `publish` or `timeout`.
    pub async fn await_after(
        &self,
        correlation_id: &str,
        after_sequence: u64,
        timeout: Duration,
    ) -> Result<CallbackEvent, WaitError> {
        let (mut rx, waiter_id) = {
            let now = Instant::now();
            let mut guard = self.lock();
            let inner = &mut *guard;
            let entry = inner
                .entries
                .entry(correlation_id.to_string())
                .or_insert_with(|| Entry::new(now));
            entry.touched_at = now;
            // History is ordered by sequence, holds ignored events too, and always ends with
            // the newest publish, so nothing newer than `after_sequence` lives outside it.
            if let Some(event) = entry.history.iter().find(|e| e.sequence > after_sequence) {
                return Ok(event.clone());
            }
            // Drop slots left by receivers that already gave up.
            entry.waiters.retain(|w| !w.tx.is_closed());
            let (tx, rx) = oneshot::channel();
            inner.next_waiter_id += 1;
            let waiter_id = inner.next_waiter_id;
            entry.waiters.push_back(Waiter { id: waiter_id, tx });
            (rx, waiter_id)
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(WaitError::TimedOut { waited: timeout }),
            Err(_) => {
                self.release_waiter(correlation_id, waiter_id);
                // A publish that won the race against the deadline already sent under the lock.
                match rx.try_recv() {
                    Ok(event) => Ok(event),
                    Err(_) => {
                        log::debug!(
                            "correlation: wait on {} timed out after {:?}",
                            correlation_id,
                            timeout
                        );
                        Err(WaitError::TimedOut { waited: timeout })
                    }
                }
            }
        }
    }

    fn release_waiter(&self, correlation_id: &str, waiter_id: u64) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(correlation_id) {
            entry.waiters.retain(|w| w.id != waiter_id);
        }
    }

    /// Latest known state of one id. Expired entries are evicted here and read as absent.
    pub fn status(&self, correlation_id: &str) -> Option<EntrySnapshot> {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired = inner
            .entries
            .get(correlation_id)
            .map(|e| e.expired(now, self.ttl))?;
        if expired {
            remove_entry(&mut inner, correlation_id);
            return None;
        }
        inner
            .entries
            .get(correlation_id)
            .map(|e| e.snapshot(correlation_id))
    }

    /// Every registered request that has not been evicted, oldest first.
    pub fn pending(&self) -> Vec<EntrySnapshot> {
        let now = Instant::now();
        let inner = self.lock();
        let mut out: Vec<EntrySnapshot> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.request.is_some() && !e.expired(now, self.ttl))
            .map(|(id, e)| e.snapshot(id))
            .collect();
        out.sort_by_key(|s| s.request.as_ref().map(|r| r.created_at));
        out
    }

    /// Remove `correlation_id` if it has been untouched for longer than the TTL and
    /// nobody is waiting on it. Returns true when removed.
    pub fn evict(&self, correlation_id: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired = inner
            .entries
            .get(correlation_id)
            .map(|e| e.expired(now, self.ttl))
            .unwrap_or(false);
        if expired {
            remove_entry(&mut inner, correlation_id);
        }
        expired
    }

    /// Evict every expired entry. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let ttl = self.ttl;
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.expired(now, ttl));
        let Inner {
            entries,
            reply_routes,
            ..
        } = &mut *inner;
        reply_routes.retain(|_, id| entries.contains_key(id));
        before - entries.len()
    }

    /// Route the next inbound SMS from `number` to `correlation_id`.
    pub fn route_reply(&self, number: &str, correlation_id: &str) {
        let key = route_key(number);
        if key.is_empty() {
            return;
        }
        self.lock()
            .reply_routes
            .insert(key, correlation_id.to_string());
    }

    /// Correlation id awaiting a reply from `number`, if its entry is still present.
    /// The route is consumed: later messages from the same number match nothing until
    /// another `route_reply`.
    pub fn resolve_reply(&self, number: &str) -> Option<String> {
        let key = route_key(number);
        let mut inner = self.lock();
        let id = inner.reply_routes.remove(&key)?;
        inner.entries.contains_key(&id).then_some(id)
    }

    /// Number of entries currently held (expired or not).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remove_entry(inner: &mut Inner, correlation_id: &str) {
    inner.entries.remove(correlation_id);
    inner.reply_routes.retain(|_, id| id != correlation_id);
    log::debug!("correlation: evicted {}", correlation_id);
}

fn route_key(number: &str) -> String {
    number.chars().filter(char::is_ascii_digit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::RequestKind;
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> Arc<CorrelationStore> {
        Arc::new(CorrelationStore::new(Duration::from_secs(300), 8))
    }

    #[tokio::test(start_paused = true)]
    async fn never_published_times_out_at_deadline() {
        let s = store();
        let start = Instant::now();
        let res = s.await_result("call-1", Duration::from_secs(30)).await;
        assert_eq!(
            res.unwrap_err(),
            WaitError::TimedOut {
                waited: Duration::from_secs(30)
            }
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(31));
    }

    #[tokio::test]
    async fn early_arrival_returns_immediately() {
        let s = store();
        assert_eq!(
            s.publish("sms-1", CallbackStatus::Delivered, json!({})),
            PublishOutcome::Stored
        );
        s.register(PendingRequest::new("sms-1", RequestKind::Sms, true));
        let ev = s
            .await_result("sms-1", Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(ev.status, CallbackStatus::Delivered);
        assert_eq!(ev.sequence, 1);
    }

    #[tokio::test]
    async fn parked_waiter_is_woken_by_publish() {
        let s = store();
        s.register(PendingRequest::new("call-2", RequestKind::Call, true));
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.await_result("call-2", Duration::from_secs(5)).await })
        };
        while s.status("call-2").map(|e| e.waiters).unwrap_or(0) == 0 {
            tokio::task::yield_now().await;
        }
        let outcome = s.publish(
            "call-2",
            CallbackStatus::InputReceived,
            json!({ "text": "yes" }),
        );
        assert_eq!(outcome, PublishOutcome::Woke);
        let ev = waiter.await.unwrap().unwrap();
        assert_eq!(ev.text(), Some("yes"));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_for_other_id_does_not_wake() {
        let s = store();
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.await_result("B", Duration::from_secs(10)).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(
            s.publish("A", CallbackStatus::Completed, json!({})),
            PublishOutcome::Stored
        );
        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(WaitError::TimedOut { .. })));
        assert!(s.status("B").unwrap().latest.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_releases_waiter_and_late_event_is_still_stored() {
        let s = store();
        s.register(PendingRequest::new("call-3", RequestKind::Call, true));
        let res = s.await_result("call-3", Duration::from_secs(30)).await;
        assert!(res.is_err());
        assert_eq!(s.status("call-3").unwrap().waiters, 0);

        assert_eq!(
            s.publish("call-3", CallbackStatus::Completed, json!({})),
            PublishOutcome::Stored
        );
        let snap = s.status("call-3").unwrap();
        assert_eq!(snap.latest.unwrap().status, CallbackStatus::Completed);
    }

    #[tokio::test]
    async fn await_after_skips_seen_events() {
        let s = store();
        s.publish("call-4", CallbackStatus::Ringing, json!({}));
        let first = s
            .await_result("call-4", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.status, CallbackStatus::Ringing);

        let next = {
            let s = s.clone();
            tokio::spawn(async move {
                s.await_after("call-4", first.sequence, Duration::from_secs(5))
                    .await
            })
        };
        while s.status("call-4").map(|e| e.waiters).unwrap_or(0) == 0 {
            tokio::task::yield_now().await;
        }
        s.publish("call-4", CallbackStatus::Answered, json!({}));
        let ev = next.await.unwrap().unwrap();
        assert_eq!(ev.status, CallbackStatus::Answered);
        assert_eq!(ev.sequence, 2);
    }

    #[test]
    fn non_terminal_after_terminal_is_ignored() {
        let s = store();
        s.publish("c", CallbackStatus::Completed, json!({}));
        assert_eq!(
            s.publish("c", CallbackStatus::Ringing, json!({})),
            PublishOutcome::Ignored
        );
        let snap = s.status("c").unwrap();
        assert_eq!(snap.latest.unwrap().status, CallbackStatus::Completed);
        assert_eq!(snap.history.len(), 2);
    }

    #[test]
    fn reply_after_delivery_receipt_becomes_latest() {
        let s = store();
        s.publish("m", CallbackStatus::Delivered, json!({}));
        assert_eq!(
            s.publish("m", CallbackStatus::InputReceived, json!({ "text": "yes" })),
            PublishOutcome::Stored
        );
        let latest = s.status("m").unwrap().latest.unwrap();
        assert_eq!(latest.status, CallbackStatus::InputReceived);
        assert_eq!(latest.text(), Some("yes"));
    }

    #[test]
    fn later_terminal_replaces_terminal() {
        let s = store();
        s.publish("c", CallbackStatus::Delivered, json!({}));
        assert_eq!(
            s.publish("c", CallbackStatus::Failed, json!({ "err-code": "5" })),
            PublishOutcome::Stored
        );
        assert_eq!(
            s.status("c").unwrap().latest.unwrap().status,
            CallbackStatus::Failed
        );
    }

    #[test]
    fn history_is_bounded() {
        let s = CorrelationStore::new(Duration::from_secs(60), 3);
        for _ in 0..10 {
            s.publish("c", CallbackStatus::Other("started".into()), json!({}));
        }
        let snap = s.status("c").unwrap();
        assert_eq!(snap.history.len(), 3);
        assert_eq!(snap.history[0].sequence, 8);
        assert_eq!(snap.latest.unwrap().sequence, 10);
    }

    #[test]
    fn register_is_idempotent() {
        let s = store();
        let first = PendingRequest::new("c", RequestKind::Sms, false);
        let created = first.created_at;
        s.register(first);
        s.register(PendingRequest::new("c", RequestKind::Call, true));
        let req = s.status("c").unwrap().request.unwrap();
        assert_eq!(req.created_at, created);
        assert_eq!(req.kind, RequestKind::Sms);
        assert_eq!(s.pending().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn untouched_entries_are_evicted_after_ttl() {
        let s = CorrelationStore::new(Duration::from_secs(300), 8);
        s.register(PendingRequest::new("old", RequestKind::Call, false));
        tokio::time::advance(Duration::from_secs(200)).await;
        s.register(PendingRequest::new("new", RequestKind::Sms, false));
        assert!(!s.evict("old"));

        tokio::time::advance(Duration::from_secs(101)).await;
        assert!(s.status("old").is_none());
        let pending: Vec<String> = s.pending().into_iter().map(|e| e.correlation_id).collect();
        assert_eq!(pending, vec!["new".to_string()]);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(s.evict_expired(), 1);
        assert!(s.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_with_parked_waiters_are_not_evicted() {
        let s = Arc::new(CorrelationStore::new(Duration::from_secs(10), 8));
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.await_result("c", Duration::from_secs(60)).await })
        };
        while s.status("c").map(|e| e.waiters).unwrap_or(0) == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(s.evict_expired(), 0);
        s.publish("c", CallbackStatus::Completed, json!({}));
        assert!(waiter.await.unwrap().is_ok());
    }

    #[test]
    fn reply_routes_follow_entries() {
        let s = store();
        s.register(PendingRequest::new("msg-1", RequestKind::Sms, true));
        s.route_reply("+1 202-555-0183", "msg-1");
        assert_eq!(s.resolve_reply("+447700900000"), None);
        assert_eq!(s.resolve_reply("12025550183").as_deref(), Some("msg-1"));
    }

    #[test]
    fn reply_route_is_consumed_by_first_reply() {
        let s = store();
        s.register(PendingRequest::new("msg-1", RequestKind::Sms, true));
        s.route_reply("+12025550183", "msg-1");
        assert_eq!(s.resolve_reply("12025550183").as_deref(), Some("msg-1"));
        assert_eq!(s.resolve_reply("12025550183"), None);

        s.route_reply("+12025550183", "msg-1");
        assert_eq!(s.resolve_reply("+12025550183").as_deref(), Some("msg-1"));
    }

    #[tokio::test]
    async fn await_after_steps_through_burst_in_order() {
        let s = store();
        s.publish("c", CallbackStatus::Answered, json!({}));
        s.publish("c", CallbackStatus::InputReceived, json!({ "text": "yes" }));
        s.publish("c", CallbackStatus::Completed, json!({}));
        s.publish("c", CallbackStatus::Other("no_input".into()), json!({}));

        let mut seen = 0;
        let mut statuses = Vec::new();
        for _ in 0..4 {
            let ev = s
                .await_after("c", seen, Duration::from_millis(1))
                .await
                .unwrap();
            seen = ev.sequence;
            statuses.push(ev.status);
        }
        assert_eq!(
            statuses,
            vec![
                CallbackStatus::Answered,
                CallbackStatus::InputReceived,
                CallbackStatus::Completed,
                CallbackStatus::Other("no_input".into()),
            ]
        );
        assert_eq!(
            s.status("c").unwrap().latest.unwrap().status,
            CallbackStatus::Completed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_lost_wakeup_under_concurrent_publish() {
        let s = store();
        for trial in 0..1000u32 {
            let id = format!("trial-{}", trial);
            let waiter = {
                let s = s.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    s.register(PendingRequest::new(id.clone(), RequestKind::Call, true));
                    s.await_result(&id, Duration::from_secs(5)).await
                })
            };
            let publisher = {
                let s = s.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    for _ in 0..(trial % 4) {
                        tokio::task::yield_now().await;
                    }
                    s.publish(&id, CallbackStatus::Completed, json!({ "trial": trial }))
                })
            };
            let outcome = publisher.await.unwrap();
            let ev = waiter.await.unwrap().expect("event delivered");
            assert_eq!(ev.payload["trial"], trial);
            assert_eq!(ev.sequence, 1);
            assert_ne!(outcome, PublishOutcome::Ignored);
        }
    }
}
