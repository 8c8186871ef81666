use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use conductor_core::help::timeout_duration;
use conductor_core::{
    new_id, ConductorResult, HelpQuestion, HelpRequest, HelpStatus, JsonMap, ResponseSource,
};
use conductor_store::HelpRepository;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Resolved requests are kept this long so late answers can be told apart
/// from unknown ids.
const RESOLVED_RETENTION_SECS: i64 = 3600;

/// Side-effects of help request state changes.
#[async_trait]
pub trait HelpNotifier: Send + Sync {
    /// A new request is waiting for a human.
    async fn help_requested(&self, request: &HelpRequest);
    /// The request left `pending` (answered, timed out or cancelled).
    async fn help_resolved(&self, request: &HelpRequest);
}

/// Parameters for [`HelpRequestManager::create_request`].
#[derive(Debug, Clone)]
pub struct NewHelpRequest {
    /// Caller-chosen id; a fresh one is generated when absent.
    pub request_id: Option<String>,
    /// Task the question belongs to.
    pub task_id: String,
    /// Worker asking.
    pub worker_id: String,
    /// Questions to put to a human.
    pub questions: Vec<HelpQuestion>,
    /// Free-form context forwarded to the gateway.
    pub context: Option<Value>,
    /// Seconds before the request times out; `0` or less expires at once.
    pub timeout_seconds: f64,
    /// Gateway channel of the originating task, if it came from one.
    pub channel: Option<String>,
    /// Gateway chat id of the originating task.
    pub chat_id: Option<Value>,
}

/// Tracks human-in-the-loop requests and their timers.
///
/// Every request ends in exactly one of `responded`, `timeout` or
/// `cancelled`: the transition out of `pending` is a compare-and-set under
/// the request map lock, and the first one wins.
pub struct HelpRequestManager {
    requests: RwLock<HashMap<String, HelpRequest>>,
    timers: Mutex<HashMap<String, oneshot::Sender<()>>>,
    channel_index: RwLock<HashMap<(String, String), String>>,
    notifier: Arc<dyn HelpNotifier>,
    repo: Option<Arc<dyn HelpRepository>>,
}

impl HelpRequestManager {
    /// Create a manager; `repo` mirrors every state change when set.
    pub fn new(notifier: Arc<dyn HelpNotifier>, repo: Option<Arc<dyn HelpRepository>>) -> Arc<Self> {
        Arc::new(Self {
            requests: RwLock::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            channel_index: RwLock::new(HashMap::new()),
            notifier,
            repo,
        })
    }

    /// Store a new request, arm its timeout and notify listeners.
    ///
    /// Re-submitting a known request id returns the stored request as it is,
    /// whatever its status, without a second timer or notification.
    pub async fn create_request(self: &Arc<Self>, new: NewHelpRequest) -> HelpRequest {
        let request_id = new.request_id.unwrap_or_else(new_id);
        if let Some(existing) = self.get(&request_id) {
            debug!(request_id = %request_id, status = %existing.status, "Help request id already known, keeping it");
            return existing;
        }
        let request = HelpRequest {
            request_id,
            task_id: new.task_id,
            worker_id: new.worker_id,
            questions: new.questions,
            context: new.context,
            timeout_seconds: new.timeout_seconds,
            status: HelpStatus::Pending,
            answers: None,
            response_source: None,
            channel: new.channel,
            chat_id: new.chat_id,
            message_id: None,
            created_at: Utc::now(),
            resolved_at: None,
        };

        let cancel_rx = {
            let mut requests = self.requests.write();
            if let Some(existing) = requests.get(&request.request_id) {
                return existing.clone();
            }
            self.prune_resolved(&mut requests);
            // The timer entry exists before the request is visible, so an
            // immediate answer always finds it to cancel.
            let cancel_rx = self.register_timer(&request.request_id);
            requests.insert(request.request_id.clone(), request.clone());
            cancel_rx
        };
        info!(
            request_id = %request.request_id,
            task_id = %request.task_id,
            worker_id = %request.worker_id,
            questions = request.questions.len(),
            "Help request created"
        );

        self.persist(&request).await;
        self.spawn_timer(
            request.request_id.clone(),
            timeout_duration(request.timeout_seconds),
            cancel_rx,
        );
        self.notifier.help_requested(&request).await;
        request
    }

    /// Record an answer. Returns `false` if the request is unknown or no
    /// longer pending.
    pub async fn respond(&self, request_id: &str, answers: JsonMap, source: ResponseSource) -> bool {
        let source_label = source.to_string();
        let applied = self
            .resolve(request_id, HelpStatus::Responded, Some(answers), Some(source))
            .await
            .is_some();
        if applied {
            info!(request_id, source = %source_label, "Help request answered");
        } else {
            debug!(request_id, "Answer for help request that is not pending");
        }
        applied
    }

    /// Cancel a pending request. Returns `false` if it already ended.
    pub async fn cancel_request(&self, request_id: &str) -> bool {
        let applied = self
            .resolve(request_id, HelpStatus::Cancelled, None, None)
            .await
            .is_some();
        if applied {
            info!(request_id, "Help request cancelled");
        }
        applied
    }

    /// Cancel every pending request raised by `worker_id`.
    pub async fn cancel_requests_for_worker(&self, worker_id: &str) -> usize {
        let ids: Vec<String> = self
            .requests
            .read()
            .values()
            .filter(|r| r.is_pending() && r.worker_id == worker_id)
            .map(|r| r.request_id.clone())
            .collect();
        let mut cancelled = 0;
        for id in ids {
            if self.cancel_request(&id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Remember where a gateway posted the questions, so a channel reply
    /// can be routed back and the message edited later.
    pub async fn set_channel_message_id(
        &self,
        request_id: &str,
        channel: &str,
        message_id: &str,
        chat_id: Option<Value>,
    ) -> bool {
        let updated = {
            let mut requests = self.requests.write();
            let Some(request) = requests.get_mut(request_id) else {
                return false;
            };
            request.channel = Some(channel.to_string());
            request.message_id = Some(message_id.to_string());
            if chat_id.is_some() {
                request.chat_id = chat_id;
            }
            request.clone()
        };
        self.channel_index.write().insert(
            (channel.to_string(), message_id.to_string()),
            request_id.to_string(),
        );
        debug!(request_id, channel, message_id, "Help request correlated with channel message");
        self.persist(&updated).await;
        true
    }

    /// Look up a request by the gateway message that carried it.
    pub fn get_by_channel_message_id(&self, channel: &str, message_id: &str) -> Option<HelpRequest> {
        let request_id = self
            .channel_index
            .read()
            .get(&(channel.to_string(), message_id.to_string()))
            .cloned()?;
        self.get(&request_id)
    }

    /// Snapshot of one request.
    pub fn get(&self, request_id: &str) -> Option<HelpRequest> {
        self.requests.read().get(request_id).cloned()
    }

    /// Requests still waiting for an answer, oldest first.
    pub fn pending(&self) -> Vec<HelpRequest> {
        let mut pending: Vec<HelpRequest> = self
            .requests
            .read()
            .values()
            .filter(|r| r.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    /// Number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.requests.read().values().filter(|r| r.is_pending()).count()
    }

    /// Reload pending requests and re-arm each with its remaining time.
    /// Requests whose deadline already passed expire right away.
    pub async fn load_from_store(self: &Arc<Self>) -> ConductorResult<usize> {
        let Some(repo) = &self.repo else {
            return Ok(0);
        };
        let pending = repo.list_pending_help_requests().await?;
        let now = Utc::now();
        let count = pending.len();
        for request in pending {
            if let (Some(channel), Some(message_id)) = (&request.channel, &request.message_id) {
                self.channel_index.write().insert(
                    (channel.clone(), message_id.clone()),
                    request.request_id.clone(),
                );
            }
            let remaining = request.remaining(now);
            let request_id = request.request_id.clone();
            let cancel_rx = {
                let mut requests = self.requests.write();
                if requests.contains_key(&request_id) {
                    continue;
                }
                let cancel_rx = self.register_timer(&request_id);
                requests.insert(request_id.clone(), request);
                cancel_rx
            };
            self.spawn_timer(request_id, remaining, cancel_rx);
        }
        info!(count, "Loaded pending help requests from store");
        Ok(count)
    }

    fn register_timer(&self, request_id: &str) -> oneshot::Receiver<()> {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        self.timers.lock().insert(request_id.to_string(), cancel_tx);
        cancel_rx
    }

    fn spawn_timer(self: &Arc<Self>, request_id: String, after: Duration, cancel_rx: oneshot::Receiver<()>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {
                    if let Some(manager) = manager.upgrade() {
                        manager.expire(&request_id).await;
                    }
                }
                _ = cancel_rx => {}
            }
        });
    }

    async fn expire(&self, request_id: &str) {
        self.timers.lock().remove(request_id);
        if self
            .resolve(request_id, HelpStatus::Timeout, None, None)
            .await
            .is_some()
        {
            warn!(request_id, "Help request timed out");
        }
    }

    async fn resolve(
        &self,
        request_id: &str,
        status: HelpStatus,
        answers: Option<JsonMap>,
        source: Option<ResponseSource>,
    ) -> Option<HelpRequest> {
        let resolved = {
            let mut requests = self.requests.write();
            let request = requests.get_mut(request_id)?;
            if !request.resolve(status, answers, source) {
                return None;
            }
            request.clone()
        };
        // Dropping the sender ends the timer task.
        self.timers.lock().remove(request_id);
        self.persist(&resolved).await;
        self.notifier.help_resolved(&resolved).await;
        Some(resolved)
    }

    /// Drop requests resolved longer ago than the retention window, together
    /// with their channel message index entries.
    fn prune_resolved(&self, requests: &mut HashMap<String, HelpRequest>) {
        let cutoff = Utc::now() - ChronoDuration::seconds(RESOLVED_RETENTION_SECS);
        let before = requests.len();
        requests.retain(|_, r| r.is_pending() || r.resolved_at.map_or(true, |at| at > cutoff));
        if requests.len() == before {
            return;
        }
        self.channel_index
            .write()
            .retain(|_, request_id| requests.contains_key(request_id));
        debug!(pruned = before - requests.len(), "Pruned resolved help requests");
    }

    async fn persist(&self, request: &HelpRequest) {
        if let Some(repo) = &self.repo {
            if let Err(e) = repo.save_help_request(request).await {
                warn!(request_id = %request.request_id, error = %e, "Failed to persist help request");
            }
        }
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_store::MemoryStore;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, HelpStatus)>>,
    }

    #[async_trait]
    impl HelpNotifier for Recorder {
        async fn help_requested(&self, request: &HelpRequest) {
            self.events
                .lock()
                .push((request.request_id.clone(), request.status));
        }

        async fn help_resolved(&self, request: &HelpRequest) {
            self.events
                .lock()
                .push((request.request_id.clone(), request.status));
        }
    }

    fn new_request(worker_id: &str, timeout_seconds: f64) -> NewHelpRequest {
        NewHelpRequest {
            request_id: None,
            task_id: "t1".into(),
            worker_id: worker_id.into(),
            questions: vec![HelpQuestion::text("Which account?")],
            context: None,
            timeout_seconds,
            channel: None,
            chat_id: None,
        }
    }

    fn answers() -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("Which account?".into(), json!("work"));
        map
    }

    #[tokio::test]
    async fn test_respond_once() {
        let recorder = Arc::new(Recorder::default());
        let manager = HelpRequestManager::new(recorder.clone(), None);
        let request = manager.create_request(new_request("w1", 30.0)).await;

        assert!(manager.respond(&request.request_id, answers(), ResponseSource::Ui).await);
        assert!(!manager.respond(&request.request_id, answers(), ResponseSource::Ui).await);
        assert!(!manager.cancel_request(&request.request_id).await);

        let stored = manager.get(&request.request_id).unwrap();
        assert_eq!(stored.status, HelpStatus::Responded);
        assert_eq!(stored.response_source, Some(ResponseSource::Ui));
        let statuses: Vec<HelpStatus> = recorder.events.lock().iter().map(|e| e.1).collect();
        assert_eq!(statuses, vec![HelpStatus::Pending, HelpStatus::Responded]);
    }

    #[tokio::test]
    async fn test_timeout_then_late_answer() {
        let recorder = Arc::new(Recorder::default());
        let manager = HelpRequestManager::new(recorder.clone(), None);
        let request = manager.create_request(new_request("w1", 0.1)).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            manager.get(&request.request_id).unwrap().status,
            HelpStatus::Timeout
        );
        assert!(!manager.respond(&request.request_id, answers(), ResponseSource::Ui).await);
        assert_eq!(recorder.events.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_answer_cancels_timer() {
        let recorder = Arc::new(Recorder::default());
        let manager = HelpRequestManager::new(recorder.clone(), None);
        let request = manager.create_request(new_request("w1", 0.1)).await;
        assert!(manager.respond(&request.request_id, answers(), ResponseSource::Ui).await);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            manager.get(&request.request_id).unwrap().status,
            HelpStatus::Responded
        );
        assert_eq!(recorder.events.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_for_worker() {
        let manager = HelpRequestManager::new(Arc::new(Recorder::default()), None);
        manager.create_request(new_request("w1", 30.0)).await;
        manager.create_request(new_request("w1", 30.0)).await;
        let other = manager.create_request(new_request("w2", 30.0)).await;

        assert_eq!(manager.cancel_requests_for_worker("w1").await, 2);
        assert_eq!(manager.pending_count(), 1);
        assert_eq!(manager.pending()[0].request_id, other.request_id);
    }

    #[tokio::test]
    async fn test_channel_correlation() {
        let manager = HelpRequestManager::new(Arc::new(Recorder::default()), None);
        let request = manager.create_request(new_request("w1", 30.0)).await;
        assert!(
            manager
                .set_channel_message_id(&request.request_id, "telegram", "991", Some(json!(123)))
                .await
        );
        assert!(!manager.set_channel_message_id("nope", "telegram", "1", None).await);

        let found = manager.get_by_channel_message_id("telegram", "991").unwrap();
        assert_eq!(found.request_id, request.request_id);
        assert_eq!(found.chat_id, Some(json!(123)));
        assert!(manager.get_by_channel_message_id("slack", "991").is_none());
    }

    #[tokio::test]
    async fn test_redelivered_request_keeps_resolved_state() {
        let recorder = Arc::new(Recorder::default());
        let manager = HelpRequestManager::new(recorder.clone(), None);
        let mut new = new_request("w1", 0.1);
        new.request_id = Some("H1".into());
        manager.create_request(new.clone()).await;
        assert!(manager.respond("H1", answers(), ResponseSource::Ui).await);

        let again = manager.create_request(new).await;
        assert_eq!(again.status, HelpStatus::Responded);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(manager.get("H1").unwrap().status, HelpStatus::Responded);
        let statuses: Vec<HelpStatus> = recorder.events.lock().iter().map(|e| e.1).collect();
        assert_eq!(statuses, vec![HelpStatus::Pending, HelpStatus::Responded]);
        assert!(manager.timers.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_answer_racing_expiry_resolves_once() {
        let recorder = Arc::new(Recorder::default());
        let manager = HelpRequestManager::new(recorder.clone(), None);
        let mut outcomes = Vec::new();
        for i in 0..100 {
            let mut new = new_request("w1", 0.0);
            new.request_id = Some(format!("race-{i}"));
            let request = manager.create_request(new).await;
            let (answered, cancelled) = tokio::join!(
                manager.respond(&request.request_id, answers(), ResponseSource::Ui),
                manager.cancel_request(&request.request_id),
            );
            outcomes.push((request.request_id, answered, cancelled));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let events = recorder.events.lock().clone();
        for (request_id, answered, cancelled) in outcomes {
            let terminal: Vec<HelpStatus> = events
                .iter()
                .filter(|(id, status)| *id == request_id && *status != HelpStatus::Pending)
                .map(|(_, status)| *status)
                .collect();
            assert_eq!(terminal.len(), 1, "{request_id} resolved {terminal:?}");
            let stored = manager.get(&request_id).unwrap().status;
            assert_eq!(terminal[0], stored);
            assert!(!(answered && cancelled));
            assert_eq!(answered, stored == HelpStatus::Responded);
            assert_eq!(cancelled, stored == HelpStatus::Cancelled);
        }
        assert!(manager.timers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_pruning_drops_channel_index_entries() {
        let manager = HelpRequestManager::new(Arc::new(Recorder::default()), None);
        let old = manager.create_request(new_request("w1", 30.0)).await;
        manager
            .set_channel_message_id(&old.request_id, "telegram", "77", None)
            .await;
        assert!(manager.cancel_request(&old.request_id).await);
        manager
            .requests
            .write()
            .get_mut(&old.request_id)
            .unwrap()
            .resolved_at = Some(Utc::now() - ChronoDuration::seconds(RESOLVED_RETENTION_SECS + 60));

        manager.create_request(new_request("w1", 30.0)).await;
        assert!(manager.get(&old.request_id).is_none());
        assert!(manager.get_by_channel_message_id("telegram", "77").is_none());
        assert!(manager.channel_index.read().is_empty());
    }

    #[tokio::test]
    async fn test_reload_rearms_remaining_timeout() {
        let store = Arc::new(MemoryStore::new());
        let mut overdue = HelpRequest {
            request_id: "overdue".into(),
            task_id: "t1".into(),
            worker_id: "w1".into(),
            questions: vec![HelpQuestion::text("Still there?")],
            context: None,
            timeout_seconds: 1.0,
            status: HelpStatus::Pending,
            answers: None,
            response_source: None,
            channel: Some("telegram".into()),
            chat_id: Some(json!(123)),
            message_id: Some("77".into()),
            created_at: Utc::now() - ChronoDuration::seconds(10),
            resolved_at: None,
        };
        store.save_help_request(&overdue).await.unwrap();
        overdue.request_id = "open".into();
        overdue.message_id = None;
        overdue.timeout_seconds = 60.0;
        overdue.created_at = Utc::now();
        store.save_help_request(&overdue).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let manager = HelpRequestManager::new(recorder.clone(), Some(store));
        assert_eq!(manager.load_from_store().await.unwrap(), 2);
        assert!(manager.get_by_channel_message_id("telegram", "77").is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.get("overdue").unwrap().status, HelpStatus::Timeout);
        assert!(manager.get("open").unwrap().is_pending());
        assert_eq!(recorder.events.lock().len(), 1);
    }
}
