//! Side-channel notifications.
//!
//! Tasks and workflows narrate their progress to a per-task thread on an
//! external chat surface. Delivery is somebody else's problem: this module
//! defines the interface and two small sinks — a no-op and a webhook
//! poster. Every call is best-effort; a failed notification is logged and
//! forgotten.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::store::Priority;

/// What kind of update a thread message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    WorkUpdate,
    Question,
    Handoff,
    Status,
    CompletionSummary,
    Veto,
    Approval,
}

/// Handle to a created task thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub thread_id: String,
    pub channel_id: String,
    pub url: Option<String>,
}

/// The notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Open a thread for a task. `None` when the sink has nowhere to post.
    async fn create_task_thread(
        &self,
        task_id: &str,
        task_name: &str,
        agent_id: &str,
        priority: Priority,
    ) -> Option<ThreadInfo>;

    /// Post an update into a task thread.
    async fn post_update(&self, thread_id: &str, agent_id: &str, kind: MessageKind, content: &str);

    /// Archive a finished thread.
    async fn archive_thread(&self, thread_id: &str);
}

/// Sink that drops everything. The default when no side channel is
/// configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn create_task_thread(
        &self,
        _task_id: &str,
        _task_name: &str,
        _agent_id: &str,
        _priority: Priority,
    ) -> Option<ThreadInfo> {
        None
    }

    async fn post_update(
        &self,
        _thread_id: &str,
        _agent_id: &str,
        _kind: MessageKind,
        _content: &str,
    ) {
    }

    async fn archive_thread(&self, _thread_id: &str) {}
}

/// Sink that POSTs each event as JSON to a configured webhook.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn send(&self, payload: serde_json::Value) {
        if let Err(e) = self.client.post(&self.url).json(&payload).send().await {
            tracing::debug!(error = %e, "webhook notification failed");
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn create_task_thread(
        &self,
        task_id: &str,
        task_name: &str,
        agent_id: &str,
        priority: Priority,
    ) -> Option<ThreadInfo> {
        self.send(json!({
            "event": "thread_created",
            "task_id": task_id,
            "task_name": task_name,
            "agent_id": agent_id,
            "priority": priority.label(),
        }))
        .await;
        // The webhook surface has no thread identity of its own; reuse the
        // task id so later updates correlate.
        Some(ThreadInfo {
            thread_id: task_id.to_string(),
            channel_id: "webhook".to_string(),
            url: None,
        })
    }

    async fn post_update(&self, thread_id: &str, agent_id: &str, kind: MessageKind, content: &str) {
        self.send(json!({
            "event": "thread_message",
            "thread_id": thread_id,
            "agent_id": agent_id,
            "kind": kind,
            "content": content,
        }))
        .await;
    }

    async fn archive_thread(&self, thread_id: &str) {
        self.send(json!({
            "event": "thread_archived",
            "thread_id": thread_id,
        }))
        .await;
    }
}

#[cfg(test)]
pub mod recording {
    //! Capturing sink for tests.

    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone)]
    pub struct RecordedMessage {
        pub thread_id: String,
        pub agent_id: String,
        pub kind: MessageKind,
        pub content: String,
    }

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub messages: Mutex<Vec<RecordedMessage>>,
        pub archived: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn messages_of_kind(&self, kind: MessageKind) -> Vec<RecordedMessage> {
            self.messages
                .lock()
                .iter()
                .filter(|m| m.kind == kind)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn create_task_thread(
            &self,
            task_id: &str,
            _task_name: &str,
            _agent_id: &str,
            _priority: Priority,
        ) -> Option<ThreadInfo> {
            Some(ThreadInfo {
                thread_id: format!("thread-{task_id}"),
                channel_id: "recording".to_string(),
                url: None,
            })
        }

        async fn post_update(
            &self,
            thread_id: &str,
            agent_id: &str,
            kind: MessageKind,
            content: &str,
        ) {
            self.messages.lock().push(RecordedMessage {
                thread_id: thread_id.to_string(),
                agent_id: agent_id.to_string(),
                kind,
                content: content.to_string(),
            });
        }

        async fn archive_thread(&self, thread_id: &str) {
            self.archived.lock().push(thread_id.to_string());
        }
    }
}
