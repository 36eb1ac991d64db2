//! Background task registry
//!
//! Process-wide table of long-running tool operations (image generation,
//! command execution, ...) that the webview can list and cancel
//! independently of any chat stream. Lifecycle changes are published to
//! subscribers synchronously, in subscription order.

use crate::error::TaskError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub type Metadata = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    Error,
}

/// Read-only view of a registered task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub start_time: DateTime<Utc>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TaskEventKind {
    Started {
        metadata: Metadata,
    },
    Output {
        data: Value,
    },
    Finished {
        outcome: TaskOutcome,
        metadata: Metadata,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TaskEventKind,
}

/// Result of a cancel request. An unknown id is reported, not raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct TaskEntry {
    info: TaskInfo,
    cancel: CancellationToken,
}

type Listener = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    task_type: Option<String>,
    listener: Listener,
}

type ListenerList = Mutex<Vec<ListenerEntry>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    listeners: Arc<ListenerList>,
    next_listener_id: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh id of the form `<prefix>_<millis>_<random>`.
    pub fn generate_task_id(prefix: &str) -> String {
        let random = Uuid::new_v4().simple().to_string();
        format!(
            "{}_{}_{}",
            prefix,
            Utc::now().timestamp_millis(),
            &random[..8]
        )
    }

    pub fn register_task(
        &self,
        task_id: &str,
        task_type: &str,
        cancel: CancellationToken,
        metadata: Metadata,
    ) -> Result<(), TaskError> {
        let info = TaskInfo {
            task_id: task_id.to_string(),
            task_type: task_type.to_string(),
            start_time: Utc::now(),
            metadata: metadata.clone(),
        };
        {
            let mut tasks = lock(&self.tasks);
            if tasks.contains_key(task_id) {
                return Err(TaskError::DuplicateTaskId(task_id.to_string()));
            }
            tasks.insert(task_id.to_string(), TaskEntry { info, cancel });
        }
        info!(task_id, task_type, "background task registered");
        self.emit(task_id, task_type, TaskEventKind::Started { metadata });
        Ok(())
    }

    /// Remove a task and publish its outcome. Returns false if the task was
    /// already gone (for example, cancelled through [`cancel_task`](Self::cancel_task)).
    pub fn unregister_task(
        &self,
        task_id: &str,
        outcome: TaskOutcome,
        extra_metadata: Metadata,
    ) -> bool {
        let Some(entry) = lock(&self.tasks).remove(task_id) else {
            debug!(task_id, ?outcome, "unregister for unknown task ignored");
            return false;
        };
        let mut metadata = entry.info.metadata;
        metadata.extend(extra_metadata);
        info!(task_id, task_type = %entry.info.task_type, ?outcome, "background task finished");
        self.emit(
            task_id,
            &entry.info.task_type,
            TaskEventKind::Finished { outcome, metadata },
        );
        true
    }

    pub fn cancel_task(&self, task_id: &str) -> CancelOutcome {
        let Some(entry) = lock(&self.tasks).remove(task_id) else {
            return CancelOutcome {
                success: false,
                error: Some(format!(
                    "Task {} already completed or does not exist",
                    task_id
                )),
            };
        };
        entry.cancel.cancel();
        info!(task_id, task_type = %entry.info.task_type, "background task cancelled");
        self.emit(
            task_id,
            &entry.info.task_type,
            TaskEventKind::Finished {
                outcome: TaskOutcome::Cancelled,
                metadata: entry.info.metadata,
            },
        );
        CancelOutcome {
            success: true,
            error: None,
        }
    }

    pub fn cancel_tasks_by_type(&self, task_type: &str) -> usize {
        let ids: Vec<String> = lock(&self.tasks)
            .values()
            .filter(|entry| entry.info.task_type == task_type)
            .map(|entry| entry.info.task_id.clone())
            .collect();
        ids.iter()
            .filter(|id| self.cancel_task(id).success)
            .count()
    }

    pub fn cancel_all_tasks(&self) -> usize {
        let ids: Vec<String> = lock(&self.tasks).keys().cloned().collect();
        ids.iter()
            .filter(|id| self.cancel_task(id).success)
            .count()
    }

    /// Publish tool output for a live task. Returns false for unknown ids.
    pub fn emit_output(&self, task_id: &str, data: Value) -> bool {
        let task_type = match lock(&self.tasks).get(task_id) {
            Some(entry) => entry.info.task_type.clone(),
            None => return false,
        };
        self.emit(task_id, &task_type, TaskEventKind::Output { data });
        true
    }

    pub fn get_task(&self, task_id: &str) -> Option<TaskInfo> {
        lock(&self.tasks).get(task_id).map(|e| e.info.clone())
    }

    pub fn get_all_tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = lock(&self.tasks).values().map(|e| e.info.clone()).collect();
        tasks.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        tasks
    }

    pub fn get_tasks_by_type(&self, task_type: &str) -> Vec<TaskInfo> {
        self.get_all_tasks()
            .into_iter()
            .filter(|t| t.task_type == task_type)
            .collect()
    }

    pub fn on_task_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.subscribe(None, Arc::new(listener))
    }

    pub fn on_task_event_by_type<F>(&self, task_type: &str, listener: F) -> Subscription
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.subscribe(Some(task_type.to_string()), Arc::new(listener))
    }

    fn subscribe(&self, task_type: Option<String>, listener: Listener) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push(ListenerEntry {
            id,
            task_type,
            listener,
        });
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    fn emit(&self, task_id: &str, task_type: &str, kind: TaskEventKind) {
        let event = TaskEvent {
            task_id: task_id.to_string(),
            task_type: task_type.to_string(),
            timestamp: Utc::now(),
            kind,
        };
        // Snapshot so listeners may subscribe or unsubscribe re-entrantly.
        let targets: Vec<Listener> = lock(&self.listeners)
            .iter()
            .filter(|l| l.task_type.as_deref().map_or(true, |t| t == task_type))
            .map(|l| l.listener.clone())
            .collect();
        for listener in targets {
            listener(&event);
        }
    }
}

/// Handle returned by the `on_task_event*` methods.
///
/// Dropping it keeps the listener registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).retain(|l| l.id != self.id);
        }
    }
}

/// A registered task owned by a running tool body.
///
/// If the scope is dropped without [`finish`](Self::finish) (early return,
/// `?`, panic), the task is unregistered with an `error` outcome.
pub struct TaskScope {
    registry: Arc<TaskRegistry>,
    task_id: String,
    cancel: CancellationToken,
    finished: bool,
}

impl TaskScope {
    /// Register a new task of `task_type`. `parent` is typically the token
    /// of the chat stream that invoked the tool, so cancelling the stream
    /// also cancels the task.
    pub fn start(
        registry: &Arc<TaskRegistry>,
        task_type: &str,
        parent: &CancellationToken,
        metadata: Metadata,
    ) -> Result<Self, TaskError> {
        let task_id = TaskRegistry::generate_task_id(task_type);
        let cancel = parent.child_token();
        registry.register_task(&task_id, task_type, cancel.clone(), metadata)?;
        Ok(Self {
            registry: registry.clone(),
            task_id,
            cancel,
            finished: false,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn emit_output(&self, data: Value) {
        self.registry.emit_output(&self.task_id, data);
    }

    pub fn finish(mut self, outcome: TaskOutcome, extra_metadata: Metadata) {
        self.finished = true;
        self.registry
            .unregister_task(&self.task_id, outcome, extra_metadata);
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        if !self.finished {
            let mut metadata = Metadata::new();
            metadata.insert("reason".into(), Value::String("abandoned".into()));
            self.registry
                .unregister_task(&self.task_id, TaskOutcome::Error, metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Metadata {
        value.as_object().cloned().unwrap_or_default()
    }

    fn recorder(
        log: &Arc<Mutex<Vec<String>>>,
        name: &'static str,
    ) -> impl Fn(&TaskEvent) + Send + Sync + 'static {
        let log = log.clone();
        move |event: &TaskEvent| {
            log.lock()
                .unwrap()
                .push(format!("{}:{}", name, event.task_id));
        }
    }

    #[test]
    fn test_generate_task_id_is_unique_and_prefixed() {
        let a = TaskRegistry::generate_task_id("img");
        let b = TaskRegistry::generate_task_id("img");
        assert!(a.starts_with("img_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_register_rejects_duplicate_id() {
        let registry = TaskRegistry::new();
        registry
            .register_task("t1", "generate_image", CancellationToken::new(), Metadata::new())
            .unwrap();
        let err = registry
            .register_task("t1", "generate_image", CancellationToken::new(), Metadata::new())
            .unwrap_err();
        assert_eq!(err, TaskError::DuplicateTaskId("t1".to_string()));
    }

    #[test]
    fn test_cancel_unknown_task_reports_failure() {
        let registry = TaskRegistry::new();
        let outcome = registry.cancel_task("nonexistent");
        assert!(!outcome.success);
        assert!(!outcome.error.unwrap_or_default().is_empty());
    }

    #[test]
    fn test_cancel_task_signals_and_removes() {
        let registry = TaskRegistry::new();
        let token = CancellationToken::new();
        registry
            .register_task("t1", "execute_command", token.clone(), Metadata::new())
            .unwrap();

        let outcome = registry.cancel_task("t1");
        assert!(outcome.success);
        assert!(outcome.error.is_none());
        assert!(token.is_cancelled());
        assert!(registry.get_task("t1").is_none());

        // the tool body noticing cancellation afterwards is a no-op
        assert!(!registry.unregister_task("t1", TaskOutcome::Cancelled, Metadata::new()));
    }

    #[test]
    fn test_cancel_tasks_by_type() {
        let registry = TaskRegistry::new();
        let t1 = CancellationToken::new();
        let t2 = CancellationToken::new();
        registry
            .register_task("t1", "remove_background", t1.clone(), Metadata::new())
            .unwrap();
        registry
            .register_task("t2", "generate_image", t2.clone(), Metadata::new())
            .unwrap();

        assert_eq!(registry.cancel_tasks_by_type("remove_background"), 1);

        let ids: Vec<String> = registry
            .get_all_tasks()
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(ids, vec!["t2".to_string()]);
        assert!(t1.is_cancelled());
        assert!(!t2.is_cancelled());
    }

    #[test]
    fn test_cancel_all_tasks() {
        let registry = TaskRegistry::new();
        for id in ["a", "b", "c"] {
            registry
                .register_task(id, "generate_image", CancellationToken::new(), Metadata::new())
                .unwrap();
        }
        assert_eq!(registry.cancel_all_tasks(), 3);
        assert!(registry.get_all_tasks().is_empty());
    }

    #[test]
    fn test_unregister_merges_metadata() {
        let registry = TaskRegistry::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        registry.on_task_event(move |e| sink.lock().unwrap().push(e.clone()));

        registry
            .register_task(
                "t1",
                "generate_image",
                CancellationToken::new(),
                meta(json!({"prompt": "a cat"})),
            )
            .unwrap();
        assert!(registry.unregister_task(
            "t1",
            TaskOutcome::Completed,
            meta(json!({"path": "/tmp/cat.png"}))
        ));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].kind, TaskEventKind::Started { .. }));
        match &events[1].kind {
            TaskEventKind::Finished { outcome, metadata } => {
                assert_eq!(*outcome, TaskOutcome::Completed);
                assert_eq!(metadata["prompt"], "a cat");
                assert_eq!(metadata["path"], "/tmp/cat.png");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_fan_out_in_subscription_order() {
        let registry = TaskRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.on_task_event(recorder(&log, "all-1"));
        registry.on_task_event_by_type("X", recorder(&log, "typed-X"));
        registry.on_task_event(recorder(&log, "all-2"));
        registry.on_task_event_by_type("Y", recorder(&log, "typed-Y"));

        registry
            .register_task("t1", "X", CancellationToken::new(), Metadata::new())
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["all-1:t1", "typed-X:t1", "all-2:t1"]
        );
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let registry = TaskRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let sub = registry.on_task_event(recorder(&log, "gone"));
        registry.on_task_event(recorder(&log, "kept"));
        sub.unsubscribe();

        registry
            .register_task("t1", "X", CancellationToken::new(), Metadata::new())
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["kept:t1"]);
    }

    #[test]
    fn test_emit_output_for_live_task_only() {
        let registry = TaskRegistry::new();
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let sink = outputs.clone();
        registry.on_task_event_by_type("execute_command", move |e| {
            if let TaskEventKind::Output { data } = &e.kind {
                sink.lock().unwrap().push(data.clone());
            }
        });

        assert!(!registry.emit_output("missing", json!("x")));
        registry
            .register_task("t1", "execute_command", CancellationToken::new(), Metadata::new())
            .unwrap();
        assert!(registry.emit_output("t1", json!({"line": "hello"})));
        assert_eq!(*outputs.lock().unwrap(), vec![json!({"line": "hello"})]);
    }

    #[test]
    fn test_task_scope_unregisters_on_drop() {
        let registry = Arc::new(TaskRegistry::new());
        let parent = CancellationToken::new();
        let scope =
            TaskScope::start(&registry, "generate_image", &parent, Metadata::new()).unwrap();
        let id = scope.task_id().to_string();
        assert!(registry.get_task(&id).is_some());

        drop(scope);
        assert!(registry.get_task(&id).is_none());
    }

    #[test]
    fn test_task_scope_follows_parent_token() {
        let registry = Arc::new(TaskRegistry::new());
        let parent = CancellationToken::new();
        let scope =
            TaskScope::start(&registry, "remove_background", &parent, Metadata::new()).unwrap();

        parent.cancel();
        assert!(scope.is_cancelled());
        scope.finish(TaskOutcome::Cancelled, Metadata::new());
        assert!(registry.get_all_tasks().is_empty());
    }

    #[test]
    fn test_task_event_wire_shape() {
        let event = TaskEvent {
            task_id: "t1".to_string(),
            task_type: "generate_image".to_string(),
            timestamp: Utc::now(),
            kind: TaskEventKind::Finished {
                outcome: TaskOutcome::Cancelled,
                metadata: Metadata::new(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["taskId"], "t1");
        assert_eq!(value["type"], "generate_image");
        assert_eq!(value["event"], "finished");
        assert_eq!(value["outcome"], "cancelled");
    }
}
