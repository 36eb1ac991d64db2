use super::message_types;
use crate::app_state::AppState;
use crate::router::MessageRouter;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
struct ListTasksPayload {
    #[serde(default, rename = "type")]
    task_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelTaskPayload {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct CancelByTypePayload {
    #[serde(rename = "type")]
    task_type: String,
}

pub fn register(router: &mut MessageRouter, state: &Arc<AppState>) {
    let s = state.clone();
    router.on_request(message_types::LIST_TASKS, move |p: Option<ListTasksPayload>| {
        let state = s.clone();
        async move {
            Ok(match p.unwrap_or_default().task_type {
                Some(task_type) => state.tasks.get_tasks_by_type(&task_type),
                None => state.tasks.get_all_tasks(),
            })
        }
    });

    let s = state.clone();
    router.on_request(message_types::CANCEL_TASK, move |p: CancelTaskPayload| {
        let state = s.clone();
        async move { Ok(state.tasks.cancel_task(&p.task_id)) }
    });

    let s = state.clone();
    router.on_request(
        message_types::CANCEL_TASKS_BY_TYPE,
        move |p: CancelByTypePayload| {
            let state = s.clone();
            async move {
                let cancelled = state.tasks.cancel_tasks_by_type(&p.task_type);
                info!(task_type = %p.task_type, cancelled, "cancelled tasks by type");
                Ok(json!({ "cancelled": cancelled }))
            }
        },
    );
}
