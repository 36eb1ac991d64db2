use super::message_types;
use crate::app_state::AppState;
use crate::chat::{ChatRequest, ToolDecision};
use crate::error::StoreError;
use crate::router::{MessageRouter, StreamRequest};
use crate::stream::ChunkStream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelStreamPayload {
    conversation_id: String,
}

pub fn register(router: &mut MessageRouter, state: &Arc<AppState>) {
    let s = state.clone();
    router.on_stream(
        message_types::CHAT_STREAM,
        move |req: StreamRequest<ChatRequest>| {
            let state = s.clone();
            async move {
                persist(
                    &state,
                    &req.conversation_id,
                    json!({ "role": "user", "content": req.payload.message }),
                );
                let conversation_id = req.conversation_id.clone();
                let updates = state.chat_backend.stream_chat(req.payload, req.cancel);
                Ok(persist_reply(state, conversation_id, updates))
            }
        },
    );

    let s = state.clone();
    router.on_stream(
        message_types::RESUME_WITH_TOOL_DECISION,
        move |req: StreamRequest<ToolDecision>| {
            let state = s.clone();
            async move {
                debug!(
                    conversation_id = %req.conversation_id,
                    approved = req.payload.approved,
                    "resuming after tool decision"
                );
                let conversation_id = req.conversation_id.clone();
                let updates = state.chat_backend.resume(req.payload, req.cancel);
                Ok(persist_reply(state, conversation_id, updates))
            }
        },
    );

    let s = state.clone();
    router.on_request(
        message_types::CANCEL_STREAM,
        move |p: CancelStreamPayload| {
            let state = s.clone();
            async move {
                let success = state.aborts.cancel(&p.conversation_id);
                debug!(conversation_id = %p.conversation_id, success, "cancel stream requested");
                Ok(json!({ "success": success }))
            }
        },
    );
}

/// Store the assistant's final answer once the backend reports completion.
fn persist_reply(
    state: Arc<AppState>,
    conversation_id: String,
    updates: ChunkStream,
) -> ChunkStream {
    updates
        .inspect(move |item| {
            if let Ok(update) = item {
                if update.complete {
                    let content = update.content.clone().unwrap_or_default();
                    persist(
                        &state,
                        &conversation_id,
                        json!({ "role": "assistant", "content": content }),
                    );
                }
            }
        })
        .boxed()
}

/// Best-effort append; the webview may stream into a conversation it never
/// asked the host to store.
fn persist(state: &AppState, conversation_id: &str, message: Value) {
    match state.conversations.append(conversation_id, message) {
        Ok(_) => {}
        Err(StoreError::NotFound(_) | StoreError::InvalidId(_)) => {
            debug!(conversation_id, "conversation not stored, skipping persistence")
        }
        Err(e) => warn!(conversation_id, error = %e, "failed to persist chat message"),
    }
}
