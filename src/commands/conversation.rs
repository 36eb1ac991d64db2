use super::message_types;
use crate::app_state::AppState;
use crate::router::MessageRouter;
use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
struct CreateConversationPayload {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationIdPayload {
    conversation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendMessagePayload {
    conversation_id: String,
    message: Value,
}

pub fn register(router: &mut MessageRouter, state: &Arc<AppState>) {
    let s = state.clone();
    router.on_request(message_types::LIST_CONVERSATIONS, move |_: IgnoredAny| {
        let state = s.clone();
        async move { Ok(state.conversations.list()?) }
    });

    let s = state.clone();
    router.on_request(
        message_types::CREATE_CONVERSATION,
        move |p: Option<CreateConversationPayload>| {
            let state = s.clone();
            async move {
                let title = p.unwrap_or_default().title;
                let metadata = state.conversations.create(title)?;
                info!(conversation_id = %metadata.id, "conversation created");
                Ok(metadata)
            }
        },
    );

    let s = state.clone();
    router.on_request(
        message_types::DELETE_CONVERSATION,
        move |p: ConversationIdPayload| {
            let state = s.clone();
            async move {
                state.conversations.delete(&p.conversation_id)?;
                info!(conversation_id = %p.conversation_id, "conversation deleted");
                Ok(json!({ "success": true }))
            }
        },
    );

    let s = state.clone();
    router.on_request(message_types::GET_MESSAGES, move |p: ConversationIdPayload| {
        let state = s.clone();
        async move { Ok(state.conversations.messages(&p.conversation_id)?) }
    });

    let s = state.clone();
    router.on_request(
        message_types::APPEND_MESSAGE,
        move |p: AppendMessagePayload| {
            let state = s.clone();
            async move {
                state
                    .conversations
                    .append(&p.conversation_id, p.message)?;
                Ok(json!({ "success": true }))
            }
        },
    );
}
