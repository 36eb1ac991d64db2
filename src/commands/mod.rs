use crate::app_state::AppState;
use crate::router::MessageRouter;
use std::sync::Arc;

pub mod chat;
pub mod conversation;
pub mod tasks;
pub mod tools;

/// Message type names as constants to prevent typos
pub mod message_types {
    pub const CHAT_STREAM: &str = "chatStream";
    pub const RESUME_WITH_TOOL_DECISION: &str = "resumeWithToolDecision";
    pub const CANCEL_STREAM: &str = "cancelStream";

    pub const LIST_CONVERSATIONS: &str = "conversation.listConversations";
    pub const CREATE_CONVERSATION: &str = "conversation.createConversation";
    pub const DELETE_CONVERSATION: &str = "conversation.deleteConversation";
    pub const GET_MESSAGES: &str = "conversation.getMessages";
    pub const APPEND_MESSAGE: &str = "conversation.appendMessage";

    pub const LIST_TASKS: &str = "tasks.list";
    pub const CANCEL_TASK: &str = "tasks.cancel";
    pub const CANCEL_TASKS_BY_TYPE: &str = "tasks.cancelByType";

    pub const LIST_TOOLS: &str = "tools.list";
    pub const EXECUTE_TOOL: &str = "tools.execute";
}

pub fn register_all(router: &mut MessageRouter, state: &Arc<AppState>) {
    chat::register(router, state);
    conversation::register(router, state);
    tasks::register(router, state);
    tools::register(router, state);
}
