use crate::abort_registry::AbortRegistry;
use crate::chat::ChatBackend;
use crate::conversation_store::ConversationStore;
use crate::responder::Responder;
use crate::task_registry::TaskRegistry;
use crate::tools::{ToolContext, ToolRegistry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a message handler may touch. One per bridge instance.
pub struct AppState {
    pub responder: Responder,
    pub aborts: Arc<AbortRegistry>,
    pub tasks: Arc<TaskRegistry>,
    pub conversations: Arc<dyn ConversationStore>,
    pub chat_backend: Arc<dyn ChatBackend>,
    pub tools: Arc<ToolRegistry>,
    /// Parent of every token handed to work not tied to a chat stream
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Context for a tool run that is not part of a chat stream.
    pub fn tool_context(&self) -> ToolContext {
        ToolContext {
            tasks: self.tasks.clone(),
            cancel: self.shutdown.child_token(),
        }
    }
}
