//! The assembled host side of the webview channel.
//!
//! [`ChatViewBridge`] owns one set of registries, one router with every
//! built-in message type registered, and (optionally) the forwarder that
//! pushes task events to the webview.

use crate::abort_registry::AbortRegistry;
use crate::app_state::AppState;
use crate::chat::{ChatBackend, LoopbackBackend};
use crate::commands;
use crate::conversation_store::ConversationStore;
use crate::error::RouterError;
use crate::events::forward_task_events;
use crate::frame::InboundFrame;
use crate::responder::Responder;
use crate::router::MessageRouter;
use crate::task_registry::{Subscription, TaskRegistry};
use crate::tools::ToolRegistry;
use crate::transport::FrameSink;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// External collaborators the bridge is built from.
pub struct BridgeServices {
    pub conversations: Arc<dyn ConversationStore>,
    pub chat_backend: Arc<dyn ChatBackend>,
    pub tools: Arc<ToolRegistry>,
    pub tasks: Arc<TaskRegistry>,
}

impl BridgeServices {
    /// Built-in tools and the echoing loopback backend over `conversations`.
    pub fn loopback(conversations: Arc<dyn ConversationStore>, chunk_delay: Duration) -> Self {
        let tools = Arc::new(ToolRegistry::with_builtin_tools());
        let tasks = Arc::new(TaskRegistry::new());
        let chat_backend = Arc::new(LoopbackBackend::new(
            tools.clone(),
            tasks.clone(),
            chunk_delay,
        ));
        Self {
            conversations,
            chat_backend,
            tools,
            tasks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub streams_cancelled: usize,
    pub tasks_cancelled: usize,
}

pub struct ChatViewBridge {
    router: MessageRouter,
    state: Arc<AppState>,
    forwarder: Mutex<Option<Subscription>>,
}

impl ChatViewBridge {
    pub fn new<F>(
        sink: Arc<dyn FrameSink>,
        services: BridgeServices,
        init: F,
        forward_events: bool,
    ) -> Self
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        let responder = Responder::new(sink);
        let aborts = Arc::new(AbortRegistry::new());
        let state = Arc::new(AppState {
            responder: responder.clone(),
            aborts: aborts.clone(),
            tasks: services.tasks,
            conversations: services.conversations,
            chat_backend: services.chat_backend,
            tools: services.tools,
            shutdown: CancellationToken::new(),
        });

        let mut router = MessageRouter::new(responder.clone(), aborts, init);
        commands::register_all(&mut router, &state);

        let forwarder = forward_events.then(|| forward_task_events(&state.tasks, responder));
        info!(
            message_types = router.message_types().len(),
            forward_events, "chat view bridge ready"
        );

        Self {
            router,
            state,
            forwarder: Mutex::new(forwarder),
        }
    }

    /// Bridge with no init step and task events forwarded.
    pub fn ready(sink: Arc<dyn FrameSink>, services: BridgeServices) -> Self {
        Self::new(sink, services, async { Ok(()) }, true)
    }

    pub async fn dispatch(&self, frame: InboundFrame) -> Result<(), RouterError> {
        self.router.dispatch(frame).await
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Cancel every stream and background task and stop pushing task
    /// events. Safe to call more than once.
    pub fn shutdown(&self) -> ShutdownSummary {
        self.state.shutdown.cancel();
        let summary = ShutdownSummary {
            streams_cancelled: self.state.aborts.cancel_all(),
            tasks_cancelled: self.state.tasks.cancel_all_tasks(),
        };
        if let Some(forwarder) = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            forwarder.unsubscribe();
        }
        info!(
            streams = summary.streams_cancelled,
            tasks = summary.tasks_cancelled,
            "chat view bridge shut down"
        );
        summary
    }
}
