//! Stream multiplexer
//!
//! A streaming handler produces a lazy sequence of [`StreamUpdate`]s. The
//! multiplexer classifies each one into a [`StreamChunk`], pushes it to the
//! webview as a `streamChunk` frame tagged with the conversation id, and
//! finally answers the originating request id.

use crate::abort_registry::AbortRegistry;
use crate::error::HandlerError;
use crate::frame::error_codes;
use crate::responder::Responder;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub type ChunkStream = BoxStream<'static, Result<StreamUpdate, HandlerError>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub success: bool,
    #[serde(default)]
    pub output: Value,
}

/// One classified unit of a stream session, as seen by the webview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamChunk {
    Checkpoints {
        checkpoints: Vec<Value>,
    },
    Chunk {
        chunk: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolsExecuting {
        pending_tool_calls: Vec<ToolCall>,
    },
    #[serde(rename_all = "camelCase")]
    AwaitingConfirmation {
        pending_tool_calls: Vec<ToolCall>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolIteration {
        tool_results: Vec<ToolResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    Complete {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        elapsed_ms: Option<u64>,
    },
    Error {
        error: String,
    },
}

impl StreamChunk {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. } | Self::Cancelled { .. } | Self::Error { .. }
        )
    }
}

/// What a producer yields. Fields overlap (a cancelled update may also carry
/// `content`), so [`classify`](Self::classify) resolves them in a fixed
/// priority order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamUpdate {
    pub checkpoints: Option<Vec<Value>>,
    pub chunk: Option<String>,
    pub tools_executing: Option<Vec<ToolCall>>,
    pub awaiting_confirmation: Option<Vec<ToolCall>>,
    pub tool_iteration: Option<Vec<ToolResult>>,
    pub content: Option<String>,
    pub complete: bool,
    pub cancelled: bool,
    pub error: Option<String>,
    pub elapsed_ms: Option<u64>,
}

impl StreamUpdate {
    /// Priority: checkpoints, chunk, toolsExecuting, awaitingConfirmation,
    /// toolIteration, complete, cancelled, error. `content` alone never
    /// classifies.
    pub fn classify(self) -> Option<StreamChunk> {
        if let Some(checkpoints) = self.checkpoints {
            return Some(StreamChunk::Checkpoints { checkpoints });
        }
        if let Some(chunk) = self.chunk {
            return Some(StreamChunk::Chunk { chunk });
        }
        if let Some(pending_tool_calls) = self.tools_executing {
            return Some(StreamChunk::ToolsExecuting { pending_tool_calls });
        }
        if let Some(pending_tool_calls) = self.awaiting_confirmation {
            return Some(StreamChunk::AwaitingConfirmation {
                pending_tool_calls,
                content: self.content,
            });
        }
        if let Some(tool_results) = self.tool_iteration {
            return Some(StreamChunk::ToolIteration {
                tool_results,
                content: self.content,
            });
        }
        if self.complete {
            return Some(StreamChunk::Complete {
                content: self.content.unwrap_or_default(),
            });
        }
        if self.cancelled {
            return Some(StreamChunk::Cancelled {
                content: self.content,
                elapsed_ms: self.elapsed_ms,
            });
        }
        if let Some(error) = self.error {
            return Some(StreamChunk::Error { error });
        }
        None
    }
}

impl From<StreamChunk> for StreamUpdate {
    fn from(chunk: StreamChunk) -> Self {
        match chunk {
            StreamChunk::Checkpoints { checkpoints } => Self {
                checkpoints: Some(checkpoints),
                ..Self::default()
            },
            StreamChunk::Chunk { chunk } => Self {
                chunk: Some(chunk),
                ..Self::default()
            },
            StreamChunk::ToolsExecuting { pending_tool_calls } => Self {
                tools_executing: Some(pending_tool_calls),
                ..Self::default()
            },
            StreamChunk::AwaitingConfirmation {
                pending_tool_calls,
                content,
            } => Self {
                awaiting_confirmation: Some(pending_tool_calls),
                content,
                ..Self::default()
            },
            StreamChunk::ToolIteration {
                tool_results,
                content,
            } => Self {
                tool_iteration: Some(tool_results),
                content,
                ..Self::default()
            },
            StreamChunk::Complete { content } => Self {
                complete: true,
                content: Some(content),
                ..Self::default()
            },
            StreamChunk::Cancelled {
                content,
                elapsed_ms,
            } => Self {
                cancelled: true,
                content,
                elapsed_ms,
                ..Self::default()
            },
            StreamChunk::Error { error } => Self {
                error: Some(error),
                ..Self::default()
            },
        }
    }
}

/// Ownership of one conversation's entry in the [`AbortRegistry`].
///
/// Dropping the session releases the entry, whichever way the stream ends.
pub struct StreamSession {
    conversation_id: String,
    generation: u64,
    token: CancellationToken,
    aborts: Arc<AbortRegistry>,
}

impl StreamSession {
    pub fn begin(aborts: &Arc<AbortRegistry>, conversation_id: &str) -> Self {
        let (generation, token) = aborts.begin_tracked(conversation_id);
        Self {
            conversation_id: conversation_id.to_string(),
            generation,
            token,
            aborts: aborts.clone(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.aborts.release(&self.conversation_id, self.generation);
    }
}

struct SessionState {
    started: Instant,
    accumulated: String,
    has_error: bool,
    terminal_sent: bool,
    awaiting_confirmation: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            accumulated: String::new(),
            has_error: false,
            terminal_sent: false,
            awaiting_confirmation: false,
        }
    }

    fn partial_content(&self) -> Option<String> {
        (!self.accumulated.is_empty()).then(|| self.accumulated.clone())
    }
}

#[derive(Clone)]
pub struct StreamMultiplexer {
    responder: Responder,
}

impl StreamMultiplexer {
    pub fn new(responder: Responder) -> Self {
        Self { responder }
    }

    /// Drive `updates` to completion for `session`.
    ///
    /// Guarantees for the session: exactly one terminal chunk, unless the
    /// stream paused on `awaitingConfirmation` (the resuming session carries
    /// it). Guarantees for `request_id`: exactly one terminal frame, an
    /// `error` if any error was reported and a success ack otherwise.
    pub async fn run(
        &self,
        session: StreamSession,
        request_id: Option<String>,
        mut updates: ChunkStream,
    ) {
        let conversation_id = session.conversation_id().to_string();
        let request_id = request_id.as_deref();
        let mut state = SessionState::new();

        loop {
            // A producer with chunks ready never returns Pending; yield so a
            // `cancelStream` dispatched meanwhile gets to run between chunks.
            tokio::task::yield_now().await;

            let next = match AssertUnwindSafe(updates.next()).catch_unwind().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(panic) => Err(HandlerError::new(crate::router::panic_message(panic))),
            };

            match next {
                Ok(update) => {
                    let Some(chunk) = update.classify() else {
                        debug!(
                            conversation_id = %conversation_id,
                            "ignoring stream update with no recognised fields"
                        );
                        continue;
                    };
                    if self.emit(&conversation_id, request_id, &mut state, chunk) {
                        break;
                    }
                }
                Err(err) if session.is_cancelled() => {
                    debug!(
                        conversation_id = %conversation_id,
                        error = %err,
                        "stream failed after cancellation"
                    );
                    break;
                }
                Err(err) => {
                    error!(conversation_id = %conversation_id, error = %err, "stream failed");
                    self.emit_error(
                        &conversation_id,
                        request_id,
                        &mut state,
                        err.code(),
                        &err.message,
                    );
                    break;
                }
            }
        }

        if !state.terminal_sent && !state.awaiting_confirmation {
            let chunk = if session.is_cancelled() {
                StreamChunk::Cancelled {
                    content: state.partial_content(),
                    elapsed_ms: Some(state.started.elapsed().as_millis() as u64),
                }
            } else {
                warn!(conversation_id = %conversation_id, "stream ended without a terminal chunk");
                StreamChunk::Complete {
                    content: state.accumulated.clone(),
                }
            };
            self.emit(&conversation_id, request_id, &mut state, chunk);
        }

        if !state.has_error {
            if let Some(request_id) = request_id {
                self.responder
                    .send_response(request_id, json!({ "success": true }));
            }
        }

        drop(session);
    }

    /// Push one chunk. Returns true when the chunk ended the session.
    fn emit(
        &self,
        conversation_id: &str,
        request_id: Option<&str>,
        state: &mut SessionState,
        chunk: StreamChunk,
    ) -> bool {
        if let StreamChunk::Error { error } = &chunk {
            self.emit_error(
                conversation_id,
                request_id,
                state,
                error_codes::STREAM_ERROR,
                error,
            );
            return true;
        }

        if let StreamChunk::Chunk { chunk: delta } = &chunk {
            state.accumulated.push_str(delta);
        }
        state.awaiting_confirmation = matches!(chunk, StreamChunk::AwaitingConfirmation { .. });

        let terminal = chunk.is_terminal();
        self.responder.push_stream_chunk(conversation_id, chunk);
        if terminal {
            state.terminal_sent = true;
        }
        terminal
    }

    fn emit_error(
        &self,
        conversation_id: &str,
        request_id: Option<&str>,
        state: &mut SessionState,
        code: &str,
        message: &str,
    ) {
        self.responder.push_stream_chunk(
            conversation_id,
            StreamChunk::Error {
                error: message.to_string(),
            },
        );
        state.has_error = true;
        state.terminal_sent = true;
        if let Some(request_id) = request_id {
            self.responder.send_error(request_id, code, message);
        }
    }
}

/// Stream a canned list of chunks. Used by tests and by backends that have
/// their whole answer up front.
pub fn stream_of(chunks: Vec<StreamChunk>) -> ChunkStream {
    futures::stream::iter(chunks.into_iter().map(|c| Ok(StreamUpdate::from(c)))).boxed()
}

/// Checkpoint metadata for the start of a turn.
pub fn turn_checkpoint(conversation_id: &str) -> Value {
    let mut checkpoint = Map::new();
    checkpoint.insert("id".into(), json!(uuid::Uuid::new_v4().to_string()));
    checkpoint.insert("conversationId".into(), json!(conversation_id));
    checkpoint.insert(
        "createdAt".into(),
        json!(chrono::Utc::now().to_rfc3339()),
    );
    Value::Object(checkpoint)
}
