//! Chat backend seam
//!
//! The AI provider is opaque to the bridge: it turns a request into a chunk
//! stream and honours the cancellation token it is handed. The loopback
//! backend echoes the user's message back word by word and is what the
//! binary runs for webview development.

use crate::error::HandlerError;
use crate::stream::{turn_checkpoint, ChunkStream, StreamChunk, StreamUpdate, ToolCall, ToolResult};
use crate::task_registry::TaskRegistry;
use crate::tools::{ToolContext, ToolRegistry};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub conversation_id: String,
    pub message: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Value>,
}

/// The user's answer to an `awaitingConfirmation` chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDecision {
    pub conversation_id: String,
    pub approved: bool,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

pub trait ChatBackend: Send + Sync {
    fn stream_chat(&self, request: ChatRequest, cancel: CancellationToken) -> ChunkStream;

    /// Continue a conversation that paused for tool confirmation.
    fn resume(&self, decision: ToolDecision, cancel: CancellationToken) -> ChunkStream;
}

const TOOL_PREFIX: &str = "/tool ";

pub struct LoopbackBackend {
    tools: Arc<ToolRegistry>,
    tasks: Arc<TaskRegistry>,
    chunk_delay: Duration,
}

impl LoopbackBackend {
    pub fn new(tools: Arc<ToolRegistry>, tasks: Arc<TaskRegistry>, chunk_delay: Duration) -> Self {
        Self {
            tools,
            tasks,
            chunk_delay,
        }
    }
}

impl ChatBackend for LoopbackBackend {
    fn stream_chat(&self, request: ChatRequest, cancel: CancellationToken) -> ChunkStream {
        debug!(conversation_id = %request.conversation_id, "loopback chat");
        let checkpoint = StreamChunk::Checkpoints {
            checkpoints: vec![turn_checkpoint(&request.conversation_id)],
        };

        // `/tool <name> <json args>` asks for confirmation instead of echoing
        if let Some(rest) = request.message.trim().strip_prefix(TOOL_PREFIX) {
            let (name, args) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
            let arguments = if args.trim().is_empty() {
                json!({})
            } else {
                match serde_json::from_str(args) {
                    Ok(value) => value,
                    Err(e) => {
                        return crate::stream::stream_of(vec![
                            checkpoint,
                            StreamChunk::Error {
                                error: format!("Invalid tool arguments: {}", e),
                            },
                        ]);
                    }
                }
            };
            let call = ToolCall {
                id: format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
                name: name.to_string(),
                arguments,
            };
            return crate::stream::stream_of(vec![
                checkpoint,
                StreamChunk::AwaitingConfirmation {
                    pending_tool_calls: vec![call],
                    content: Some(format!("Run tool `{}`?", name)),
                },
            ]);
        }

        let echo = EchoState {
            pending: Some(checkpoint),
            words: request
                .message
                .split_inclusive(' ')
                .map(str::to_string)
                .collect(),
            emitted: String::new(),
            started: Instant::now(),
            cancel,
            delay: self.chunk_delay,
            finished: false,
        };
        futures::stream::unfold(echo, |mut state| async move {
            let update = state.next().await?;
            Some((Ok::<_, HandlerError>(update), state))
        })
        .boxed()
    }

    fn resume(&self, decision: ToolDecision, cancel: CancellationToken) -> ChunkStream {
        if !decision.approved || decision.tool_calls.is_empty() {
            return crate::stream::stream_of(vec![StreamChunk::Complete {
                content: "Tool call rejected.".to_string(),
            }]);
        }

        let resume = ResumeState {
            phase: ResumePhase::Announce,
            calls: decision.tool_calls,
            tools: self.tools.clone(),
            context: ToolContext {
                tasks: self.tasks.clone(),
                cancel,
            },
        };
        futures::stream::unfold(resume, |mut state| async move {
            let update = state.next().await?;
            Some((Ok::<_, HandlerError>(update), state))
        })
        .boxed()
    }
}

struct EchoState {
    pending: Option<StreamChunk>,
    words: VecDeque<String>,
    emitted: String,
    started: Instant,
    cancel: CancellationToken,
    delay: Duration,
    finished: bool,
}

impl EchoState {
    async fn next(&mut self) -> Option<StreamUpdate> {
        if self.finished {
            return None;
        }
        if let Some(chunk) = self.pending.take() {
            return Some(chunk.into());
        }

        let stopped = if self.delay.is_zero() {
            self.cancel.is_cancelled()
        } else {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => true,
                _ = tokio::time::sleep(self.delay) => false,
            }
        };
        if stopped {
            self.finished = true;
            return Some(StreamUpdate {
                cancelled: true,
                content: (!self.emitted.is_empty()).then(|| self.emitted.clone()),
                elapsed_ms: Some(self.started.elapsed().as_millis() as u64),
                ..StreamUpdate::default()
            });
        }

        match self.words.pop_front() {
            Some(word) => {
                self.emitted.push_str(&word);
                Some(StreamChunk::Chunk { chunk: word }.into())
            }
            None => {
                self.finished = true;
                Some(
                    StreamChunk::Complete {
                        content: self.emitted.clone(),
                    }
                    .into(),
                )
            }
        }
    }
}

enum ResumePhase {
    Announce,
    Execute,
    Finish(usize),
    Done,
}

struct ResumeState {
    phase: ResumePhase,
    calls: Vec<ToolCall>,
    tools: Arc<ToolRegistry>,
    context: ToolContext,
}

impl ResumeState {
    async fn next(&mut self) -> Option<StreamUpdate> {
        match self.phase {
            ResumePhase::Announce => {
                self.phase = ResumePhase::Execute;
                Some(
                    StreamChunk::ToolsExecuting {
                        pending_tool_calls: self.calls.clone(),
                    }
                    .into(),
                )
            }
            ResumePhase::Execute => {
                let mut tool_results = Vec::with_capacity(self.calls.len());
                for call in &self.calls {
                    if self.context.cancel.is_cancelled() {
                        break;
                    }
                    let result = self
                        .tools
                        .execute(&call.name, self.context.clone(), call.arguments.clone())
                        .await;
                    let (success, output) = match result {
                        Ok(output) => (true, output),
                        Err(err) => (false, json!({ "error": err.message, "code": err.code() })),
                    };
                    tool_results.push(ToolResult {
                        tool_call_id: call.id.clone(),
                        name: call.name.clone(),
                        success,
                        output,
                    });
                }
                self.phase = ResumePhase::Finish(tool_results.len());
                Some(
                    StreamChunk::ToolIteration {
                        tool_results,
                        content: None,
                    }
                    .into(),
                )
            }
            ResumePhase::Finish(executed) => {
                self.phase = ResumePhase::Done;
                if self.context.cancel.is_cancelled() {
                    return Some(
                        StreamChunk::Cancelled {
                            content: None,
                            elapsed_ms: None,
                        }
                        .into(),
                    );
                }
                Some(
                    StreamChunk::Complete {
                        content: format!("Ran {} tool call(s).", executed),
                    }
                    .into(),
                )
            }
            ResumePhase::Done => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(delay_ms: u64) -> LoopbackBackend {
        LoopbackBackend::new(
            Arc::new(ToolRegistry::with_builtin_tools()),
            Arc::new(TaskRegistry::new()),
            Duration::from_millis(delay_ms),
        )
    }

    fn request(message: &str) -> ChatRequest {
        ChatRequest {
            conversation_id: "c1".to_string(),
            message: message.to_string(),
            model: None,
            attachments: Vec::new(),
        }
    }

    async fn collect(stream: ChunkStream) -> Vec<StreamChunk> {
        stream
            .filter_map(|item| async move { item.ok().and_then(StreamUpdate::classify) })
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_echo_streams_words_then_completes() {
        let updates = backend(0).stream_chat(request("hello big world"), CancellationToken::new());
        let chunks = collect(updates).await;

        assert!(matches!(chunks[0], StreamChunk::Checkpoints { .. }));
        let words: Vec<&str> = chunks
            .iter()
            .filter_map(|c| match c {
                StreamChunk::Chunk { chunk } => Some(chunk.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(words, vec!["hello ", "big ", "world"]);
        assert_eq!(
            chunks.last(),
            Some(&StreamChunk::Complete {
                content: "hello big world".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_echo_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let mut stream = backend(20).stream_chat(request("one two three"), cancel.clone());

        let first = stream.next().await.unwrap().unwrap().classify();
        assert!(matches!(first, Some(StreamChunk::Checkpoints { .. })));
        cancel.cancel();

        let chunks = collect(stream).await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], StreamChunk::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_tool_prefix_requests_confirmation() {
        let chunks = collect(
            backend(0).stream_chat(
                request(r#"/tool execute_command {"command": "ls"}"#),
                CancellationToken::new(),
            ),
        )
        .await;
        match chunks.last() {
            Some(StreamChunk::AwaitingConfirmation {
                pending_tool_calls, ..
            }) => {
                assert_eq!(pending_tool_calls[0].name, "execute_command");
                assert_eq!(pending_tool_calls[0].arguments["command"], "ls");
            }
            other => panic!("unexpected chunk {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_decision_completes() {
        let decision = ToolDecision {
            conversation_id: "c1".to_string(),
            approved: false,
            tool_calls: Vec::new(),
        };
        let chunks = collect(backend(0).resume(decision, CancellationToken::new())).await;
        assert_eq!(
            chunks,
            vec![StreamChunk::Complete {
                content: "Tool call rejected.".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_approved_unknown_tool_reports_failed_result() {
        let decision = ToolDecision {
            conversation_id: "c1".to_string(),
            approved: true,
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: "missing".to_string(),
                arguments: json!({}),
            }],
        };
        let chunks = collect(backend(0).resume(decision, CancellationToken::new())).await;
        assert_eq!(chunks.len(), 3);
        assert!(matches!(chunks[0], StreamChunk::ToolsExecuting { .. }));
        match &chunks[1] {
            StreamChunk::ToolIteration { tool_results, .. } => {
                assert!(!tool_results[0].success);
                assert_eq!(tool_results[0].output["code"], "TOOL_NOT_FOUND");
            }
            other => panic!("unexpected chunk {:?}", other),
        }
        assert!(matches!(chunks[2], StreamChunk::Complete { .. }));
    }
}
