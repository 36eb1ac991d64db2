use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::StreamChunk;
use crate::task_registry::TaskEvent;

// ==============================================================================
// 0. Error codes
// ==============================================================================

pub mod error_codes {
    /// Handler failed without choosing a more specific code
    pub const HANDLER_ERROR: &str = "HANDLER_ERROR";
    /// No handler is registered for the frame's `type`
    pub const UNKNOWN_MESSAGE_TYPE: &str = "UNKNOWN_MESSAGE_TYPE";
    /// Payload did not match the handler's expected shape
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    /// The one-time backend init barrier failed
    pub const INIT_FAILED: &str = "INIT_FAILED";
    /// A stream producer reported an `error` chunk
    pub const STREAM_ERROR: &str = "STREAM_ERROR";
    pub const TOOL_NOT_FOUND: &str = "TOOL_NOT_FOUND";
    pub const NOT_FOUND: &str = "NOT_FOUND";
}

// ==============================================================================
// 1. Inbound (Webview -> Host)
// ==============================================================================

/// A request frame posted by the webview.
///
/// `request_id` is present when the webview expects a terminal
/// `response`/`error` frame back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl InboundFrame {
    pub fn new(kind: impl Into<String>, request_id: Option<&str>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            request_id: request_id.map(str::to_string),
            data,
        }
    }
}

// ==============================================================================
// 2. Outbound (Host -> Webview)
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameError {
    pub code: String,
    pub message: String,
}

/// Every frame the host posts to the webview.
///
/// `Response` and `Error` are terminal for a request id; everything else is
/// an unsolicited push with no request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundFrame {
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: String,
        success: bool,
        data: Value,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        request_id: String,
        success: bool,
        error: FrameError,
    },
    StreamChunk {
        data: StreamChunkFrame,
    },
    TerminalOutput {
        data: Value,
    },
    ImageGenOutput {
        data: Value,
    },
    TaskEvent {
        data: TaskEvent,
    },
    DependencyProgress {
        data: Value,
    },
    RetryStatus {
        data: Value,
    },
    Command {
        data: Value,
    },
}

impl OutboundFrame {
    pub fn response(request_id: impl Into<String>, data: Value) -> Self {
        Self::Response {
            request_id: request_id.into(),
            success: true,
            data,
        }
    }

    pub fn error(
        request_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Error {
            request_id: request_id.into(),
            success: false,
            error: FrameError {
                code: code.into(),
                message: message.into(),
            },
        }
    }

    pub fn stream_chunk(conversation_id: impl Into<String>, chunk: StreamChunk) -> Self {
        Self::StreamChunk {
            data: StreamChunkFrame {
                conversation_id: conversation_id.into(),
                chunk,
            },
        }
    }

    /// Request id for terminal frames, `None` for pushes.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Response { request_id, .. } | Self::Error { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.request_id().is_some()
    }
}

/// Payload of a `streamChunk` push: the chunk tagged with its conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunkFrame {
    pub conversation_id: String,
    #[serde(flatten)]
    pub chunk: StreamChunk,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_frame_deserialization() {
        let frame: InboundFrame = serde_json::from_value(json!({
            "type": "chatStream",
            "requestId": "r2",
            "data": { "conversationId": "c1", "message": "hi" }
        }))
        .expect("Failed to parse inbound frame");

        assert_eq!(frame.kind, "chatStream");
        assert_eq!(frame.request_id.as_deref(), Some("r2"));
        assert_eq!(frame.data["conversationId"], "c1");

        // data and requestId are both optional on the wire
        let bare: InboundFrame =
            serde_json::from_value(json!({ "type": "conversation.listConversations" }))
                .expect("Failed to parse bare frame");
        assert!(bare.request_id.is_none());
        assert!(bare.data.is_null());
    }

    #[test]
    fn test_terminal_frame_shapes() {
        let response = serde_json::to_value(OutboundFrame::response("r1", json!([]))).unwrap();
        assert_eq!(
            response,
            json!({ "type": "response", "requestId": "r1", "success": true, "data": [] })
        );

        let error =
            serde_json::to_value(OutboundFrame::error("r9", "HANDLER_ERROR", "boom")).unwrap();
        assert_eq!(
            error,
            json!({
                "type": "error",
                "requestId": "r9",
                "success": false,
                "error": { "code": "HANDLER_ERROR", "message": "boom" }
            })
        );
    }

    #[test]
    fn test_stream_chunk_push_shape() {
        let frame = OutboundFrame::stream_chunk(
            "c1",
            StreamChunk::Chunk {
                chunk: "Hel".to_string(),
            },
        );
        assert!(!frame.is_terminal());

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "streamChunk");
        assert_eq!(value["data"]["conversationId"], "c1");
        assert_eq!(value["data"]["type"], "chunk");
        assert_eq!(value["data"]["chunk"], "Hel");
    }

    #[test]
    fn test_push_frame_type_names() {
        let names: Vec<String> = [
            OutboundFrame::TerminalOutput { data: json!({}) },
            OutboundFrame::ImageGenOutput { data: json!({}) },
            OutboundFrame::DependencyProgress { data: json!({}) },
            OutboundFrame::RetryStatus { data: json!({}) },
            OutboundFrame::Command { data: json!({}) },
        ]
        .iter()
        .map(|f| serde_json::to_value(f).unwrap()["type"].as_str().unwrap().to_string())
        .collect();

        assert_eq!(
            names,
            vec![
                "terminalOutput",
                "imageGenOutput",
                "dependencyProgress",
                "retryStatus",
                "command"
            ]
        );
    }
}
