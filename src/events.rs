//! Push notifications from the host to the webview
//!
//! Pushes carry no request id. Besides stream chunks, they are derived from
//! background task activity: every task lifecycle change becomes a
//! `taskEvent` frame, and tool output is re-framed per task type so the
//! webview can route it to the right panel.

use crate::frame::OutboundFrame;
use crate::responder::Responder;
use crate::task_registry::{Subscription, TaskEvent, TaskEventKind, TaskRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task type categories used by the built-in tools
pub mod task_types {
    pub const EXECUTE_COMMAND: &str = "execute_command";
    pub const GENERATE_IMAGE: &str = "generate_image";
    pub const EDIT_IMAGE: &str = "edit_image";
    pub const REMOVE_BACKGROUND: &str = "remove_background";
}

/// Payload for terminalOutput frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutputPayload {
    pub task_id: String,
    pub output: Value,
}

/// Payload for imageGenOutput frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageGenOutputPayload {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub output: Value,
}

/// Frames a task event turns into, in send order.
pub fn frames_for_task_event(event: &TaskEvent) -> Vec<OutboundFrame> {
    let mut frames = Vec::with_capacity(2);
    if let TaskEventKind::Output { data } = &event.kind {
        match event.task_type.as_str() {
            task_types::EXECUTE_COMMAND => frames.push(OutboundFrame::TerminalOutput {
                data: to_value(TerminalOutputPayload {
                    task_id: event.task_id.clone(),
                    output: data.clone(),
                }),
            }),
            task_types::GENERATE_IMAGE | task_types::EDIT_IMAGE | task_types::REMOVE_BACKGROUND => {
                frames.push(OutboundFrame::ImageGenOutput {
                    data: to_value(ImageGenOutputPayload {
                        task_id: event.task_id.clone(),
                        task_type: event.task_type.clone(),
                        output: data.clone(),
                    }),
                })
            }
            _ => {}
        }
    }
    frames.push(OutboundFrame::TaskEvent {
        data: event.clone(),
    });
    frames
}

fn to_value<T: Serialize>(payload: T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// Subscribe to every task event and push it to the webview.
pub fn forward_task_events(tasks: &TaskRegistry, responder: Responder) -> Subscription {
    tasks.on_task_event(move |event| {
        for frame in frames_for_task_event(event) {
            responder.push(frame);
        }
    })
}
