use crate::frame::OutboundFrame;
use crate::stream::StreamChunk;
use crate::transport::FrameSink;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Emits terminal frames for request ids and pushes notifications.
///
/// Holds no per-request state: sending exactly one terminal frame per
/// request id is the caller's job (the router and the stream multiplexer).
#[derive(Clone)]
pub struct Responder {
    sink: Arc<dyn FrameSink>,
}

impl Responder {
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self { sink }
    }

    pub fn send_response(&self, request_id: &str, data: Value) {
        if let Err(e) = self.sink.send(OutboundFrame::response(request_id, data)) {
            warn!(request_id, error = %e, "failed to deliver response");
        }
    }

    pub fn send_error(&self, request_id: &str, code: &str, message: &str) {
        if let Err(e) = self
            .sink
            .send(OutboundFrame::error(request_id, code, message))
        {
            warn!(request_id, code, error = %e, "failed to deliver error response");
        }
    }

    /// Best-effort push with no request id. A torn-down view is not an error.
    pub fn push(&self, frame: OutboundFrame) {
        if let Err(e) = self.sink.send(frame) {
            debug!(error = %e, "dropping notification, view unavailable");
        }
    }

    pub fn push_stream_chunk(&self, conversation_id: &str, chunk: StreamChunk) {
        self.push(OutboundFrame::stream_chunk(conversation_id, chunk));
    }
}
