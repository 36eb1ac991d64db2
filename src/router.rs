//! Message router
//!
//! Maps an inbound frame's `type` to a handler. Request handlers resolve to
//! a single value; stream handlers return a chunk stream that the
//! [`StreamMultiplexer`] drives. Every frame carrying a `requestId` gets
//! exactly one `response` or `error` frame back.

use crate::abort_registry::AbortRegistry;
use crate::error::{HandlerError, RouterError};
use crate::frame::{error_codes, InboundFrame};
use crate::responder::Responder;
use crate::stream::{ChunkStream, StreamMultiplexer, StreamSession};
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// What a stream handler receives: the typed payload plus the token the
/// abort registry holds for the conversation.
#[derive(Debug, Clone)]
pub struct StreamRequest<P> {
    pub conversation_id: String,
    pub payload: P,
    pub cancel: CancellationToken,
}

type HandlerFuture<T> = BoxFuture<'static, Result<T, HandlerError>>;

type RequestFn = Arc<dyn Fn(Value) -> HandlerFuture<Value> + Send + Sync>;

type StartStream = Box<dyn FnOnce(String, CancellationToken) -> HandlerFuture<ChunkStream> + Send>;

/// Parses the payload up front so a malformed frame never opens a session.
type StreamFn = Arc<dyn Fn(Value) -> Result<StartStream, HandlerError> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Request(RequestFn),
    Stream(StreamFn),
}

type InitBarrier = Shared<BoxFuture<'static, Result<(), String>>>;

pub struct MessageRouter {
    handlers: HashMap<String, Handler>,
    init: InitBarrier,
    responder: Responder,
    aborts: Arc<AbortRegistry>,
    multiplexer: StreamMultiplexer,
}

impl MessageRouter {
    /// `init` is awaited before every dispatch. It runs once; its result
    /// (success or failure) is shared by all later frames.
    pub fn new<F>(responder: Responder, aborts: Arc<AbortRegistry>, init: F) -> Self
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            handlers: HashMap::new(),
            init: init.boxed().shared(),
            multiplexer: StreamMultiplexer::new(responder.clone()),
            responder,
            aborts,
        }
    }

    /// Router whose init barrier is already satisfied.
    pub fn ready(responder: Responder, aborts: Arc<AbortRegistry>) -> Self {
        Self::new(responder, aborts, futures::future::ready(Ok(())))
    }

    pub fn on_request<P, R, F, Fut>(&mut self, kind: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let run: RequestFn = Arc::new(move |data: Value| {
            let handler = handler.clone();
            async move {
                let payload: P = parse_payload(data)?;
                let result = handler(payload).await?;
                Ok::<Value, HandlerError>(serde_json::to_value(result)?)
            }
            .boxed()
        });
        self.insert(kind, Handler::Request(run));
    }

    /// Register a streaming handler. Its frames must carry
    /// `data.conversationId`; the stream is registered in the abort registry
    /// under that id before the handler runs.
    pub fn on_stream<P, F, Fut>(&mut self, kind: &str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(StreamRequest<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ChunkStream, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let prepare: StreamFn = Arc::new(move |data: Value| -> Result<StartStream, HandlerError> {
            let payload: P = parse_payload(data)?;
            let handler = handler.clone();
            let start: StartStream =
                Box::new(move |conversation_id: String, cancel: CancellationToken| {
                    async move {
                        handler(StreamRequest {
                            conversation_id,
                            payload,
                            cancel,
                        })
                        .await
                    }
                    .boxed()
                });
            Ok(start)
        });
        self.insert(kind, Handler::Stream(prepare));
    }

    fn insert(&mut self, kind: &str, handler: Handler) {
        if self.handlers.insert(kind.to_string(), handler).is_some() {
            warn!(message_type = kind, "handler replaced");
        }
    }

    pub fn message_types(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Wait for the init barrier without dispatching anything.
    pub async fn wait_ready(&self) -> Result<(), RouterError> {
        self.init.clone().await.map_err(RouterError::InitFailed)
    }

    /// Route one frame. Returns once the handler has been started, not when
    /// it finishes. Only a failed init barrier is reported to the caller;
    /// every other failure goes back to the webview as an `error` frame.
    pub async fn dispatch(&self, frame: InboundFrame) -> Result<(), RouterError> {
        if let Err(reason) = self.init.clone().await {
            error!(
                message_type = %frame.kind,
                error = %reason,
                "backend init failed, refusing frame"
            );
            if let Some(request_id) = &frame.request_id {
                self.responder
                    .send_error(request_id, error_codes::INIT_FAILED, &reason);
            }
            return Err(RouterError::InitFailed(reason));
        }

        let InboundFrame {
            kind,
            request_id,
            data,
        } = frame;
        debug!(message_type = %kind, request_id = ?request_id, "dispatching frame");

        let Some(handler) = self.handlers.get(&kind).cloned() else {
            let err = HandlerError::with_code(
                error_codes::UNKNOWN_MESSAGE_TYPE,
                format!("Unknown message type: {}", kind),
            );
            finish_request(&self.responder, &kind, request_id.as_deref(), Err(err));
            return Ok(());
        };

        match handler {
            Handler::Request(run) => {
                let responder = self.responder.clone();
                tokio::spawn(async move {
                    let result = match AssertUnwindSafe(run(data)).catch_unwind().await {
                        Ok(result) => result,
                        Err(panic) => Err(HandlerError::new(panic_message(panic))),
                    };
                    finish_request(&responder, &kind, request_id.as_deref(), result);
                });
            }
            Handler::Stream(prepare) => {
                let Some(conversation_id) = data
                    .get("conversationId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                else {
                    let err = HandlerError::invalid_request("Missing conversationId");
                    finish_request(&self.responder, &kind, request_id.as_deref(), Err(err));
                    return Ok(());
                };
                let start = match prepare(data) {
                    Ok(start) => start,
                    Err(err) => {
                        finish_request(&self.responder, &kind, request_id.as_deref(), Err(err));
                        return Ok(());
                    }
                };

                // Registered before the spawn so an immediate cancelStream
                // finds the entry.
                let session = StreamSession::begin(&self.aborts, &conversation_id);
                let cancel = session.token().clone();
                let multiplexer = self.multiplexer.clone();
                tokio::spawn(async move {
                    let started = AssertUnwindSafe(start(conversation_id, cancel))
                        .catch_unwind()
                        .await;
                    let updates = match started {
                        Ok(Ok(updates)) => updates,
                        Ok(Err(err)) => failed_stream(err),
                        Err(panic) => failed_stream(HandlerError::new(panic_message(panic))),
                    };
                    multiplexer.run(session, request_id, updates).await;
                });
            }
        }
        Ok(())
    }
}

fn parse_payload<P: DeserializeOwned>(data: Value) -> Result<P, HandlerError> {
    serde_json::from_value(data)
        .map_err(|e| HandlerError::invalid_request(format!("Invalid payload: {}", e)))
}

fn failed_stream(err: HandlerError) -> ChunkStream {
    futures::stream::once(async move { Err(err) }).boxed()
}

fn finish_request(
    responder: &Responder,
    kind: &str,
    request_id: Option<&str>,
    result: Result<Value, HandlerError>,
) {
    match (request_id, result) {
        (Some(request_id), Ok(data)) => responder.send_response(request_id, data),
        (Some(request_id), Err(err)) => {
            warn!(
                message_type = kind,
                request_id,
                code = err.code(),
                error = %err,
                "handler failed"
            );
            responder.send_error(request_id, err.code(), &err.message);
        }
        (None, Ok(_)) => debug!(message_type = kind, "notification handled"),
        (None, Err(err)) => {
            warn!(message_type = kind, code = err.code(), error = %err, "notification failed")
        }
    }
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
