pub mod abort_registry;
pub mod app_state;
pub mod bridge;
pub mod chat;
pub mod commands;
pub mod config;
pub mod conversation_store;
pub mod error;
pub mod events;
pub mod frame;
pub mod logging;
pub mod responder;
pub mod router;
pub mod stream;
pub mod task_registry;
pub mod tools;
pub mod transport;

use crate::bridge::{BridgeServices, ChatViewBridge};
use crate::config::BridgeConfig;
use crate::conversation_store::JsonConversationStore;
use crate::error::StartupError;
use crate::transport::ChannelSink;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Serve the webview protocol over stdin/stdout (one JSON frame per line)
/// with the loopback chat backend, until stdin closes.
pub async fn run_stdio(config: BridgeConfig) -> Result<(), StartupError> {
    let storage_path = config.resolved_storage_path();
    let conversations = Arc::new(JsonConversationStore::new(storage_path.clone())?);
    info!(storage = %storage_path.display(), "conversation storage ready");

    let (sink, rx) = ChannelSink::new();
    let services = BridgeServices::loopback(
        conversations,
        Duration::from_millis(config.stream_chunk_delay_ms),
    );
    let bridge = Arc::new(ChatViewBridge::new(
        Arc::new(sink),
        services,
        async { Ok(()) },
        config.forward_task_events,
    ));

    let writer = tokio::spawn(transport::write_frames(rx, tokio::io::stdout()));

    let dispatcher = bridge.clone();
    let read_result = transport::read_stdin_frames(move |frame| {
        let bridge = dispatcher.clone();
        async move {
            if let Err(e) = bridge.dispatch(frame).await {
                error!(error = %e, "frame refused");
            }
        }
    })
    .await;

    bridge.shutdown();
    drop(bridge);

    // In-flight sessions still hold the sink; give them a moment to flush
    // their terminal frames.
    match tokio::time::timeout(Duration::from_secs(2), writer).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "frame writer stopped with an error"),
        Ok(Err(e)) => warn!(error = %e, "frame writer task failed"),
        Err(_) => warn!("frame writer did not drain before exit"),
        Ok(Ok(Ok(()))) => {}
    }

    read_result?;
    Ok(())
}
