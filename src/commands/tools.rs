use super::message_types;
use crate::app_state::AppState;
use crate::router::MessageRouter;
use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct ExecuteToolPayload {
    name: String,
    #[serde(default)]
    arguments: Value,
}

pub fn register(router: &mut MessageRouter, state: &Arc<AppState>) {
    let s = state.clone();
    router.on_request(message_types::LIST_TOOLS, move |_: IgnoredAny| {
        let state = s.clone();
        async move { Ok(state.tools.definitions()) }
    });

    let s = state.clone();
    router.on_request(message_types::EXECUTE_TOOL, move |p: ExecuteToolPayload| {
        let state = s.clone();
        async move {
            let ctx = state.tool_context();
            let output = state.tools.execute(&p.name, ctx, p.arguments).await?;
            Ok(output)
        }
    });
}
