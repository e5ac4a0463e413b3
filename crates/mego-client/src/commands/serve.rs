//! Serve command: runs a demo engine in the foreground.
//!
//! The demo exposes four methods:
//! - `Sum`: adds a list of integers
//! - `Echo`: returns its params unchanged
//! - `Chat`: broadcasts `[channel, message]` to the `Chat` event
//! - `Upload`: answers with the total size of the received files

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use mego_server::{Context, Engine, EngineConfig, HandlerResult, ServerResult, SocketServer};

use crate::error::{ClientError, ClientResult};

/// Builds the demo engine.
pub fn demo_engine(config: EngineConfig) -> ServerResult<Engine> {
    let mut engine = Engine::with_defaults(config);
    engine.register("Sum", sum)?;
    engine.register("Echo", echo)?;
    engine.register("Chat", chat)?;
    engine.register("Upload", upload)?;
    Ok(engine)
}

/// Serves the demo engine until Ctrl-C.
pub async fn run(config: EngineConfig) -> ClientResult<()> {
    let engine = demo_engine(config).map_err(|e| ClientError::Config(e.to_string()))?;
    let server = SocketServer::bind(Arc::new(engine))
        .await
        .map_err(|e| ClientError::Connection(format!("failed to bind: {}", e)))?;

    let addr = server
        .local_addr()
        .map_err(|e| ClientError::Connection(e.to_string()))?;
    info!(%addr, "serving demo methods");
    println!("mego listening on ws://{}", addr);

    server
        .run_until_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| ClientError::Connection(e.to_string()))
}

fn sum(ctx: &mut Context) -> HandlerResult {
    let values: Vec<i64> = ctx.bind()?;
    ctx.respond(&values.iter().sum::<i64>())
}

fn echo(ctx: &mut Context) -> HandlerResult {
    let value: Value = ctx.bind()?;
    ctx.respond(&value)
}

fn chat(ctx: &mut Context) -> HandlerResult {
    let (channel, message): (String, String) = ctx.bind()?;
    let delivered = ctx.hub().emit("Chat", &channel, &message)?;
    ctx.respond(&delivered)
}

fn upload(ctx: &mut Context) -> HandlerResult {
    let mut total = 0u64;
    for file in ctx.all_files().values().flatten() {
        total += file.size;
        file.remove()?;
    }
    ctx.respond(&total)
}
