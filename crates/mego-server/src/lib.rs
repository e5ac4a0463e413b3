//! Engine: sessions, subscriptions, method dispatch and chunked uploads.
//!
//! This crate provides the mego server runtime:
//! - [`Hub`]: connected sessions and the event → channel → session registry
//! - [`Engine`]: method registry, middleware pipeline and request dispatch
//! - chunked upload coordination with `MegoChunkNext` / `MegoChunkAbort` flow control
//! - [`SocketServer`]: the WebSocket listener feeding frames to the engine
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mego_server::{Context, Engine, EngineConfig, HandlerResult, SocketServer};
//!
//! fn sum(ctx: &mut Context) -> HandlerResult {
//!     let (a, b): (i64, i64) = ctx.bind()?;
//!     ctx.respond(&(a + b))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engine = Engine::with_defaults(EngineConfig::default());
//!     engine.register("Sum", sum)?;
//!
//!     let server = SocketServer::bind(Arc::new(engine)).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

mod chunk;
mod config;
mod context;
mod engine;
mod error;
mod file;
mod hub;
mod method;
pub mod middleware;
mod params;
mod session;
mod socket;

pub use chunk::{ChunkInput, ChunkOutcome, ChunkProcessor, TempFileChunks};
pub use config::EngineConfig;
pub use context::{ChainState, Context};
pub use engine::{Engine, SubscribeAuthorizer};
pub use error::{HandlerError, HandlerResult, ServerError, ServerResult};
pub use file::{File, split_name};
pub use hub::Hub;
pub use method::{Handler, Method, MethodOptions, handler};
pub use middleware::{RateLimitConfig, RequestLimitConfig};
pub use params::{Param, Params};
pub use session::{Outbox, Session};
pub use socket::SocketServer;
