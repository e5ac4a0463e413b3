//! Client correlator, chunk driver and the `mego` command-line interface.
//!
//! ```rust,no_run
//! use mego_client::{Client, FileSource};
//!
//! # async fn run() -> mego_client::ClientResult<()> {
//! let client = Client::new("ws://127.0.0.1:5000").with_key("user", "yami");
//! client.connect().await?;
//!
//! let sum: i64 = client.call("Sum").send(&[3, 4]).end_struct().await?;
//! assert_eq!(sum, 7);
//!
//! client.on("Chat", |event| println!("{:?}", event.bind::<String>()));
//! client.subscribe("Chat", "Room1").await?;
//!
//! client
//!     .call("Upload")
//!     .send_file_chunks(FileSource::from("video.mp4"), None)
//!     .end()
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
mod client;
pub mod commands;
pub mod config;
pub mod error;
mod event;
mod file;
mod request;

pub use client::Client;
pub use config::{ClientConfig, Config};
pub use error::{ClientError, ClientResult, RemoteError};
pub use event::{Event, Listener};
pub use file::{Chunk, ChunkReader, FileSource, ReadSeek};
pub use request::RequestBuilder;
