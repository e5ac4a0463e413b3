//! Client commands: call, upload and listen.

use std::path::PathBuf;

use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use mego_protocol::decode_value;

use crate::client::Client;
use crate::error::{ClientError, ClientResult};
use crate::file::FileSource;

/// Calls `method` with JSON `params` and prints the result.
pub async fn call(client: &Client, method: &str, params: Option<&str>) -> ClientResult<()> {
    let params: Value = match params {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| ClientError::Config(format!("params are not valid JSON: {}", e)))?,
        None => Value::Array(Vec::new()),
    };
    debug!(method, "calling");

    let result = client.call(method).send(&params).end().await?;
    print_result(&result)
}

/// Uploads the file at `path` to `method` and prints the result.
pub async fn upload(
    client: &Client,
    method: &str,
    path: PathBuf,
    field: Option<&str>,
    chunked: bool,
    chunk_size: Option<usize>,
) -> ClientResult<()> {
    let source = FileSource::from(path);
    let mut request = client.call(method);
    if let Some(size) = chunk_size {
        request = request.chunk_size(size);
    }
    request = if chunked {
        request.send_file_chunks(source, field)
    } else {
        request.send_file(source, field)
    };

    let result = request.end().await?;
    print_result(&result)
}

/// Subscribes to `event`/`channel` and prints pushes until Ctrl-C.
pub async fn listen(client: &Client, event: &str, channel: &str) -> ClientResult<()> {
    client.on(event, |event| match event.bind::<Value>() {
        Ok(value) => println!("{} {}", event.name, value),
        Err(e) => eprintln!("{}: undecodable payload: {}", event.name, e),
    });
    client.subscribe(event, channel).await?;
    println!("listening on {}/{}", event, channel);

    let _ = tokio::signal::ctrl_c().await;
    client.unsubscribe(event, channel).await
}

fn print_result(result: &Bytes) -> ClientResult<()> {
    if result.is_empty() {
        return Ok(());
    }
    let value: Value = decode_value(result)?;
    let text = serde_json::to_string_pretty(&value)
        .map_err(|e| ClientError::Protocol(format!("failed to render result: {}", e)))?;
    println!("{}", text);
    Ok(())
}
